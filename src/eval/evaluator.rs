use std::{collections::HashMap, sync::Arc};

use crate::{
    bucketer::HashBucketer,
    error::EvaluationError,
    flag_cache::{FlagCache, FlagSnapshot},
    matchers::{MatchContext, MatchInput},
    models::{FlagDefinition, Status},
    segment_cache::{SegmentCache, SegmentSnapshot},
    Attributes,
};

use super::{
    engine,
    eval_result::{labels, EvaluationResult, CONTROL},
};

/// How deep dependency matchers and prerequisites may nest before evaluation gives up.
pub const MAX_DEPENDENCY_DEPTH: usize = 10;

/// Top-level entry point of flag evaluation.
///
/// Every call works against the cache snapshots current when it starts, so a concurrent sync
/// never changes definitions halfway through an evaluation. Evaluation never fails: errors are
/// reported through [`EvaluationResult::label`].
#[derive(Debug, Clone)]
pub struct Evaluator {
    flags: Arc<FlagCache>,
    segments: Arc<SegmentCache>,
}

impl Evaluator {
    /// Evaluate against the given caches. They are read on each call, never copied.
    pub fn new(flags: Arc<FlagCache>, segments: Arc<SegmentCache>) -> Evaluator {
        Evaluator { flags, segments }
    }

    /// Evaluate `flag_name` for `matching_key`. `bucketing_key` defaults to `matching_key`.
    pub fn eval_treatment(
        &self,
        matching_key: &str,
        bucketing_key: Option<&str>,
        flag_name: &str,
        attributes: Option<&Attributes>,
    ) -> EvaluationResult {
        let (flags, segments) = self.snapshots();
        let scope = EvalScope::new(&flags, &segments);
        let empty = Attributes::new();
        let input = MatchInput {
            matching_key,
            bucketing_key,
            attributes: attributes.unwrap_or(&empty),
        };
        scope.eval_root(flag_name, &input)
    }

    /// Evaluate several flags against the same snapshot.
    pub fn eval_treatments<S: AsRef<str>>(
        &self,
        matching_key: &str,
        bucketing_key: Option<&str>,
        flag_names: &[S],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, EvaluationResult> {
        let (flags, segments) = self.snapshots();
        let names: Vec<&str> = flag_names.iter().map(AsRef::as_ref).collect();
        eval_many(&flags, &segments, matching_key, bucketing_key, &names, attributes)
    }

    /// Evaluate every flag belonging to any of `flag_sets`.
    pub fn eval_treatments_by_flag_sets<S: AsRef<str>>(
        &self,
        matching_key: &str,
        bucketing_key: Option<&str>,
        flag_sets: &[S],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, EvaluationResult> {
        let (flags, segments) = self.snapshots();
        let names = flags.names_by_flag_sets(flag_sets);
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        eval_many(&flags, &segments, matching_key, bucketing_key, &names, attributes)
    }

    fn snapshots(&self) -> (Arc<FlagSnapshot>, Arc<SegmentSnapshot>) {
        (self.flags.snapshot(), self.segments.snapshot())
    }
}

fn eval_many(
    flags: &FlagSnapshot,
    segments: &SegmentSnapshot,
    matching_key: &str,
    bucketing_key: Option<&str>,
    flag_names: &[&str],
    attributes: Option<&Attributes>,
) -> HashMap<String, EvaluationResult> {
    let scope = EvalScope::new(flags, segments);
    let empty = Attributes::new();
    let input = MatchInput {
        matching_key,
        bucketing_key,
        attributes: attributes.unwrap_or(&empty),
    };
    flag_names
        .iter()
        .map(|name| ((*name).to_owned(), scope.eval_root(name, &input)))
        .collect()
}

/// One level of (possibly nested) evaluation over a fixed pair of snapshots.
#[derive(Clone, Copy)]
struct EvalScope<'a> {
    flags: &'a FlagSnapshot,
    segments: &'a SegmentSnapshot,
    depth: usize,
}

impl<'a> EvalScope<'a> {
    fn new(flags: &'a FlagSnapshot, segments: &'a SegmentSnapshot) -> Self {
        EvalScope {
            flags,
            segments,
            depth: 0,
        }
    }

    /// Evaluate at the top level, where no error may escape.
    fn eval_root(&self, flag_name: &str, input: &MatchInput<'_>) -> EvaluationResult {
        let result = match self.evaluate(flag_name, input) {
            Ok(result) => result,
            Err(err) => {
                log::warn!(target: "split",
                           flag_name,
                           key = input.matching_key;
                           "error occurred while evaluating a flag: {err}");
                EvaluationResult {
                    change_number: self.flags.get(flag_name).map(|f| f.change_number),
                    ..EvaluationResult::control(labels::EXCEPTION)
                }
            }
        };

        log::trace!(target: "split",
                    flag_name,
                    key = input.matching_key,
                    treatment = result.treatment.as_str(),
                    label = result.label.as_str();
                    "evaluated a flag");

        result
    }

    /// Resolve flag status, prerequisites and conditions. Only errors that must abort the whole
    /// evaluation are returned.
    fn evaluate(
        &self,
        flag_name: &str,
        input: &MatchInput<'_>,
    ) -> Result<EvaluationResult, EvaluationError> {
        let Some(flag) = self
            .flags
            .get(flag_name)
            .filter(|flag| flag.status != Status::Archived)
        else {
            return Ok(EvaluationResult::control(labels::DEFINITION_NOT_FOUND));
        };

        if flag.killed {
            return Ok(result_for(flag, &flag.default_treatment, labels::KILLED));
        }

        for prerequisite in &flag.prerequisites {
            let treatment = self.evaluate_dependency(
                &prerequisite.flag_name,
                input.matching_key,
                input.bucketing_key,
                input.attributes,
            )?;
            if !prerequisite.treatments.contains(&treatment) {
                return Ok(result_for(
                    flag,
                    &flag.default_treatment,
                    labels::PREREQUISITES_NOT_MET,
                ));
            }
        }

        match engine::decide(flag, input, &HashBucketer, self) {
            Ok(decision) => Ok(result_for(flag, &decision.treatment, &decision.label)),
            Err(EvaluationError::MatcherNotFound(matcher_type)) => {
                log::warn!(target: "split",
                           flag_name,
                           matcher_type = matcher_type.as_str();
                           "flag uses an unsupported matcher");
                Ok(result_for(flag, CONTROL, labels::MATCHER_NOT_FOUND))
            }
            Err(err) => Err(err),
        }
    }
}

fn result_for(flag: &FlagDefinition, treatment: &str, label: &str) -> EvaluationResult {
    EvaluationResult {
        treatment: treatment.to_owned(),
        label: label.to_owned(),
        change_number: Some(flag.change_number),
        config: flag.config_for(treatment).map(str::to_owned),
        impressions_disabled: flag.impressions_disabled,
    }
}

impl MatchContext for EvalScope<'_> {
    fn is_in_segment(&self, segment_name: &str, key: &str) -> bool {
        self.segments.is_member(key, segment_name)
    }

    fn evaluate_dependency(
        &self,
        flag_name: &str,
        matching_key: &str,
        bucketing_key: Option<&str>,
        attributes: &Attributes,
    ) -> Result<String, EvaluationError> {
        if self.depth >= MAX_DEPENDENCY_DEPTH {
            return Err(EvaluationError::DependencyDepthExceeded {
                flag_name: flag_name.to_owned(),
            });
        }

        let nested = EvalScope {
            depth: self.depth + 1,
            ..*self
        };
        let input = MatchInput {
            matching_key,
            bucketing_key,
            attributes,
        };
        Ok(nested.evaluate(flag_name, &input)?.treatment)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::models::FlagDefinition;

    fn flag(value: serde_json::Value) -> FlagDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn simple_flag(name: &str, matchers: serde_json::Value) -> serde_json::Value {
        json!({
            "name": name,
            "defaultTreatment": "off",
            "seed": 1,
            "algo": 2,
            "changeNumber": 10,
            "sets": ["main"],
            "configurations": { "on": "{\"color\":\"blue\"}" },
            "conditions": [{
                "conditionType": "ROLLOUT",
                "matcherGroup": { "combiner": "AND", "matchers": matchers },
                "partitions": [{ "treatment": "on", "size": 100 }],
                "label": "in segment all"
            }]
        })
    }

    fn evaluator(flags: Vec<FlagDefinition>) -> Evaluator {
        let cache = Arc::new(FlagCache::new());
        cache.apply_delta(flags, &[], 10);
        Evaluator::new(cache, Arc::new(SegmentCache::new()))
    }

    fn all_keys() -> serde_json::Value {
        json!([{ "matcherType": "ALL_KEYS" }])
    }

    #[test]
    fn missing_flag_is_control() {
        let result = evaluator(vec![]).eval_treatment("alice", None, "nope", None);
        assert_eq!(result.treatment, CONTROL);
        assert_eq!(result.label, labels::DEFINITION_NOT_FOUND);
        assert_eq!(result.change_number, None);
        assert!(result.is_control());
    }

    #[test]
    fn archived_flag_is_control() {
        let mut value = simple_flag("archived", all_keys());
        value["status"] = json!("ARCHIVED");
        let result = evaluator(vec![flag(value)]).eval_treatment("alice", None, "archived", None);
        assert_eq!(result.label, labels::DEFINITION_NOT_FOUND);
    }

    #[test]
    fn killed_flag_serves_default_treatment() {
        let mut value = simple_flag("killed", all_keys());
        value["killed"] = json!(true);
        let evaluator = evaluator(vec![flag(value)]);
        for key in ["alice", "bob", "carol"] {
            let attributes: Attributes = [("plan".to_owned(), "gold".into())].into_iter().collect();
            let result = evaluator.eval_treatment(key, None, "killed", Some(&attributes));
            assert_eq!(result.treatment, "off");
            assert_eq!(result.label, labels::KILLED);
            assert_eq!(result.change_number, Some(10));
        }
    }

    #[test]
    fn attaches_config_and_change_number() {
        let evaluator = evaluator(vec![flag(simple_flag("f", all_keys()))]);
        let result = evaluator.eval_treatment("alice", None, "f", None);
        assert_eq!(
            result,
            EvaluationResult {
                treatment: "on".to_owned(),
                label: "in segment all".to_owned(),
                change_number: Some(10),
                config: Some("{\"color\":\"blue\"}".to_owned()),
                impressions_disabled: false,
            }
        );
    }

    #[test]
    fn unsupported_matcher_is_control() {
        let evaluator = evaluator(vec![flag(simple_flag(
            "f",
            json!([{ "matcherType": "IN_LARGE_SEGMENT" }]),
        ))]);
        let result = evaluator.eval_treatment("alice", None, "f", None);
        assert_eq!(result.treatment, CONTROL);
        assert_eq!(result.label, labels::MATCHER_NOT_FOUND);
        assert_eq!(result.change_number, Some(10));
    }

    #[test]
    fn segment_matcher_uses_segment_cache() {
        let flags = Arc::new(FlagCache::new());
        flags.apply_delta(
            vec![flag(simple_flag(
                "f",
                json!([{
                    "matcherType": "IN_SEGMENT",
                    "userDefinedSegmentMatcherData": { "segmentName": "beta" }
                }]),
            ))],
            &[],
            10,
        );
        let segments = Arc::new(SegmentCache::new());
        segments.apply_delta("alice", &["beta".to_owned()], &[], 1);
        let evaluator = Evaluator::new(flags, segments);

        assert_eq!(evaluator.eval_treatment("alice", None, "f", None).treatment, "on");
        assert_eq!(evaluator.eval_treatment("bob", None, "f", None).treatment, "off");
    }

    #[test]
    fn dependency_matcher_recurses() {
        let parent = simple_flag(
            "parent",
            json!([{
                "matcherType": "WHITELIST",
                "whitelistMatcherData": { "whitelist": ["alice"] }
            }]),
        );
        let child = simple_flag(
            "child",
            json!([{
                "matcherType": "IN_SPLIT_TREATMENT",
                "dependencyMatcherData": { "split": "parent", "treatments": ["on"] }
            }]),
        );
        let evaluator = evaluator(vec![flag(parent), flag(child)]);
        assert_eq!(evaluator.eval_treatment("alice", None, "child", None).treatment, "on");
        assert_eq!(evaluator.eval_treatment("bob", None, "child", None).treatment, "off");
    }

    #[test]
    fn dependency_cycle_is_an_exception() {
        let a = simple_flag(
            "a",
            json!([{
                "matcherType": "IN_SPLIT_TREATMENT",
                "dependencyMatcherData": { "split": "b", "treatments": ["on"] }
            }]),
        );
        let b = simple_flag(
            "b",
            json!([{
                "matcherType": "IN_SPLIT_TREATMENT",
                "dependencyMatcherData": { "split": "a", "treatments": ["on"] }
            }]),
        );
        let result = evaluator(vec![flag(a), flag(b)]).eval_treatment("alice", None, "a", None);
        assert_eq!(result.treatment, CONTROL);
        assert_eq!(result.label, labels::EXCEPTION);
        assert_eq!(result.change_number, Some(10));
    }

    #[test]
    fn prerequisites_gate_conditions() {
        let gate = simple_flag(
            "gate",
            json!([{
                "matcherType": "WHITELIST",
                "whitelistMatcherData": { "whitelist": ["alice"] }
            }]),
        );
        let mut gated = simple_flag("gated", all_keys());
        gated["prerequisites"] = json!([{ "n": "gate", "ts": ["on"] }]);
        let evaluator = evaluator(vec![flag(gate), flag(gated)]);

        assert_eq!(evaluator.eval_treatment("alice", None, "gated", None).treatment, "on");
        let result = evaluator.eval_treatment("bob", None, "gated", None);
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, labels::PREREQUISITES_NOT_MET);
    }

    #[test]
    fn evaluates_many_and_by_flag_set() {
        let mut other = simple_flag("other", all_keys());
        other["sets"] = json!(["secondary"]);
        let evaluator = evaluator(vec![
            flag(simple_flag("a", all_keys())),
            flag(simple_flag("b", all_keys())),
            flag(other),
        ]);

        let results = evaluator.eval_treatments("alice", None, &["a", "missing"], None);
        assert_eq!(results.len(), 2);
        assert_eq!(results["a"].treatment, "on");
        assert_eq!(results["missing"].treatment, CONTROL);

        let results = evaluator.eval_treatments_by_flag_sets("alice", None, &["main"], None);
        let mut names: Vec<_> = results.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
