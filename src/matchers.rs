//! Leaf predicates of a condition's matcher group.
use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    attributes::{AttributeValue, Attributes},
    error::EvaluationError,
    models::{DataType, MatcherWire, WhitelistData},
    semver::Semver,
};

/// Capabilities a matcher needs from the evaluation that runs it.
///
/// Lets [`MatcherKind::InSegment`] consult segment membership and [`MatcherKind::Dependency`]
/// recurse into another flag without the matcher owning the caches.
pub trait MatchContext {
    /// Whether `key` belongs to `segment_name`.
    fn is_in_segment(&self, segment_name: &str, key: &str) -> bool;

    /// Evaluate `flag_name` for the same key and attributes, returning its treatment.
    fn evaluate_dependency(
        &self,
        flag_name: &str,
        matching_key: &str,
        bucketing_key: Option<&str>,
        attributes: &Attributes,
    ) -> Result<String, EvaluationError>;
}

/// Caller-supplied inputs every matcher of a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MatchInput<'a> {
    /// Key the flag is evaluated for.
    pub matching_key: &'a str,
    /// Key used for bucketing when it differs from the matching key.
    pub bucketing_key: Option<&'a str>,
    /// Attributes matchers with a selector read from.
    pub attributes: &'a Attributes,
}

/// A single matcher: the predicate, its attribute selector and the negate flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "MatcherWire", into = "MatcherWire")]
pub struct Matcher {
    /// Predicate with its configured payload.
    pub kind: MatcherKind,
    /// Attribute the predicate applies to. `None` means the matching key.
    pub attribute: Option<String>,
    /// Negation, applied by the condition, not by [`Matcher::evaluate`].
    pub negate: bool,
    /// Definition as received. Decoding drops invalid payloads, so this is what gets serialized.
    wire: MatcherWire,
}

/// Matcher predicates. Each variant carries the payload it was configured with.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum MatcherKind {
    AllKeys,
    Whitelist(HashSet<String>),
    InSegment(String),
    EqualTo { data_type: DataType, value: i64 },
    GreaterThanOrEqualTo { data_type: DataType, value: i64 },
    LessThanOrEqualTo { data_type: DataType, value: i64 },
    Between { data_type: DataType, start: i64, end: i64 },
    EqualToSet(HashSet<String>),
    ContainsAnyOfSet(HashSet<String>),
    ContainsAllOfSet(HashSet<String>),
    PartOfSet(HashSet<String>),
    StartsWith(Vec<String>),
    EndsWith(Vec<String>),
    ContainsString(Vec<String>),
    /// `None` if the configured expression does not compile. Never matches.
    MatchesString(Option<Regex>),
    EqualToBoolean(bool),
    Dependency { split: String, treatments: Vec<String> },
    /// Semver payloads are `None` when the configured version does not parse. Never matches.
    EqualToSemver(Option<Semver>),
    GreaterThanOrEqualToSemver(Option<Semver>),
    LessThanOrEqualToSemver(Option<Semver>),
    BetweenSemver {
        start: Option<Semver>,
        end: Option<Semver>,
    },
    InListSemver(HashSet<Semver>),
    /// Matcher type this engine does not implement, or one missing its payload.
    Unsupported(String),
}

impl From<MatcherWire> for Matcher {
    fn from(wire: MatcherWire) -> Self {
        let attribute = wire
            .key_selector
            .as_ref()
            .and_then(|selector| selector.attribute.clone());
        let kind = MatcherKind::decode(&wire.matcher_type, wire.clone())
            .unwrap_or_else(|| MatcherKind::Unsupported(wire.matcher_type.clone()));
        Matcher {
            kind,
            attribute,
            negate: wire.negate,
            wire,
        }
    }
}

impl From<Matcher> for MatcherWire {
    fn from(matcher: Matcher) -> Self {
        matcher.wire
    }
}

impl MatcherKind {
    /// Returns `None` for unknown types and for known types whose payload is missing.
    fn decode(matcher_type: &str, wire: MatcherWire) -> Option<MatcherKind> {
        let kind = match matcher_type {
            "ALL_KEYS" => MatcherKind::AllKeys,
            "WHITELIST" => MatcherKind::Whitelist(whitelist_set(wire.whitelist_matcher_data)?),
            "IN_SEGMENT" => {
                MatcherKind::InSegment(wire.user_defined_segment_matcher_data?.segment_name)
            }
            "EQUAL_TO" => {
                let data = wire.unary_numeric_matcher_data?;
                MatcherKind::EqualTo {
                    data_type: data.data_type,
                    value: data.value,
                }
            }
            "GREATER_THAN_OR_EQUAL_TO" => {
                let data = wire.unary_numeric_matcher_data?;
                MatcherKind::GreaterThanOrEqualTo {
                    data_type: data.data_type,
                    value: data.value,
                }
            }
            "LESS_THAN_OR_EQUAL_TO" => {
                let data = wire.unary_numeric_matcher_data?;
                MatcherKind::LessThanOrEqualTo {
                    data_type: data.data_type,
                    value: data.value,
                }
            }
            "BETWEEN" => {
                let data = wire.between_matcher_data?;
                MatcherKind::Between {
                    data_type: data.data_type,
                    start: data.start,
                    end: data.end,
                }
            }
            "EQUAL_TO_SET" => MatcherKind::EqualToSet(whitelist_set(wire.whitelist_matcher_data)?),
            "CONTAINS_ANY_OF_SET" => {
                MatcherKind::ContainsAnyOfSet(whitelist_set(wire.whitelist_matcher_data)?)
            }
            "CONTAINS_ALL_OF_SET" => {
                MatcherKind::ContainsAllOfSet(whitelist_set(wire.whitelist_matcher_data)?)
            }
            "PART_OF_SET" => MatcherKind::PartOfSet(whitelist_set(wire.whitelist_matcher_data)?),
            "STARTS_WITH" => MatcherKind::StartsWith(wire.whitelist_matcher_data?.whitelist),
            "ENDS_WITH" => MatcherKind::EndsWith(wire.whitelist_matcher_data?.whitelist),
            "CONTAINS_STRING" => {
                MatcherKind::ContainsString(wire.whitelist_matcher_data?.whitelist)
            }
            "MATCHES_STRING" => {
                let pattern = wire.string_matcher_data?;
                let regex = Regex::new(&pattern)
                    .map_err(|err| {
                        log::warn!(target: "split", pattern; "invalid regex in MATCHES_STRING matcher: {err}");
                    })
                    .ok();
                MatcherKind::MatchesString(regex)
            }
            "EQUAL_TO_BOOLEAN" => MatcherKind::EqualToBoolean(wire.boolean_matcher_data?),
            "IN_SPLIT_TREATMENT" => {
                let data = wire.dependency_matcher_data?;
                MatcherKind::Dependency {
                    split: data.split,
                    treatments: data.treatments,
                }
            }
            "EQUAL_TO_SEMVER" => {
                MatcherKind::EqualToSemver(parse_semver(&wire.string_matcher_data?))
            }
            "GREATER_THAN_OR_EQUAL_TO_SEMVER" => {
                MatcherKind::GreaterThanOrEqualToSemver(parse_semver(&wire.string_matcher_data?))
            }
            "LESS_THAN_OR_EQUAL_TO_SEMVER" => {
                MatcherKind::LessThanOrEqualToSemver(parse_semver(&wire.string_matcher_data?))
            }
            "BETWEEN_SEMVER" => {
                let data = wire.between_string_matcher_data?;
                MatcherKind::BetweenSemver {
                    start: parse_semver(&data.start),
                    end: parse_semver(&data.end),
                }
            }
            "IN_LIST_SEMVER" => MatcherKind::InListSemver(
                wire.whitelist_matcher_data?
                    .whitelist
                    .iter()
                    .filter_map(|v| parse_semver(v))
                    .collect(),
            ),
            _ => return None,
        };
        Some(kind)
    }
}

fn whitelist_set(data: Option<WhitelistData>) -> Option<HashSet<String>> {
    Some(data?.whitelist.into_iter().collect())
}

fn parse_semver(version: &str) -> Option<Semver> {
    Semver::parse(version)
        .map_err(|err| {
            log::warn!(target: "split", version; "invalid semver in matcher definition: {err}");
        })
        .ok()
}

/// The value a matcher is applied to.
#[derive(Debug, Clone, Copy)]
enum Operand<'a> {
    Key(&'a str),
    Attribute(&'a AttributeValue),
}

impl<'a> Operand<'a> {
    fn as_str(&self) -> Option<&'a str> {
        match self {
            Operand::Key(key) => Some(key),
            Operand::Attribute(value) => value.as_str(),
        }
    }

    /// Integer view of the operand. Non-integral numbers have none.
    fn as_integer(&self) -> Option<i64> {
        match self {
            Operand::Key(key) => key.trim().parse().ok(),
            Operand::Attribute(AttributeValue::Number(n)) => {
                (n.is_finite() && n.fract() == 0.0).then_some(*n as i64)
            }
            Operand::Attribute(AttributeValue::String(s)) => s.trim().parse().ok(),
            Operand::Attribute(AttributeValue::DateTime(dt)) => Some(dt.timestamp_millis()),
            Operand::Attribute(AttributeValue::Boolean(_) | AttributeValue::List(_)) => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Operand::Attribute(AttributeValue::Boolean(b)) => Some(*b),
            _ => {
                let s = self.as_str()?;
                if s.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if s.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None
                }
            }
        }
    }

    fn as_set(&self) -> Option<HashSet<&'a str>> {
        match self {
            Operand::Attribute(AttributeValue::List(items)) => {
                Some(items.iter().map(String::as_str).collect())
            }
            _ => None,
        }
    }

    fn as_semver(&self) -> Option<Semver> {
        Semver::parse(self.as_str()?).ok()
    }
}

/// Truncate an operand to the granularity of its data type. Day for equality, minute for
/// ordering comparisons. Works on raw milliseconds so any `i64` timestamp is accepted.
fn normalize(data_type: DataType, value: i64, unit_ms: i64) -> i64 {
    match data_type {
        DataType::Number => value,
        DataType::Datetime => value.div_euclid(unit_ms) * unit_ms,
    }
}

const DAY_MS: i64 = 86_400_000;
const MINUTE_MS: i64 = 60_000;

impl Matcher {
    /// Resolve the operand and apply the predicate. Negation is not applied.
    ///
    /// A missing selected attribute does not match. Dependency matchers always receive the
    /// raw matching key, bucketing key and attributes.
    pub fn evaluate(
        &self,
        input: &MatchInput<'_>,
        context: &dyn MatchContext,
    ) -> Result<bool, EvaluationError> {
        match &self.kind {
            MatcherKind::Unsupported(matcher_type) => {
                Err(EvaluationError::MatcherNotFound(matcher_type.clone()))
            }
            MatcherKind::Dependency { split, treatments } => {
                let treatment = context.evaluate_dependency(
                    split,
                    input.matching_key,
                    input.bucketing_key,
                    input.attributes,
                )?;
                Ok(treatments.contains(&treatment))
            }
            kind => {
                let operand = match &self.attribute {
                    Some(attribute) => match input.attributes.get(attribute) {
                        Some(value) => Operand::Attribute(value),
                        None => return Ok(false),
                    },
                    None => Operand::Key(input.matching_key),
                };
                Ok(kind.try_eval(operand, context).unwrap_or(false))
            }
        }
    }
}

impl MatcherKind {
    /// Apply the predicate, returning `None` if the operand has the wrong shape for it.
    fn try_eval(&self, operand: Operand<'_>, context: &dyn MatchContext) -> Option<bool> {
        let result = match self {
            MatcherKind::AllKeys => true,
            MatcherKind::Whitelist(items) => items.contains(operand.as_str()?),
            MatcherKind::InSegment(segment_name) => {
                context.is_in_segment(segment_name, operand.as_str()?)
            }

            MatcherKind::EqualTo { data_type, value } => {
                normalize(*data_type, operand.as_integer()?, DAY_MS)
                    == normalize(*data_type, *value, DAY_MS)
            }
            MatcherKind::GreaterThanOrEqualTo { data_type, value } => {
                normalize(*data_type, operand.as_integer()?, MINUTE_MS)
                    >= normalize(*data_type, *value, MINUTE_MS)
            }
            MatcherKind::LessThanOrEqualTo { data_type, value } => {
                normalize(*data_type, operand.as_integer()?, MINUTE_MS)
                    <= normalize(*data_type, *value, MINUTE_MS)
            }
            MatcherKind::Between {
                data_type,
                start,
                end,
            } => {
                let v = normalize(*data_type, operand.as_integer()?, MINUTE_MS);
                let start = normalize(*data_type, *start, MINUTE_MS);
                let end = normalize(*data_type, *end, MINUTE_MS);
                start <= v && v <= end
            }

            MatcherKind::EqualToSet(items) => {
                let set = operand.as_set()?;
                set.len() == items.len() && items.iter().all(|i| set.contains(i.as_str()))
            }
            MatcherKind::ContainsAnyOfSet(items) => {
                let set = operand.as_set()?;
                items.iter().any(|i| set.contains(i.as_str()))
            }
            MatcherKind::ContainsAllOfSet(items) => {
                let set = operand.as_set()?;
                items.iter().all(|i| set.contains(i.as_str()))
            }
            MatcherKind::PartOfSet(items) => {
                let set = operand.as_set()?;
                !set.is_empty() && set.iter().all(|s| items.contains(*s))
            }

            MatcherKind::StartsWith(prefixes) => {
                let s = operand.as_str()?;
                prefixes.iter().any(|p| s.starts_with(p.as_str()))
            }
            MatcherKind::EndsWith(suffixes) => {
                let s = operand.as_str()?;
                suffixes.iter().any(|p| s.ends_with(p.as_str()))
            }
            MatcherKind::ContainsString(needles) => {
                let s = operand.as_str()?;
                needles.iter().any(|p| s.contains(p.as_str()))
            }
            MatcherKind::MatchesString(regex) => regex.as_ref()?.is_match(operand.as_str()?),

            MatcherKind::EqualToBoolean(expected) => operand.as_bool()? == *expected,

            MatcherKind::EqualToSemver(expected) => operand.as_semver()? == *expected.as_ref()?,
            MatcherKind::GreaterThanOrEqualToSemver(bound) => {
                operand.as_semver()? >= *bound.as_ref()?
            }
            MatcherKind::LessThanOrEqualToSemver(bound) => {
                operand.as_semver()? <= *bound.as_ref()?
            }
            MatcherKind::BetweenSemver { start, end } => {
                let v = operand.as_semver()?;
                *start.as_ref()? <= v && v <= *end.as_ref()?
            }
            MatcherKind::InListSemver(versions) => versions.contains(&operand.as_semver()?),

            // Resolved before the operand is computed.
            MatcherKind::Dependency { .. } | MatcherKind::Unsupported(_) => return None,
        };
        Some(result)
    }
}
