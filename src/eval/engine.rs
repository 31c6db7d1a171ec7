use crate::{
    bucketer::Bucketer,
    error::EvaluationError,
    matchers::{MatchContext, MatchInput},
    models::{ConditionType, FlagDefinition, Partition},
};

use super::eval_result::{labels, CONTROL};

/// Treatment and label picked by [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Decision {
    pub treatment: String,
    pub label: String,
}

impl Decision {
    fn new(treatment: &str, label: &str) -> Decision {
        Decision {
            treatment: treatment.to_owned(),
            label: label.to_owned(),
        }
    }
}

/// Walk the flag's conditions in order and pick a treatment for the key.
///
/// Traffic allocation is checked once, on the first rollout condition reached. Whitelist
/// conditions before it are not subject to it.
pub(crate) fn decide(
    flag: &FlagDefinition,
    input: &MatchInput<'_>,
    bucketer: &impl Bucketer,
    context: &dyn MatchContext,
) -> Result<Decision, EvaluationError> {
    let bucketing_key = input.bucketing_key.unwrap_or(input.matching_key);
    let mut in_rollout = false;

    for condition in &flag.conditions {
        if !in_rollout && condition.condition_type == ConditionType::Rollout {
            if flag.traffic_allocation < 100 {
                let seed = flag.traffic_allocation_seed.unwrap_or(flag.seed);
                let bucket = bucketer.bucket(bucketing_key, seed, flag.algo);
                if bucket > flag.traffic_allocation {
                    return Ok(Decision::new(
                        &flag.default_treatment,
                        labels::NOT_IN_SPLIT,
                    ));
                }
            }
            in_rollout = true;
        }

        if condition.matches(input, context)? {
            let bucket = bucketer.bucket(bucketing_key, flag.seed, flag.algo);
            let treatment = select_partition(&condition.partitions, bucket).unwrap_or(CONTROL);
            return Ok(Decision::new(treatment, &condition.label));
        }
    }

    Ok(Decision::new(&flag.default_treatment, labels::DEFAULT_RULE))
}

/// First partition whose cumulative size reaches `bucket`.
fn select_partition(partitions: &[Partition], bucket: u32) -> Option<&str> {
    let mut covered = 0;
    partitions.iter().find_map(|partition| {
        covered += partition.size;
        (covered >= bucket).then_some(partition.treatment.as_str())
    })
}
