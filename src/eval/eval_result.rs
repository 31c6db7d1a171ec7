use serde::Serialize;

/// Treatment returned when no definition-provided treatment can be served.
pub const CONTROL: &str = "control";

/// Reason codes attached to every [`EvaluationResult`].
///
/// Conditions carry their own free-text label which is reported when they match.
pub mod labels {
    /// The flag is killed and serves its default treatment.
    pub const KILLED: &str = "killed";
    /// The key fell outside the flag's traffic allocation.
    pub const NOT_IN_SPLIT: &str = "not in split";
    /// No condition matched.
    pub const DEFAULT_RULE: &str = "default rule";
    /// The flag is not cached or is archived.
    pub const DEFINITION_NOT_FOUND: &str = "definition not found";
    /// The definition uses a matcher this engine does not implement.
    pub const MATCHER_NOT_FOUND: &str = "matcher not found";
    /// A prerequisite flag did not evaluate to an accepted treatment.
    pub const PREREQUISITES_NOT_MET: &str = "prerequisites not met";
    /// Evaluation could not complete, e.g. a dependency cycle.
    pub const EXCEPTION: &str = "exception";
}

/// Outcome of evaluating one flag for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    /// Never empty. Falls back to [`CONTROL`].
    pub treatment: String,
    /// Why `treatment` was returned. See [`labels`].
    pub label: String,
    /// Version of the definition used. `None` if the flag was not found.
    pub change_number: Option<i64>,
    /// Configuration attached to `treatment` in the definition.
    pub config: Option<String>,
    /// Whether impressions for this flag should not be recorded.
    pub impressions_disabled: bool,
}

impl EvaluationResult {
    /// A `control` result with no definition behind it.
    pub(crate) fn control(label: &str) -> EvaluationResult {
        EvaluationResult {
            treatment: CONTROL.to_owned(),
            label: label.to_owned(),
            change_number: None,
            config: None,
            impressions_disabled: false,
        }
    }

    /// Whether the result is the `control` treatment.
    pub fn is_control(&self) -> bool {
        self.treatment == CONTROL
    }
}
