//! Condition and matcher group evaluation: combining matcher results and picking the
//! partition a bucket falls into.
use crate::{
    error::EvaluationError,
    matchers::{MatchContext, MatchInput},
    models::{Combiner, Condition, MatcherGroup},
};

impl Condition {
    /// Whether the condition's matcher group matches the input.
    pub fn matches(
        &self,
        input: &MatchInput<'_>,
        context: &dyn MatchContext,
    ) -> Result<bool, EvaluationError> {
        self.matcher_group.matches(input, context)
    }
}

impl MatcherGroup {
    /// Evaluate every matcher in order, applying each one's negation, and combine the results.
    ///
    /// Matchers are not short-circuited: all of them run even after one fails. An empty group
    /// matches.
    pub fn matches(
        &self,
        input: &MatchInput<'_>,
        context: &dyn MatchContext,
    ) -> Result<bool, EvaluationError> {
        let mut results = Vec::with_capacity(self.matchers.len());
        for matcher in &self.matchers {
            let result = matcher.evaluate(input, context)?;
            results.push(result != matcher.negate);
        }

        Ok(match self.combiner {
            Combiner::And => results.into_iter().all(|r| r),
        })
    }
}
