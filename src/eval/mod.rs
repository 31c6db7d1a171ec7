//! Flag evaluation: status resolution, rule walking and treatment selection.
mod engine;
mod eval_result;
mod evaluator;

pub use eval_result::{labels, EvaluationResult, CONTROL};
pub use evaluator::{Evaluator, MAX_DEPENDENCY_DEPTH};
