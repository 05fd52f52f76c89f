//! The `Evaluator` trait.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{EvaluationContext, EvaluationResult};

/// One pluggable quality check over a finished run.
///
/// `evaluate` returns `Ok` for every condition the evaluator understands,
/// including the ones that end in `skipped`. `Err` (or a panic) is reserved
/// for faults; the pipeline turns those into `skipped` results too.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Configured name; named instances keep their suffix
    /// (`agentic-judge:security`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether the evaluator needs the expected reference tree.
    fn requires_expected_reference(&self) -> bool {
        false
    }

    /// `Err(reason)` when the evaluator cannot run for this context; the
    /// pipeline records the reason as a skip.
    async fn check_preconditions(&self, _ctx: &EvaluationContext) -> Result<(), String> {
        Ok(())
    }

    async fn evaluate(&self, ctx: &EvaluationContext) -> Result<EvaluationResult>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Evaluator) {}
};
