//! Concurrent evaluator execution with per-evaluator failure isolation.
//!
//! Every configured evaluator runs as its own task and the pipeline waits
//! for all of them. Whatever happens inside one evaluator (bad config,
//! unmet precondition, `Err`, panic in its constructor or its body) ends up
//! as that evaluator's `skipped` result; the others are unaffected. Results
//! keep configuration order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::registry::EvaluatorRegistry;
use super::trait_def::Evaluator;
use super::types::{EvaluationContext, EvaluationResult, RunSnapshot};
use crate::config::EvaluatorSpec;
use crate::workspace::Workspace;

/// Runs a configured evaluator list against one finished agent run.
#[derive(Debug, Clone)]
pub struct EvaluatorPipeline {
    registry: EvaluatorRegistry,
}

impl EvaluatorPipeline {
    pub fn new(registry: EvaluatorRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &EvaluatorRegistry {
        &self.registry
    }

    /// Run every configured evaluator and return exactly one result per
    /// entry, in configuration order.
    ///
    /// Dropping the returned future aborts evaluators still in flight.
    pub async fn run(
        &self,
        specs: &[EvaluatorSpec],
        run: Arc<RunSnapshot>,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Vec<EvaluationResult> {
        let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let registry = Arc::new(self.registry.clone());
        let mut set = JoinSet::new();

        for (index, spec) in specs.iter().enumerate() {
            let ctx = EvaluationContext {
                run: Arc::clone(&run),
                config: spec.config.clone(),
                artifacts_dir: workspace.evaluator_artifacts_dir(&spec.name),
                cancel: cancel.child_token(),
            };
            let registry = Arc::clone(&registry);
            let name = spec.name.clone();
            set.spawn(async move {
                let started = Instant::now();
                let outcome = AssertUnwindSafe(run_one(&registry, &name, ctx))
                    .catch_unwind()
                    .await;
                (index, outcome, started.elapsed())
            });
        }

        let mut results: Vec<Option<EvaluationResult>> = vec![None; specs.len()];
        while let Some(joined) = set.join_next().await {
            let (index, outcome, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "evaluator task did not complete");
                    continue;
                }
            };
            let name = &names[index];
            let mut result = outcome.unwrap_or_else(|panic| {
                let reason = panic_message(panic.as_ref());
                warn!(evaluator = %name, reason = %reason, "evaluator panicked");
                EvaluationResult::skipped(name, format!("evaluator panicked: {reason}"))
            });
            result.evaluator = name.clone();
            result.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            info!(
                evaluator = %name,
                status = ?result.status,
                duration_ms = result.duration_ms,
                "evaluator finished"
            );
            results[index] = Some(result);
        }

        results
            .into_iter()
            .zip(&names)
            .map(|(result, name)| {
                result.unwrap_or_else(|| {
                    EvaluationResult::skipped(name, "evaluator task was aborted")
                })
            })
            .collect()
    }
}

async fn run_one(
    registry: &EvaluatorRegistry,
    name: &str,
    ctx: EvaluationContext,
) -> EvaluationResult {
    let evaluator = match registry.create(name, &ctx.config) {
        Ok(evaluator) => evaluator,
        Err(reason) => {
            warn!(evaluator = name, reason = %reason, "evaluator could not be constructed");
            return EvaluationResult::skipped(name, reason);
        }
    };

    if evaluator.requires_expected_reference() && ctx.expected_dir().is_none() {
        return EvaluationResult::skipped(
            name,
            "requires an expected reference but none was configured",
        );
    }
    if let Err(reason) = evaluator.check_preconditions(&ctx).await {
        info!(evaluator = name, reason = %reason, "evaluator preconditions not met");
        return EvaluationResult::skipped(name, reason);
    }

    match evaluator.evaluate(&ctx).await {
        Ok(result) => result,
        Err(e) => {
            warn!(evaluator = name, error = %e, "evaluator failed");
            EvaluationResult::skipped(name, format!("evaluator error: {e:#}"))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
