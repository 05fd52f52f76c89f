//! The `AgentAdapter` trait -- the contract every agent integration meets.
//!
//! The orchestrator and the judge evaluator only talk to agents through this
//! trait, so adding an agent never touches either of them. The trait is
//! object-safe and stored as `Arc<dyn AgentAdapter>` in the
//! [`super::AdapterRegistry`].

use async_trait::async_trait;
use serde_json::Value;

use super::types::{AgentExecutionResult, ExecutionContext, NormalizedLog};

/// Adapter interface for one external coding agent.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Registry name (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Reject adapter configuration that can never work, before any
    /// resource is acquired. The error names the offending key.
    fn validate_config(&self, _config: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Whether the underlying tool is installed and runnable with `config`.
    ///
    /// Never fails: any problem means `false`.
    async fn check_availability(&self, config: &Value) -> bool;

    /// Run the agent to completion, timeout, or cancellation.
    ///
    /// Never leaks a process past the call and never fails: launch
    /// problems come back as an [`AgentStatus::Failed`] result.
    ///
    /// [`AgentStatus::Failed`]: super::AgentStatus::Failed
    async fn execute(&self, ctx: &ExecutionContext) -> AgentExecutionResult;

    /// Map the agent's raw output onto the shared log schema.
    fn normalize_log(&self, raw_output: &str, result: &AgentExecutionResult) -> NormalizedLog;
}

// Compile-time assertion: AgentAdapter must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentAdapter) {}
};
