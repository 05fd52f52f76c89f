//! Types shared by the evaluator pipeline and the evaluators.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentExecutionResult, NormalizedLog};

/// Read-only facts about the finished agent run, shared by every evaluator.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run_id: String,
    pub task: String,
    /// Adapter the agent under test ran with, and its configuration.
    pub agent_adapter: String,
    pub agent_config: Value,
    /// Tree the agent modified.
    pub modified_dir: PathBuf,
    /// Known-good reference tree, if configured.
    pub expected_dir: Option<PathBuf>,
    /// Commit the agent started from.
    pub base_commit: String,
    pub agent_result: AgentExecutionResult,
    pub log: NormalizedLog,
}

/// Input to one evaluator.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub run: Arc<RunSnapshot>,
    /// This evaluator's configuration.
    pub config: Value,
    /// Directory this evaluator may write artifacts into. Created lazily by
    /// [`EvaluationContext::ensure_artifacts_dir`].
    pub artifacts_dir: PathBuf,
    /// Cancelled when the run is aborted; evaluators that start processes
    /// hand it on.
    pub cancel: CancellationToken,
}

impl EvaluationContext {
    pub fn modified_dir(&self) -> &Path {
        &self.run.modified_dir
    }

    pub fn expected_dir(&self) -> Option<&Path> {
        self.run.expected_dir.as_deref()
    }

    /// Create the artifacts directory and return it.
    pub fn ensure_artifacts_dir(&self) -> std::io::Result<&Path> {
        std::fs::create_dir_all(&self.artifacts_dir)?;
        Ok(&self.artifacts_dir)
    }

    /// Write `contents` to `name` inside the artifacts directory and return
    /// the path relative to the run's `artifacts/` directory.
    pub fn write_artifact(&self, name: &str, contents: &str) -> std::io::Result<String> {
        let dir = self.ensure_artifacts_dir()?;
        std::fs::write(dir.join(name), contents)?;
        Ok(self.artifact_ref(name))
    }

    fn artifact_ref(&self, name: &str) -> String {
        let evaluator_dir = self
            .artifacts_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!(
            "{}/{evaluator_dir}/{name}",
            crate::workspace::EVALUATOR_ARTIFACTS_DIR
        )
    }
}

/// Verdict of one evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Passed,
    Failed,
    /// Could not be evaluated; `error` says why.
    Skipped,
}

/// Output of one evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Configured name (e.g. `agentic-judge:security`).
    pub evaluator: String,
    pub status: EvaluationStatus,
    /// Evaluator-defined metrics.
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    pub message: String,
    pub duration_ms: u64,
    /// Paths relative to the run's `artifacts/` directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Present exactly when `status` is `skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationResult {
    fn with_status(evaluator: &str, status: EvaluationStatus, message: impl Into<String>) -> Self {
        Self {
            evaluator: evaluator.to_string(),
            status,
            metrics: BTreeMap::new(),
            message: message.into(),
            duration_ms: 0,
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn passed(evaluator: &str, message: impl Into<String>) -> Self {
        Self::with_status(evaluator, EvaluationStatus::Passed, message)
    }

    pub fn failed(evaluator: &str, message: impl Into<String>) -> Self {
        Self::with_status(evaluator, EvaluationStatus::Failed, message)
    }

    /// `passed` if `ok`, else `failed`.
    pub fn verdict(evaluator: &str, ok: bool, message: impl Into<String>) -> Self {
        if ok {
            Self::passed(evaluator, message)
        } else {
            Self::failed(evaluator, message)
        }
    }

    pub fn skipped(evaluator: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut result = Self::with_status(
            evaluator,
            EvaluationStatus::Skipped,
            format!("skipped: {error}"),
        );
        result.error = Some(error);
        result
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_carries_error() {
        let result = EvaluationResult::skipped("expected-diff", "no expected tree");
        assert_eq!(result.status, EvaluationStatus::Skipped);
        assert_eq!(result.error.as_deref(), Some("no expected tree"));
        assert!(result.message.contains("no expected tree"));
    }

    #[test]
    fn verdict_and_metrics() {
        let result = EvaluationResult::verdict("diff-summary", false, "too big")
            .with_metric("files_changed", 12);
        assert_eq!(result.status, EvaluationStatus::Failed);
        assert!(result.error.is_none());
        assert_eq!(result.metrics["files_changed"], 12);
    }

    #[test]
    fn serialized_shape() {
        let json = serde_json::to_value(EvaluationResult::passed("x", "ok")).unwrap();
        assert_eq!(json["status"], "passed");
        assert!(json.get("error").is_none());
        assert!(json.get("artifacts").is_none());
    }
}
