//! The persisted outcome of a run.
//!
//! `artifacts/results.json` is the only contract consumed by reporting and
//! export tooling. It is written once, at the end of a run, and never
//! rewritten.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{AgentError, AgentExecutionResult, AgentStatus, NormalizedLog, TokenUsage};
use crate::evaluator::{EvaluationResult, EvaluationStatus};
use crate::orchestrator::StateTransition;

pub const SCHEMA_VERSION: u32 = 1;
pub const RESULTS_FILE: &str = "results.json";
pub const LOG_FILE: &str = "log.json";

/// Keys whose values differ between otherwise identical runs. Keys ending
/// in `duration_ms` are dropped as well.
const NON_DETERMINISTIC_KEYS: &[&str] = &["run_id", "workspace", "started_at", "finished_at", "at"];

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Passed,
    Failed,
    Partial,
}

/// Counts over the evaluator results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub overall_status: OverallStatus,
}

impl Summary {
    /// `failed` if any evaluator failed, else `partial` if any skipped,
    /// else `passed` (including when there are no evaluators).
    pub fn from_results(results: &[EvaluationResult]) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let passed = count(EvaluationStatus::Passed);
        let failed = count(EvaluationStatus::Failed);
        let skipped = count(EvaluationStatus::Skipped);
        let overall_status = if failed > 0 {
            OverallStatus::Failed
        } else if skipped > 0 {
            OverallStatus::Partial
        } else {
            OverallStatus::Passed
        };
        Self {
            total: results.len(),
            passed,
            failed,
            skipped,
            overall_status,
        }
    }
}

/// What was run, against what, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub task: String,
    pub repository_url: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub base_commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_commit: Option<String>,
    pub adapter: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub workspace: PathBuf,
    /// Every state the run passed through.
    pub states: Vec<StateTransition>,
}

/// Agent outcome as recorded in the bundle. The raw output lives in
/// `log.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub adapter: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub errors: Vec<AgentError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl AgentSummary {
    pub fn new(adapter: &str, result: &AgentExecutionResult, log: &NormalizedLog) -> Self {
        Self {
            adapter: adapter.to_string(),
            status: result.status,
            exit_code: result.exit_code,
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms: result.duration_ms,
            errors: result.errors.clone(),
            session_id: log.session_id.clone(),
            model: log.model.clone(),
            usage: log.usage,
            cost_usd: log.cost_usd,
        }
    }
}

/// The complete, immutable outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsBundle {
    pub schema_version: u32,
    pub run: RunMetadata,
    pub agent: AgentSummary,
    /// One entry per configured evaluator, in configuration order.
    pub evaluators: Vec<EvaluationResult>,
    pub summary: Summary,
}

impl ResultsBundle {
    pub fn new(run: RunMetadata, agent: AgentSummary, evaluators: Vec<EvaluationResult>) -> Self {
        let summary = Summary::from_results(&evaluators);
        Self {
            schema_version: SCHEMA_VERSION,
            run,
            agent,
            evaluators,
            summary,
        }
    }

    /// Write the bundle as pretty JSON. Fails if `path` already exists.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize results")?;
        write_once(path, &json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// The bundle as JSON with timestamps, durations, run id, and
    /// workspace path removed, for comparing runs byte for byte.
    pub fn comparable(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self).context("failed to serialize results")?;
        strip_non_deterministic(&mut value);
        Ok(value)
    }
}

fn strip_non_deterministic(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| {
                !NON_DETERMINISTIC_KEYS.contains(&key.as_str()) && !key.ends_with("duration_ms")
            });
            map.values_mut().for_each(strip_non_deterministic);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_non_deterministic),
        _ => {}
    }
}

/// Contents of `artifacts/log.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLogFile {
    pub log: NormalizedLog,
    pub raw_output: String,
}

impl AgentLogFile {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize agent log")?;
        write_once(path, &json)
    }
}

fn write_once(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("refusing to overwrite or failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write {}", path.display()))
}
