//! Types shared by every agent adapter.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::process::ProcessOutcome;

/// Everything an adapter needs to run one agent invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Root of the run's workspace.
    pub workspace_dir: PathBuf,
    /// Repository checkout the agent runs in (its working directory).
    pub repo_dir: PathBuf,
    /// Task description handed to the agent.
    pub prompt: String,
    /// Adapter-specific configuration.
    pub config: Value,
    /// Wall-time limit for the agent process.
    pub timeout: Duration,
    /// Extra environment for the agent process.
    pub env: BTreeMap<String, String>,
    /// Cancelled when the run is aborted.
    pub cancel: CancellationToken,
}

/// How an agent invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Failed,
    Timeout,
}

/// A structured problem observed while running the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentError {
    /// Short machine-readable category: `launch`, `exit`, `timeout`,
    /// `cancelled`, `agent`.
    pub kind: String,
    pub message: String,
}

impl AgentError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    pub status: AgentStatus,
    /// Combined stdout and stderr.
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub errors: Vec<AgentError>,
}

impl AgentExecutionResult {
    /// Classify a finished process: a fired timeout wins, then exit code 0
    /// means success, anything else failed.
    pub fn from_outcome(outcome: ProcessOutcome) -> Self {
        let mut errors = Vec::new();
        let status = if outcome.timed_out {
            errors.push(AgentError::new(
                "timeout",
                format!("agent exceeded its time limit after {} ms", outcome.duration.as_millis()),
            ));
            AgentStatus::Timeout
        } else if outcome.cancelled {
            errors.push(AgentError::new("cancelled", "agent run was cancelled"));
            AgentStatus::Failed
        } else if outcome.exit_code == Some(0) {
            AgentStatus::Success
        } else {
            let message = match outcome.exit_code {
                Some(code) => format!("agent exited with status {code}"),
                None => "agent was terminated by a signal".to_string(),
            };
            errors.push(AgentError::new("exit", message));
            AgentStatus::Failed
        };

        Self {
            status,
            output: outcome.output,
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            exit_code: outcome.exit_code,
            errors,
        }
    }

    /// Result for an agent that never started (or was never available).
    pub fn not_started(kind: &str, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status: AgentStatus::Failed,
            output: String::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            exit_code: None,
            errors: vec![AgentError::new(kind, message)],
        }
    }
}

/// One message in the normalized conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub role: String,
    pub content: String,
}

/// One tool invocation made by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub input: Value,
}

/// Token counts summed over the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Agent-independent view of what the agent did. Evaluators and reports
/// only ever see this shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLog {
    /// Adapter that produced the log.
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<LogMessage>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl NormalizedLog {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ..Self::default()
        }
    }

    /// Text of every assistant message, joined by blank lines.
    pub fn assistant_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == "assistant")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
