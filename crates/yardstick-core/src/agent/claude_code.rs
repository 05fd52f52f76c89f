//! Claude Code agent adapter.
//!
//! Runs `claude -p --output-format stream-json --verbose` in the repository
//! checkout with the task on stdin, and folds the JSONL it prints into a
//! [`NormalizedLog`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::trait_def::AgentAdapter;
use super::types::{
    AgentExecutionResult, ExecutionContext, LogMessage, NormalizedLog, TokenUsage, ToolCall,
};
use crate::process::{self, ProcessSpec};

/// Tools granted when the configuration does not list any.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Bash", "Read", "Edit", "Write", "Glob", "Grep"];

const AVAILABILITY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Keys accepted under `[agent.config]` for `claude-code`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ClaudeConfig {
    binary: Option<String>,
    model: Option<String>,
    allowed_tools: Option<Vec<String>>,
    max_turns: Option<u32>,
    append_system_prompt: Option<String>,
    extra_args: Vec<String>,
}

impl ClaudeConfig {
    fn parse(config: &Value) -> Result<Self, String> {
        serde_json::from_value(config.clone()).map_err(|e| e.to_string())
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-p", "--output-format", "stream-json", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        let tools = match &self.allowed_tools {
            Some(tools) => tools.join(","),
            None => DEFAULT_ALLOWED_TOOLS.join(","),
        };
        args.extend(["--allowedTools".to_string(), tools]);
        if let Some(turns) = self.max_turns {
            args.extend(["--max-turns".to_string(), turns.to_string()]);
        }
        if let Some(prompt) = &self.append_system_prompt {
            args.extend(["--append-system-prompt".to_string(), prompt.clone()]);
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Adapter for [Claude Code](https://docs.anthropic.com/en/docs/claude-code).
#[derive(Debug, Clone)]
pub struct ClaudeCodeAdapter {
    /// Binary used when the configuration does not name one.
    default_binary: String,
}

impl ClaudeCodeAdapter {
    /// Create an adapter that looks for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self {
            default_binary: "claude".to_string(),
        }
    }

    /// Create an adapter with a custom default binary path.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            default_binary: path.into(),
        }
    }

    fn binary<'a>(&'a self, config: &'a ClaudeConfig) -> &'a str {
        config.binary.as_deref().unwrap_or(&self.default_binary)
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing helpers
// ---------------------------------------------------------------------------

/// One meaningful piece of a stream-json line.
#[derive(Debug, Clone, PartialEq)]
enum StreamEvent {
    Session {
        session_id: Option<String>,
        model: Option<String>,
    },
    Message {
        role: String,
        content: String,
    },
    ToolCall {
        tool: String,
        input: Value,
    },
    ToolResult {
        tool: String,
    },
    /// Per-message usage adds up; the final `result` usage is the total.
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        cumulative: bool,
    },
    Cost {
        usd: f64,
        duration_ms: Option<u64>,
    },
    Error {
        message: String,
    },
}

fn usage_event(usage: &Value, cumulative: bool) -> Option<StreamEvent> {
    let input_tokens = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let output_tokens = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    (input_tokens > 0 || output_tokens > 0).then_some(StreamEvent::TokenUsage {
        input_tokens,
        output_tokens,
        cumulative,
    })
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|s| s.as_str()).map(str::to_string)
}

/// Parse one JSONL line of Claude Code's stream-json output into zero or
/// more events. `Err` means the line is not JSON; callers skip it.
fn parse_stream_json_line(line: &str) -> anyhow::Result<Vec<StreamEvent>> {
    let v: Value = serde_json::from_str(line)?;
    let mut events = Vec::new();

    match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        // ----------------------------------------------------------------
        // system -- the init event names the session and model
        // ----------------------------------------------------------------
        "system" => {
            let session_id = str_field(&v, "session_id");
            let model = str_field(&v, "model");
            if session_id.is_some() || model.is_some() {
                events.push(StreamEvent::Session { session_id, model });
            }
        }

        // ----------------------------------------------------------------
        // assistant -- content blocks plus per-message usage
        // ----------------------------------------------------------------
        "assistant" => {
            let Some(message) = v.get("message") else {
                return Ok(events);
            };
            if let Some(model) = str_field(message, "model") {
                events.push(StreamEvent::Session {
                    session_id: None,
                    model: Some(model),
                });
            }
            for block in message
                .get("content")
                .and_then(|c| c.as_array())
                .into_iter()
                .flatten()
            {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = str_field(block, "text") {
                            events.push(StreamEvent::Message {
                                role: "assistant".to_string(),
                                content: text,
                            });
                        }
                    }
                    "tool_use" => events.push(StreamEvent::ToolCall {
                        tool: str_field(block, "name").unwrap_or_else(|| "unknown".to_string()),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    _ => {}
                }
            }
            if let Some(usage) = message.get("usage").and_then(|u| usage_event(u, false)) {
                events.push(usage);
            }
        }

        // ----------------------------------------------------------------
        // tool_use / tool_result -- sometimes emitted at top level
        // ----------------------------------------------------------------
        "tool_use" => events.push(StreamEvent::ToolCall {
            tool: str_field(&v, "name")
                .or_else(|| str_field(&v, "tool"))
                .unwrap_or_else(|| "unknown".to_string()),
            input: v.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => events.push(StreamEvent::ToolResult {
            tool: str_field(&v, "name")
                .or_else(|| str_field(&v, "tool"))
                .unwrap_or_else(|| "unknown".to_string()),
        }),

        // ----------------------------------------------------------------
        // result -- final answer, totals, cost
        // ----------------------------------------------------------------
        "result" => {
            if let Some(session_id) = str_field(&v, "session_id") {
                events.push(StreamEvent::Session {
                    session_id: Some(session_id),
                    model: None,
                });
            }
            let is_error = v.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false);
            if let Some(text) = str_field(&v, "result") {
                if is_error {
                    events.push(StreamEvent::Error { message: text });
                } else {
                    events.push(StreamEvent::Message {
                        role: "assistant".to_string(),
                        content: text,
                    });
                }
            }
            if let Some(usage) = v.get("usage").and_then(|u| usage_event(u, true)) {
                events.push(usage);
            }
            if let Some(usd) = v
                .get("total_cost_usd")
                .or_else(|| v.get("cost_usd"))
                .and_then(|c| c.as_f64())
            {
                events.push(StreamEvent::Cost {
                    usd,
                    duration_ms: v.get("duration_ms").and_then(|d| d.as_u64()),
                });
            }
        }

        // ----------------------------------------------------------------
        // error -- an error from the agent
        // ----------------------------------------------------------------
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            events.push(StreamEvent::Error { message });
        }

        other => {
            debug!(event_type = other, "ignoring unrecognised stream-json event type");
        }
    }

    Ok(events)
}

fn apply(log: &mut NormalizedLog, event: StreamEvent) {
    match event {
        StreamEvent::Session { session_id, model } => {
            if session_id.is_some() {
                log.session_id = session_id;
            }
            if log.model.is_none() {
                log.model = model;
            }
        }
        StreamEvent::Message { role, content } => {
            // The result event repeats the last assistant message.
            let repeat = log
                .messages
                .last()
                .is_some_and(|m| m.role == role && m.content == content);
            if !repeat {
                log.messages.push(LogMessage { role, content });
            }
        }
        StreamEvent::ToolCall { tool, input } => log.tool_calls.push(ToolCall { tool, input }),
        StreamEvent::ToolResult { tool } => debug!(tool, "tool result"),
        StreamEvent::TokenUsage {
            input_tokens,
            output_tokens,
            cumulative,
        } => {
            if cumulative {
                log.usage = TokenUsage {
                    input_tokens,
                    output_tokens,
                };
            } else {
                log.usage.input_tokens += input_tokens;
                log.usage.output_tokens += output_tokens;
            }
        }
        StreamEvent::Cost { usd, duration_ms } => {
            log.cost_usd = Some(usd);
            if duration_ms.is_some() {
                log.duration_ms = duration_ms;
            }
        }
        StreamEvent::Error { message } => log.errors.push(message),
    }
}

// ---------------------------------------------------------------------------
// AgentAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl AgentAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        ClaudeConfig::parse(config).map(|_| ())
    }

    async fn check_availability(&self, config: &Value) -> bool {
        let Ok(config) = ClaudeConfig::parse(config) else {
            return false;
        };
        let binary = self.binary(&config);
        if process::find_executable(binary).is_none() {
            debug!(binary, "claude binary not found");
            return false;
        }
        let mut spec = ProcessSpec::new(binary, std::env::temp_dir(), AVAILABILITY_TIMEOUT);
        spec.args = vec!["--version".to_string()];
        match process::run_process(&spec, &Default::default()).await {
            Ok(outcome) => outcome.succeeded(),
            Err(e) => {
                debug!(binary, error = %e, "claude availability probe failed");
                false
            }
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentExecutionResult {
        let config = match ClaudeConfig::parse(&ctx.config) {
            Ok(config) => config,
            Err(e) => return AgentExecutionResult::not_started("config", e),
        };

        let mut spec = ProcessSpec::new(self.binary(&config), &ctx.repo_dir, ctx.timeout);
        spec.args = config.args();
        spec.env = ctx.env.clone();
        spec.stdin = Some(ctx.prompt.clone());

        match process::run_process(&spec, &ctx.cancel).await {
            Ok(outcome) => AgentExecutionResult::from_outcome(outcome),
            Err(e) => {
                warn!(error = %e, "failed to launch claude");
                AgentExecutionResult::not_started("launch", format!("{e:#}"))
            }
        }
    }

    fn normalize_log(&self, raw_output: &str, result: &AgentExecutionResult) -> NormalizedLog {
        let mut log = NormalizedLog::new(self.name());
        for line in raw_output.lines() {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                continue;
            }
            match parse_stream_json_line(trimmed) {
                Ok(events) => events.into_iter().for_each(|e| apply(&mut log, e)),
                Err(e) => debug!(error = %e, "skipping malformed JSONL line"),
            }
        }
        if log.duration_ms.is_none() {
            log.duration_ms = Some(result.duration_ms);
        }
        log.errors
            .extend(result.errors.iter().map(|e| format!("{}: {}", e.kind, e.message)));
        log
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
