//! Generic command agent adapter.
//!
//! Runs any program as the agent. Useful for scripted baselines and for
//! wrapping agents that have no dedicated adapter. Output has no structure,
//! so every non-empty line becomes an assistant message.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::trait_def::AgentAdapter;
use super::types::{AgentExecutionResult, ExecutionContext, LogMessage, NormalizedLog};
use crate::process::{self, ProcessSpec};

/// Environment variable carrying the prompt when `prompt_via = "env"`.
pub const PROMPT_ENV_VAR: &str = "YARDSTICK_PROMPT";

/// How the task reaches the program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PromptVia {
    #[default]
    Stdin,
    Env,
    Arg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandConfig {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    prompt_via: PromptVia,
}

impl CommandConfig {
    fn parse(config: &Value) -> Result<Self, String> {
        let parsed: Self = serde_json::from_value(config.clone()).map_err(|e| e.to_string())?;
        if parsed.program.trim().is_empty() {
            return Err("program must not be empty".to_string());
        }
        Ok(parsed)
    }
}

/// Adapter that runs an arbitrary program.
#[derive(Debug, Clone, Default)]
pub struct CommandAdapter;

impl CommandAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentAdapter for CommandAdapter {
    fn name(&self) -> &str {
        "command"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        CommandConfig::parse(config).map(|_| ())
    }

    async fn check_availability(&self, config: &Value) -> bool {
        CommandConfig::parse(config)
            .ok()
            .and_then(|c| process::find_executable(&c.program))
            .is_some()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> AgentExecutionResult {
        let config = match CommandConfig::parse(&ctx.config) {
            Ok(config) => config,
            Err(e) => return AgentExecutionResult::not_started("config", e),
        };

        let mut spec = ProcessSpec::new(&config.program, &ctx.repo_dir, ctx.timeout);
        spec.args = config.args.clone();
        spec.env = ctx.env.clone();
        match config.prompt_via {
            PromptVia::Stdin => spec.stdin = Some(ctx.prompt.clone()),
            PromptVia::Env => {
                spec.env.insert(PROMPT_ENV_VAR.to_string(), ctx.prompt.clone());
            }
            PromptVia::Arg => spec.args.push(ctx.prompt.clone()),
        }

        match process::run_process(&spec, &ctx.cancel).await {
            Ok(outcome) => AgentExecutionResult::from_outcome(outcome),
            Err(e) => {
                warn!(program = %config.program, error = %e, "failed to launch command agent");
                AgentExecutionResult::not_started("launch", format!("{e:#}"))
            }
        }
    }

    fn normalize_log(&self, raw_output: &str, result: &AgentExecutionResult) -> NormalizedLog {
        let mut log = NormalizedLog::new(self.name());
        log.messages = raw_output
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .map(|line| LogMessage {
                role: "assistant".to_string(),
                content: line.to_string(),
            })
            .collect();
        log.duration_ms = Some(result.duration_ms);
        log.errors = result
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.kind, e.message))
            .collect();
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::AgentStatus;
    use std::time::Duration;

    fn context(dir: &std::path::Path, config: Value) -> ExecutionContext {
        ExecutionContext {
            workspace_dir: dir.to_path_buf(),
            repo_dir: dir.to_path_buf(),
            prompt: "add a README".to_string(),
            config,
            timeout: Duration::from_secs(20),
            env: [("YARDSTICK_RUN_ID".to_string(), "r1".to_string())].into(),
            cancel: Default::default(),
        }
    }

    #[test]
    fn program_is_required() {
        let adapter = CommandAdapter::new();
        assert!(adapter.validate_config(&serde_json::json!({})).is_err());
        assert!(adapter.validate_config(&serde_json::json!({"program": " "})).is_err());
        assert!(
            adapter
                .validate_config(&serde_json::json!({"program": "sh", "prompt_via": "env"}))
                .is_ok()
        );
        assert!(
            adapter
                .validate_config(&serde_json::json!({"program": "sh", "prompt_via": "pipe"}))
                .is_err()
        );
    }

    #[tokio::test]
    async fn prompt_via_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = CommandAdapter::new();
        let ctx = context(
            tmp.path(),
            serde_json::json!({"program": "sh", "args": ["-c", "cat > out.txt; echo wrote it"]}),
        );
        let result = adapter.execute(&ctx).await;
        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("out.txt")).unwrap(),
            "add a README"
        );
        let log = adapter.normalize_log(&result.output, &result);
        assert_eq!(log.messages.len(), 1);
        assert_eq!(log.messages[0].content, "wrote it");
    }

    #[tokio::test]
    async fn prompt_via_env_and_arg() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = CommandAdapter::new();

        let env_ctx = context(
            tmp.path(),
            serde_json::json!({
                "program": "sh",
                "args": ["-c", "echo \"$YARDSTICK_PROMPT/$YARDSTICK_RUN_ID\""],
                "prompt_via": "env",
            }),
        );
        let result = adapter.execute(&env_ctx).await;
        assert_eq!(result.output, "add a README/r1");

        let arg_ctx = context(
            tmp.path(),
            serde_json::json!({
                "program": "sh",
                "args": ["-c", "echo \"got: $0\""],
                "prompt_via": "arg",
            }),
        );
        let result = adapter.execute(&arg_ctx).await;
        assert_eq!(result.output, "got: add a README");
    }

    #[tokio::test]
    async fn failing_command_keeps_output() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = CommandAdapter::new();
        let ctx = context(
            tmp.path(),
            serde_json::json!({"program": "sh", "args": ["-c", "echo partial; exit 7"]}),
        );
        let result = adapter.execute(&ctx).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(result.exit_code, Some(7));
        assert_eq!(result.output, "partial");

        let log = adapter.normalize_log(&result.output, &result);
        assert_eq!(log.errors, vec!["exit: agent exited with status 7".to_string()]);
    }

    #[tokio::test]
    async fn availability_resolves_program() {
        let adapter = CommandAdapter::new();
        assert!(adapter.check_availability(&serde_json::json!({"program": "sh"})).await);
        assert!(
            !adapter
                .check_availability(&serde_json::json!({"program": "no-such-agent-binary"}))
                .await
        );
        assert!(!adapter.check_availability(&serde_json::json!({})).await);
    }
}
