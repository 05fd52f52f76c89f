//! Agent-as-judge evaluator.
//!
//! Hands the agent's work to a second agent with a list of criteria and
//! asks for a JSON verdict. Several instances (`agentic-judge:naming`,
//! `agentic-judge:tests`, ...) can split one large review into small,
//! separately scored ones.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::judge_parser::{self, JudgeStatus, JudgeVerdict};
use super::registry::INSTANCE_SEPARATOR;
use super::trait_def::Evaluator;
use super::types::{EvaluationContext, EvaluationResult};
use crate::agent::{AdapterRegistry, AgentAdapter, AgentStatus, ExecutionContext};
use crate::orchestrator::RUN_ID_ENV_VAR;
use crate::vcs;

pub const DEFAULT_JUDGE_TIMEOUT_SECS: u64 = 300;

/// Claude Code tools a judge gets unless its config says otherwise.
const READ_ONLY_TOOLS: [&str; 3] = ["Read", "Glob", "Grep"];

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Criteria {
    One(String),
    Many(Vec<String>),
}

impl Default for Criteria {
    fn default() -> Self {
        Criteria::Many(Vec::new())
    }
}

impl Criteria {
    fn items(&self) -> Vec<&str> {
        let all: Vec<&str> = match self {
            Criteria::One(one) => vec![one.as_str()],
            Criteria::Many(many) => many.iter().map(String::as_str).collect(),
        };
        all.into_iter()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct JudgeConfig {
    /// Adapter running the judge; defaults to the run's agent adapter.
    adapter: Option<String>,
    criteria: Criteria,
    /// Adapter configuration for the judge process.
    agent_config: Option<Value>,
    timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            criteria: Criteria::default(),
            agent_config: None,
            timeout_secs: DEFAULT_JUDGE_TIMEOUT_SECS,
        }
    }
}

/// Judge adapter and its configuration, resolved against one run.
struct ResolvedJudge {
    adapter: std::sync::Arc<dyn AgentAdapter>,
    config: Value,
}

/// Scores the run with a second agent against configured criteria.
#[derive(Debug, Clone)]
pub struct JudgeEvaluator {
    name: String,
    config: JudgeConfig,
    agents: AdapterRegistry,
}

impl JudgeEvaluator {
    pub const NAME: &'static str = "agentic-judge";

    pub fn from_config(name: &str, config: &Value, agents: AdapterRegistry) -> Result<Self, String> {
        let config: JudgeConfig =
            serde_json::from_value(config.clone()).map_err(|e| format!("invalid config: {e}"))?;
        if config.timeout_secs == 0 {
            return Err("timeout_secs must be greater than zero".to_string());
        }
        Ok(Self {
            name: name.to_string(),
            config,
            agents,
        })
    }

    fn instance(&self) -> Option<&str> {
        self.name
            .split_once(INSTANCE_SEPARATOR)
            .map(|(_, instance)| instance)
    }

    fn resolve(&self, ctx: &EvaluationContext) -> Result<ResolvedJudge, String> {
        let adapter_name = self
            .config
            .adapter
            .as_deref()
            .unwrap_or(&ctx.run.agent_adapter);
        let adapter = self
            .agents
            .get(adapter_name)
            .ok_or_else(|| format!("unknown judge adapter {adapter_name:?}"))?;

        // Reuse the run's agent settings (binary, model) when judging with
        // the same adapter and no explicit judge config.
        let mut config = match &self.config.agent_config {
            Some(config) => config.clone(),
            None if adapter_name == ctx.run.agent_adapter => ctx.run.agent_config.clone(),
            None => Value::Object(Map::new()),
        };
        if adapter.name() == "claude-code" {
            if let Some(obj) = config.as_object_mut() {
                obj.entry("allowed_tools")
                    .or_insert_with(|| Value::from(READ_ONLY_TOOLS.to_vec()));
            }
        }
        adapter
            .validate_config(&config)
            .map_err(|e| format!("invalid judge agent_config: {e}"))?;
        Ok(ResolvedJudge { adapter, config })
    }

    fn prompt(&self, ctx: &EvaluationContext, changed_files: &[String]) -> String {
        let criteria = self
            .config
            .criteria
            .items()
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. {c}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let focus = self
            .instance()
            .map(|i| format!("Review focus: {i}\n\n"))
            .unwrap_or_default();
        let changed = if changed_files.is_empty() {
            "(no changes detected)".to_string()
        } else {
            changed_files
                .iter()
                .map(|f| format!("- {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "You are reviewing changes an AI coding agent made to the repository in \
             the current directory. Inspect the files, but do not modify anything.\n\n\
             {focus}Task the agent was given:\n{task}\n\n\
             Files changed by the agent:\n{changed}\n\n\
             Judge the changes against these criteria:\n{criteria}\n\n\
             Answer with a single JSON object in a ```json fenced block:\n\
             {{\"status\": \"passed\" or \"failed\", \"metrics\": {{<numeric scores>}}, \
             \"message\": \"<one-paragraph summary>\", \"evidence\": {{\"files_examined\": [..], \
             \"patterns_found\": [..], \"reasoning\": \"..\", \"confidence\": 0.0-1.0}}}}\n\
             Use \"failed\" if any criterion is not met.",
            task = ctx.run.task,
        )
    }

    fn enrich(&self, verdict: JudgeVerdict, judge_duration_ms: u64) -> EvaluationResult {
        let passed = verdict.status == JudgeStatus::Passed;
        let mut message = verdict.message;
        let mut result = EvaluationResult::verdict(&self.name, passed, "");
        result.metrics.extend(verdict.metrics);
        result
            .metrics
            .insert("judge_duration_ms".to_string(), judge_duration_ms.into());
        result.metrics.insert(
            "criteria_count".to_string(),
            self.config.criteria.items().len().into(),
        );

        if let Some(evidence) = verdict.evidence {
            if let Some(confidence) = evidence.confidence {
                result.metrics.insert("confidence".to_string(), confidence.into());
            }
            if !evidence.files_examined.is_empty() {
                result.metrics.insert(
                    "files_examined".to_string(),
                    evidence.files_examined.len().into(),
                );
            }
            if let Some(reasoning) = evidence.reasoning.filter(|r| !r.trim().is_empty()) {
                message.push_str(&format!("\n\nReasoning: {}", reasoning.trim()));
            }
            if !evidence.files_examined.is_empty() {
                message.push_str(&format!(
                    "\n\nFiles examined: {}",
                    evidence.files_examined.join(", ")
                ));
            }
        }
        result.message = message;
        result
    }
}

#[async_trait]
impl Evaluator for JudgeEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "A second agent judges the changes against configured criteria"
    }

    async fn check_preconditions(&self, ctx: &EvaluationContext) -> Result<(), String> {
        if self.config.criteria.items().is_empty() {
            return Err("no judging criteria configured".to_string());
        }
        let judge = self.resolve(ctx)?;
        if !judge.adapter.check_availability(&judge.config).await {
            return Err(format!(
                "judge agent {:?} is not available",
                judge.adapter.name()
            ));
        }
        Ok(())
    }

    async fn evaluate(&self, ctx: &EvaluationContext) -> Result<EvaluationResult> {
        let judge = match self.resolve(ctx) {
            Ok(judge) => judge,
            Err(e) => return Ok(EvaluationResult::skipped(&self.name, e)),
        };

        let repo = ctx.modified_dir().to_path_buf();
        let base = Some(ctx.run.base_commit.clone()).filter(|b| !b.is_empty());
        let changed_files = tokio::task::spawn_blocking(move || {
            vcs::diff_numstat(&repo, base.as_deref())
                .map(|changes| changes.into_iter().map(|c| c.path).collect::<Vec<_>>())
        })
        .await
        .context("diff task panicked")?
        .unwrap_or_else(|e| {
            warn!(evaluator = %self.name, error = %e, "could not list changed files for judge");
            Vec::new()
        });

        let exec_ctx = ExecutionContext {
            workspace_dir: ctx
                .modified_dir()
                .parent()
                .unwrap_or(ctx.modified_dir())
                .to_path_buf(),
            repo_dir: ctx.modified_dir().to_path_buf(),
            prompt: self.prompt(ctx, &changed_files),
            config: judge.config.clone(),
            timeout: Duration::from_secs(self.config.timeout_secs),
            env: [(RUN_ID_ENV_VAR.to_string(), ctx.run.run_id.clone())].into(),
            cancel: ctx.cancel.clone(),
        };

        info!(evaluator = %self.name, adapter = judge.adapter.name(), "running judge agent");
        let result = judge.adapter.execute(&exec_ctx).await;

        if result.status != AgentStatus::Success {
            let artifact = ctx.write_artifact("judge-output.txt", &result.output).ok();
            let errors = result
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            let mut skipped = EvaluationResult::skipped(
                &self.name,
                format!("judge agent ended with status {:?}: {errors}", result.status),
            );
            skipped.artifacts.extend(artifact);
            return Ok(skipped);
        }

        let log = judge.adapter.normalize_log(&result.output, &result);
        let assistant_text = log.assistant_text();
        let parsed = judge_parser::parse_verdict(&assistant_text)
            .or_else(|_| judge_parser::parse_verdict(&result.output));

        match parsed {
            Ok(verdict) => {
                let duration = log.duration_ms.unwrap_or(result.duration_ms);
                Ok(self.enrich(verdict, duration))
            }
            Err(e) => {
                let mut skipped = EvaluationResult::skipped(&self.name, e);
                if let Ok(artifact) = ctx.write_artifact("judge-output.txt", &result.output) {
                    skipped.artifacts.push(artifact);
                }
                Ok(skipped)
            }
        }
    }
}
