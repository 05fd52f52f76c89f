//! Run configuration: what to clone, which agent to run, which evaluators
//! to apply, and how long everything may take.
//!
//! A [`RunConfiguration`] is immutable once a run starts. It is validated
//! before any resource (workspace directory, lock, clone) is acquired so
//! that configuration mistakes never leave partial state behind.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workspace::artifact_dir_name;

/// Default agent wall time: 30 minutes.
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 1800;

/// A configuration problem, reported with the offending field path
/// (e.g. `repository.url` or `evaluators[2].name`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration at `{field}`: {reason}")]
pub struct ConfigError {
    pub field: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Where the repository under test comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySpec {
    /// Clone URL or local path.
    pub url: String,
    /// Branch, tag, or commit SHA the agent starts from.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Branch, tag, or commit holding the known-good reference tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_ref: Option<String>,
    /// Repository holding `expected_ref`; defaults to `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_url: Option<String>,
}

impl RepositorySpec {
    /// The URL to clone the expected reference from.
    pub fn expected_source(&self) -> &str {
        self.expected_url.as_deref().unwrap_or(&self.url)
    }
}

/// Which agent adapter runs the task, plus adapter-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Registered adapter name, e.g. `claude-code` or `command`.
    pub adapter: String,
    /// Free-form adapter configuration.
    #[serde(default = "empty_object")]
    pub config: Value,
}

/// One configured evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    /// Evaluator name, either exact (`diff-summary`) or a named instance
    /// (`agentic-judge:security`).
    pub name: String,
    /// Free-form evaluator configuration.
    #[serde(default = "empty_object")]
    pub config: Value,
}

/// What happens to the workspace tree when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Keep the tree after a completed run; delete it when the run aborts.
    #[default]
    Retain,
    /// Always delete the tree once the run ends.
    Always,
    /// Never delete the tree, even after an abort.
    Never,
}

/// Everything needed to execute one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Optional human-readable run label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Task description handed to the agent.
    pub task: String,
    pub repository: RepositorySpec,
    pub agent: AgentSpec,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorSpec>,
    /// Agent wall-time limit.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Deadline for the whole run (setup, agent, evaluators).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_timeout_secs() -> u64 {
    DEFAULT_AGENT_TIMEOUT_SECS
}

impl RunConfiguration {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse run configuration TOML")
    }

    /// Load a configuration file. `.json` files are parsed as JSON, anything
    /// else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read run configuration {}", path.display()))?;
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))
        } else {
            Self::from_toml_str(&text)
        }
    }

    /// Check the configuration for structural problems.
    ///
    /// Registry lookups (does the adapter exist, does the evaluator name
    /// resolve) are done by the orchestrator, which owns the registries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task.trim().is_empty() {
            return Err(ConfigError::new("task", "must not be empty"));
        }
        if self.repository.url.trim().is_empty() {
            return Err(ConfigError::new("repository.url", "must not be empty"));
        }
        if self.repository.reference.trim().is_empty() {
            return Err(ConfigError::new("repository.ref", "must not be empty"));
        }
        if let Some(expected) = &self.repository.expected_ref {
            if expected.trim().is_empty() {
                return Err(ConfigError::new(
                    "repository.expected_ref",
                    "must not be empty when present",
                ));
            }
        }
        if self.agent.adapter.trim().is_empty() {
            return Err(ConfigError::new("agent.adapter", "must not be empty"));
        }
        if !self.agent.config.is_object() {
            return Err(ConfigError::new("agent.config", "must be a table"));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::new("timeout_secs", "must be greater than zero"));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(ConfigError::new(
                "run_timeout_secs",
                "must be greater than zero",
            ));
        }

        let mut seen = HashSet::new();
        let mut artifact_dirs: HashMap<String, &str> = HashMap::new();
        for (i, evaluator) in self.evaluators.iter().enumerate() {
            let name = evaluator.name.trim();
            if name.is_empty() {
                return Err(ConfigError::new(
                    format!("evaluators[{i}].name"),
                    "must not be empty",
                ));
            }
            if name.contains('/') || name.contains('\\') {
                return Err(ConfigError::new(
                    format!("evaluators[{i}].name"),
                    "must not contain path separators",
                ));
            }
            if !seen.insert(name) {
                return Err(ConfigError::new(
                    format!("evaluators[{i}].name"),
                    format!("duplicate evaluator name {name:?}"),
                ));
            }
            if let Some(other) = artifact_dirs.insert(artifact_dir_name(name), name) {
                return Err(ConfigError::new(
                    format!("evaluators[{i}].name"),
                    format!(
                        "{name:?} and {other:?} would share the artifact directory {:?}",
                        artifact_dir_name(name)
                    ),
                ));
            }
            if !evaluator.config.is_object() {
                return Err(ConfigError::new(
                    format!("evaluators[{i}].config"),
                    "must be a table",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "rename-helper"
task = "Rename `foo` to `bar` everywhere."
run_timeout_secs = 3600

[repository]
url = "https://example.com/repo.git"
ref = "main"
expected_ref = "solution"

[agent]
adapter = "claude-code"
config = { model = "sonnet" }

[[evaluators]]
name = "diff-summary"
config = { max_files_changed = 5 }

[[evaluators]]
name = "expected-diff"

[[evaluators]]
name = "agentic-judge:naming"
config = { criteria = ["Names are consistent"] }
"#;

    fn sample() -> RunConfiguration {
        RunConfiguration::from_toml_str(SAMPLE).unwrap()
    }

    #[test]
    fn parses_full_toml() {
        let cfg = sample();
        assert_eq!(cfg.name.as_deref(), Some("rename-helper"));
        assert_eq!(cfg.repository.reference, "main");
        assert_eq!(cfg.repository.expected_ref.as_deref(), Some("solution"));
        assert_eq!(cfg.repository.expected_source(), "https://example.com/repo.git");
        assert_eq!(cfg.agent.config["model"], "sonnet");
        assert_eq!(cfg.evaluators.len(), 3);
        assert_eq!(cfg.evaluators[1].config, serde_json::json!({}));
        assert_eq!(cfg.timeout_secs, DEFAULT_AGENT_TIMEOUT_SECS);
        assert_eq!(cfg.run_timeout_secs, Some(3600));
        assert_eq!(cfg.cleanup, CleanupPolicy::Retain);
        cfg.validate().unwrap();
    }

    #[test]
    fn empty_url_is_reported_by_field() {
        let mut cfg = sample();
        cfg.repository.url = "  ".to_string();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "repository.url");
    }

    #[test]
    fn duplicate_evaluator_names_are_rejected() {
        let mut cfg = sample();
        cfg.evaluators.push(EvaluatorSpec {
            name: "diff-summary".to_string(),
            config: serde_json::json!({}),
        });
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "evaluators[3].name");
        assert!(err.reason.contains("duplicate"));
    }

    #[test]
    fn names_sharing_an_artifact_directory_are_rejected() {
        let mut cfg = sample();
        for name in ["agentic-judge:a.b", "agentic-judge:a_b"] {
            cfg.evaluators.push(EvaluatorSpec {
                name: name.to_string(),
                config: serde_json::json!({}),
            });
        }
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "evaluators[4].name");
        assert!(err.reason.contains("agentic-judge_a_b"), "{}", err.reason);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut cfg = sample();
        cfg.timeout_secs = 0;
        assert_eq!(cfg.validate().unwrap_err().field, "timeout_secs");
    }

    #[test]
    fn evaluator_config_must_be_a_table() {
        let mut cfg = sample();
        cfg.evaluators[0].config = serde_json::json!([1, 2]);
        assert_eq!(cfg.validate().unwrap_err().field, "evaluators[0].config");
    }

    #[test]
    fn error_display_names_the_field() {
        let err = ConfigError::new("agent.adapter", "must not be empty");
        assert_eq!(
            err.to_string(),
            "invalid configuration at `agent.adapter`: must not be empty"
        );
    }

    #[test]
    fn json_round_trip_keeps_ref_key() {
        let cfg = sample();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["repository"]["ref"], "main");
        let back: RunConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }
}
