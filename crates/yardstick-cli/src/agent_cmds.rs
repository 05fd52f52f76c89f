//! `yardstick check-agent` and `yardstick validate`: preflight checks that
//! never create a workspace.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use yardstick_core::agent::AdapterRegistry;
use yardstick_core::config::RunConfiguration;
use yardstick_core::orchestrator::Orchestrator;
use yardstick_core::workspace::WorkspaceManager;

/// Report whether `adapter` is usable with `config` (a JSON object).
/// Returns `false` when the agent is unavailable.
pub async fn run_check_agent(adapter: &str, config: Option<&str>) -> Result<bool> {
    let registry = AdapterRegistry::with_builtins();
    let Some(agent) = registry.get(adapter) else {
        bail!(
            "unknown adapter {adapter:?} (available: {})",
            registry.list().join(", ")
        );
    };

    let config: Value = match config {
        Some(text) => serde_json::from_str(text).context("--config must be a JSON object")?,
        None => Value::Object(serde_json::Map::new()),
    };
    if let Err(reason) = agent.validate_config(&config) {
        bail!("invalid config for adapter {adapter}: {reason}");
    }

    let available = agent.check_availability(&config).await;
    if available {
        println!("{adapter}: available");
    } else {
        println!("{adapter}: not available");
    }
    Ok(available)
}

/// Validate a run configuration file against the built-in registries.
pub fn run_validate(config_path: &Path) -> Result<()> {
    let config = RunConfiguration::load(config_path)?;
    // The root is never touched by validation.
    let orchestrator = Orchestrator::new(WorkspaceManager::new(std::env::temp_dir()));
    orchestrator.validate(&config)?;
    println!(
        "{}: ok ({} with {} evaluator(s))",
        config_path.display(),
        config.agent.adapter,
        config.evaluators.len()
    );
    Ok(())
}
