//! Evaluator registry: a factory keyed by name pattern.
//!
//! A configured name resolves either exactly (`diff-summary`) or as a named
//! instance `<base>:<instance>` (`agentic-judge:security`). Each resolution
//! constructs a fresh evaluator parameterized by its configured name and
//! config, so one implementation can appear many times in a suite.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::diff_summary::DiffSummaryEvaluator;
use super::expected_diff::ExpectedDiffEvaluator;
use super::judge::JudgeEvaluator;
use super::trait_def::Evaluator;
use crate::agent::AdapterRegistry;

/// Separator between a base evaluator name and an instance label.
pub const INSTANCE_SEPARATOR: char = ':';

/// Arguments handed to an evaluator factory.
#[derive(Debug, Clone, Copy)]
pub struct EvaluatorSetup<'a> {
    /// Full configured name.
    pub name: &'a str,
    /// Instance label after the separator, if any.
    pub instance: Option<&'a str>,
    pub config: &'a Value,
    pub agents: &'a AdapterRegistry,
}

type Factory = Arc<dyn Fn(EvaluatorSetup<'_>) -> Result<Box<dyn Evaluator>, String> + Send + Sync>;

/// Maps configured evaluator names to constructors.
#[derive(Clone)]
pub struct EvaluatorRegistry {
    factories: BTreeMap<String, Factory>,
    agents: AdapterRegistry,
}

impl EvaluatorRegistry {
    /// Empty registry; `agents` is what judge-style evaluators run.
    pub fn new(agents: AdapterRegistry) -> Self {
        Self {
            factories: BTreeMap::new(),
            agents,
        }
    }

    /// Registry with `diff-summary`, `expected-diff`, and `agentic-judge`.
    pub fn with_builtins(agents: AdapterRegistry) -> Self {
        let mut registry = Self::new(agents);
        registry.register(DiffSummaryEvaluator::NAME, |setup| {
            Ok(Box::new(DiffSummaryEvaluator::from_config(setup.name, setup.config)?))
        });
        registry.register(ExpectedDiffEvaluator::NAME, |setup| {
            Ok(Box::new(ExpectedDiffEvaluator::from_config(setup.name, setup.config)?))
        });
        registry.register(JudgeEvaluator::NAME, |setup| {
            Ok(Box::new(JudgeEvaluator::from_config(
                setup.name,
                setup.config,
                setup.agents.clone(),
            )?))
        });
        registry
    }

    /// Register `factory` under the base name `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(EvaluatorSetup<'_>) -> Result<Box<dyn Evaluator>, String> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Split a configured name into its registered base and instance label.
    pub fn resolve<'n>(&self, name: &'n str) -> Option<(&'n str, Option<&'n str>)> {
        if self.factories.contains_key(name) {
            return Some((name, None));
        }
        let (base, instance) = name.split_once(INSTANCE_SEPARATOR)?;
        (!instance.is_empty() && self.factories.contains_key(base)).then_some((base, Some(instance)))
    }

    /// Construct the evaluator for a configured name.
    ///
    /// `Err` carries a human-readable reason: unknown name or bad config.
    pub fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Evaluator>, String> {
        let (base, instance) = self
            .resolve(name)
            .ok_or_else(|| format!("unknown evaluator {name:?}"))?;
        let factory = self
            .factories
            .get(base)
            .ok_or_else(|| format!("unknown evaluator {name:?}"))?;
        factory(EvaluatorSetup {
            name,
            instance,
            config,
            agents: &self.agents,
        })
    }

    /// Registered base names.
    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn agents(&self) -> &AdapterRegistry {
        &self.agents
    }
}

impl std::fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorRegistry")
            .field("evaluators", &self.list())
            .field("agents", &self.agents)
            .finish()
    }
}
