//! Adapter registry -- the agents a run configuration can name.

use std::collections::HashMap;
use std::sync::Arc;

use super::claude_code::ClaudeCodeAdapter;
use super::command::CommandAdapter;
use super::trait_def::AgentAdapter;

/// A collection of registered [`AgentAdapter`] implementations, keyed by
/// name.
///
/// Adapters are shared (`Arc`) because the judge evaluator runs one from a
/// spawned task.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `claude-code` and `command`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ClaudeCodeAdapter::new());
        registry.register(CommandAdapter::new());
        registry
    }

    /// Register an adapter under [`AgentAdapter::name`], returning any
    /// adapter it replaces.
    pub fn register(&mut self, adapter: impl AgentAdapter + 'static) -> Option<Arc<dyn AgentAdapter>> {
        let name = adapter.name().to_string();
        self.adapters.insert(name, Arc::new(adapter))
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.list())
            .finish()
    }
}
