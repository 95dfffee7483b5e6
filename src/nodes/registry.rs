//! Step registry - maps `type_id` to executors.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{StepExecutor, StepKind};
use super::{AggregateStep, IdentityStep, IfStep, SetStep, SplitStep, SwitchStep, WaitStep};

/// Registry of available step types.
#[derive(Clone)]
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    /// Create a new registry with the built-in steps.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(IdentityStep::new()));
        registry.register(Arc::new(SetStep::new()));
        registry.register(Arc::new(IfStep::new()));
        registry.register(Arc::new(SwitchStep::new()));
        registry.register(Arc::new(SplitStep::new()));
        registry.register(Arc::new(AggregateStep::new()));
        registry.register(Arc::new(WaitStep::new()));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register a step type, replacing any executor with the same id.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors
            .insert(executor.type_id().to_string(), executor);
    }

    /// Get an executor by type name.
    pub fn get(&self, type_id: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(type_id).cloned()
    }

    /// Check if a step type is registered.
    pub fn has(&self, type_id: &str) -> bool {
        self.executors.contains_key(type_id)
    }

    /// Structural kind of a registered type.
    pub fn kind(&self, type_id: &str) -> Option<StepKind> {
        self.executors.get(type_id).map(|e| e.kind())
    }

    /// List all registered step types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Get descriptions of all registered steps.
    pub fn descriptions(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .executors
            .iter()
            .map(|(name, executor)| (name.as_str(), executor.description()))
            .collect();
        out.sort_unstable();
        out
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("types", &self.list())
            .finish()
    }
}
