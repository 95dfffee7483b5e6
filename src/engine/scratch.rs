//! Execution-scoped scratch state.
//!
//! A process-wide concurrent map partitioned by execution id. Keys are
//! `(execution_id, kind, step_id)`; one step has one writer at a time, so
//! entries never contend.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// What a scratch entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchKind {
    /// Output of a step; the list of item outputs so far for a step that
    /// runs once per fanned-out item
    Output,
    /// Number of fanned-out items the step has finished
    ItemsDone,
}

type ScratchKey = (Arc<str>, ScratchKind, String);

/// Shared scratch store; cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ScratchStore {
    entries: Arc<DashMap<ScratchKey, Value>>,
}

impl ScratchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// View bound to one execution.
    pub fn scope(&self, execution_id: &str) -> ScratchScope {
        ScratchScope {
            store: self.clone(),
            execution_id: Arc::from(execution_id),
        }
    }

    /// Drop everything recorded for an execution.
    pub fn clear(&self, execution_id: &str) {
        self.entries.retain(|(exec, _, _), _| exec.as_ref() != execution_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scratch entries of one execution.
#[derive(Debug, Clone)]
pub struct ScratchScope {
    store: ScratchStore,
    execution_id: Arc<str>,
}

impl ScratchScope {
    fn key(&self, kind: ScratchKind, step_id: &str) -> ScratchKey {
        (self.execution_id.clone(), kind, step_id.to_string())
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn put(&self, kind: ScratchKind, step_id: &str, value: Value) {
        self.store.entries.insert(self.key(kind, step_id), value);
    }

    pub fn get(&self, kind: ScratchKind, step_id: &str) -> Option<Value> {
        self.store
            .entries
            .get(&self.key(kind, step_id))
            .map(|v| v.value().clone())
    }

    /// Increment a counter entry and return the new value.
    pub fn incr(&self, kind: ScratchKind, step_id: &str) -> u64 {
        let mut entry = self
            .store
            .entries
            .entry(self.key(kind, step_id))
            .or_insert(Value::from(0u64));
        let next = entry.as_u64().unwrap_or(0) + 1;
        *entry = Value::from(next);
        next
    }

    /// All entries of one kind, keyed by step id.
    pub fn all(&self, kind: ScratchKind) -> HashMap<String, Value> {
        self.store
            .entries
            .iter()
            .filter(|e| e.key().0 == self.execution_id && e.key().1 == kind)
            .map(|e| (e.key().2.clone(), e.value().clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.store.clear(&self.execution_id);
    }
}
