//! In-memory storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::{Checkpoint, Execution, StepExecution, StepKey, Storage};
use crate::engine::state_merge::{self, MergeOutcome, StepEvent};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct MemoryState {
    executions: HashMap<String, Execution>,
    steps: BTreeMap<StepKey, StepExecution>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
}

/// Process-local [`Storage`]; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(current) = state.executions.get(&execution.id) {
            if current.status != execution.status && !current.status.can_transition_to(execution.status)
            {
                return Err(Error::TransitionRejected {
                    from: current.status.to_string(),
                    to: execution.status.to_string(),
                });
            }
        }
        state
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.state.read().await.executions.get(id).cloned())
    }

    async fn list_executions(&self, workflow_name: Option<&str>) -> Result<Vec<Execution>> {
        let state = self.state.read().await;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| workflow_name.map_or(true, |name| e.workflow_name == name))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        Ok(executions)
    }

    async fn apply_step_events(
        &self,
        key: &StepKey,
        events: &[StepEvent],
    ) -> Result<MergeOutcome> {
        let mut state = self.state.write().await;
        let outcome = state_merge::apply(state.steps.get(key), key, events, Utc::now());
        if let Some(row) = outcome.row() {
            state.steps.insert(key.clone(), row.clone());
        }
        Ok(outcome)
    }

    async fn get_step_execution(&self, key: &StepKey) -> Result<Option<StepExecution>> {
        Ok(self.state.read().await.steps.get(key).cloned())
    }

    async fn list_step_executions(&self, execution_id: &str) -> Result<Vec<StepExecution>> {
        let state = self.state.read().await;
        let mut rows: Vec<StepExecution> = state
            .steps
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then_with(|| a.key().cmp(&b.key()))
        });
        Ok(rows)
    }

    async fn cancel_active_steps(&self, execution_id: &str, at: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let active: Vec<StepKey> = state
            .steps
            .values()
            .filter(|r| r.execution_id == execution_id && r.status.is_active())
            .map(StepExecution::key)
            .collect();

        let event = StepEvent::finished(super::StepStatus::Cancelled, at);
        let mut changed = 0;
        for key in active {
            let outcome = state_merge::apply(state.steps.get(&key), &key, &[event.clone()], at);
            if let Some(row) = outcome.row() {
                state.steps.insert(key, row.clone());
                changed += 1;
            }
        }
        debug!(execution_id, changed, "Cancelled active steps");
        Ok(changed)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.state
            .write()
            .await
            .checkpoints
            .entry(checkpoint.execution_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn latest_checkpoint(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .state
            .read()
            .await
            .checkpoints
            .get(execution_id)
            .and_then(|list| list.last().cloned()))
    }
}
