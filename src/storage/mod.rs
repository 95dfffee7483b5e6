//! Persistence contract for executions, step rows and checkpoints.

mod memory;
mod models;

pub use memory::MemoryStorage;
pub use models::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::state_merge::{MergeOutcome, StepEvent};
use crate::error::Result;

/// Where the engine records what happened.
///
/// Step rows are only ever written through [`Storage::apply_step_events`],
/// which merges rather than overwrites, so duplicate or reordered writes from
/// several tasks converge on the same row.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upsert an execution by id. Rewriting a terminal execution with a
    /// different status is rejected with `TransitionRejected`.
    async fn save_execution(&self, execution: &Execution) -> Result<()>;

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>>;

    /// Executions, newest first, optionally for one workflow.
    async fn list_executions(&self, workflow_name: Option<&str>) -> Result<Vec<Execution>>;

    /// Merge events into the row keyed by `key`, creating it if needed.
    async fn apply_step_events(&self, key: &StepKey, events: &[StepEvent])
        -> Result<MergeOutcome>;

    async fn get_step_execution(&self, key: &StepKey) -> Result<Option<StepExecution>>;

    async fn list_step_executions(&self, execution_id: &str) -> Result<Vec<StepExecution>>;

    /// Mark every still-active row of an execution as cancelled. Returns the
    /// number of rows changed.
    async fn cancel_active_steps(&self, execution_id: &str, at: DateTime<Utc>) -> Result<usize>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn latest_checkpoint(&self, execution_id: &str) -> Result<Option<Checkpoint>>;
}
