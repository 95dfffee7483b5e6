//! Fire-and-forget engine events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::storage::{Execution, StepExecution, StepStatus};

/// Maximum number of events to buffer in broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Lifecycle events; payloads are the stored records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionStarted { execution: Execution },
    ExecutionFinished { execution: Execution },
    StepStarted { step: StepExecution },
    StepCompleted { step: StepExecution },
    StepSkipped { step: StepExecution },
    StepFailed { step: StepExecution },
}

impl EngineEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution } | Self::ExecutionFinished { execution } => {
                &execution.id
            }
            Self::StepStarted { step }
            | Self::StepCompleted { step }
            | Self::StepSkipped { step }
            | Self::StepFailed { step } => &step.execution_id,
        }
    }
}

/// Broadcasts engine events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct Monitor {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, event: EngineEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.tx.send(event);
    }

    pub fn execution_started(&self, execution: &Execution) {
        self.broadcast(EngineEvent::ExecutionStarted {
            execution: execution.clone(),
        });
    }

    pub fn execution_finished(&self, execution: &Execution) {
        self.broadcast(EngineEvent::ExecutionFinished {
            execution: execution.clone(),
        });
    }

    /// Emit the event matching a step row's status.
    pub fn step(&self, step: &StepExecution) {
        let step = step.clone();
        let event = match step.status {
            StepStatus::Running => EngineEvent::StepStarted { step },
            StepStatus::Completed => EngineEvent::StepCompleted { step },
            StepStatus::Skipped => EngineEvent::StepSkipped { step },
            StepStatus::Failed | StepStatus::Cancelled => EngineEvent::StepFailed { step },
            StepStatus::Pending | StepStatus::Queued => return,
        };
        self.broadcast(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
