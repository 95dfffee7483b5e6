//! Storage models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorBody;

/// Execution status.
///
/// `pending -> running -> {completed, failed, timeout, cancelled}`; the four
/// right-hand states are terminal and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Allowed-transition table.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Tie-break priority among statuses of the same class.
    ///
    /// Terminal: failed > cancelled > completed > skipped.
    /// Active: running > queued > pending.
    pub fn priority(self) -> u8 {
        match self {
            Self::Failed => 3,
            Self::Cancelled => 2,
            Self::Completed => 1,
            Self::Skipped => 0,
            Self::Running => 2,
            Self::Queued => 1,
            Self::Pending => 0,
        }
    }

    /// Active states only move forward; terminal states never change.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.priority() > self.priority()
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Trigger {
    pub fn new(trigger_type: &str, data: Value) -> Self {
        Self {
            trigger_type: trigger_type.to_string(),
            data,
        }
    }

    pub fn manual(data: Value) -> Self {
        Self::new("manual", data)
    }
}

/// Execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_name: String,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub trigger: Trigger,
    /// `step_id -> output` for every step that produced something.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    pub output: Option<Value>,
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Execution this one was resumed from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// A fresh pending execution.
    pub fn pending(
        id: String,
        workflow_name: &str,
        workflow_version: u32,
        trigger: Trigger,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            workflow_name: workflow_name.to_string(),
            workflow_version,
            status: ExecutionStatus::Pending,
            trigger,
            context: BTreeMap::new(),
            output: None,
            error: None,
            metadata,
            resumed_from: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Identity of one StepExecution row.
///
/// `item_index` is set for rows that record a single fanned-out item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub execution_id: String,
    pub step_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub item_index: Option<usize>,
}

impl StepKey {
    pub fn new(execution_id: &str, step_id: &str, attempt: u32) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            attempt,
            item_index: None,
        }
    }

    pub fn with_item(mut self, item_index: Option<usize>) -> Self {
        self.item_index = item_index;
        self
    }
}

/// One row per step attempt (and per fanned-out item).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: String,
    pub execution_id: String,
    pub step_id: String,
    pub step_type_id: String,
    pub status: StepStatus,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub output_item_count: Option<u64>,
    pub error: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub retry_of_id: Option<String>,
    #[serde(default)]
    pub item_index: Option<usize>,
}

impl StepExecution {
    pub fn key(&self) -> StepKey {
        StepKey {
            execution_id: self.execution_id.clone(),
            step_id: self.step_id.clone(),
            attempt: self.attempt,
            item_index: self.item_index,
        }
    }

    /// Whether the row carries a real identity rather than a placeholder id.
    pub fn has_identity(&self) -> bool {
        !self.step_type_id.is_empty()
    }
}

/// Snapshot of completed step outputs, used to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub execution_id: String,
    /// Step whose resolution triggered this checkpoint
    pub step_id: String,
    pub step_outputs: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_transitions() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Timeout));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Timeout, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Running));
            assert!(!terminal.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_step_transitions() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!("timeout".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Timeout);
        assert_eq!(StepStatus::Skipped.to_string(), "skipped");
        assert!("bogus".parse::<StepStatus>().is_err());
    }
}
