//! Step state merging.
//!
//! Step events may arrive duplicated, out of order or batched. Merging is a
//! pure function of the event multiset: events are first put in a total
//! order that does not depend on arrival, then every field is reduced with
//! its own rule. Applying a merge to a stored row goes through the status
//! transition table; a rejected transition is a no-op, never an error.
//!
//! | field | rule |
//! |-------|------|
//! | `status` | latest terminal by `completed_at` (ties: `failed > cancelled > completed > skipped`), else highest active |
//! | `queued_at`, `started_at` | earliest |
//! | `completed_at` | latest; now if terminal and absent |
//! | `input_data` | earliest |
//! | `output_data`, `output_item_count`, `error` | latest among terminal events |
//! | `metadata` | shallow merge in time order |

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{StepExecution, StepKey, StepStatus};

/// A partial step record, as carried by one status update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_item_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the event was emitted; orders events that carry no other time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,

    // Row identity; fills a row that was first written without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of_id: Option<String>,
}

impl StepEvent {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn queued(at: DateTime<Utc>) -> Self {
        Self {
            queued_at: Some(at),
            ..Self::status(StepStatus::Queued)
        }
    }

    pub fn started(at: DateTime<Utc>, input: Value) -> Self {
        Self {
            started_at: Some(at),
            input_data: Some(input),
            ..Self::status(StepStatus::Running)
        }
    }

    pub fn completed(at: DateTime<Utc>, output: Value, item_count: u64) -> Self {
        Self {
            completed_at: Some(at),
            output_data: Some(output),
            output_item_count: Some(item_count),
            ..Self::status(StepStatus::Completed)
        }
    }

    pub fn failed(at: DateTime<Utc>, error: Value) -> Self {
        Self {
            completed_at: Some(at),
            error: Some(error),
            ..Self::status(StepStatus::Failed)
        }
    }

    pub fn finished(status: StepStatus, at: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(at),
            ..Self::status(status)
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_identity(
        mut self,
        row_id: &str,
        step_type_id: &str,
        retry_of_id: Option<String>,
    ) -> Self {
        self.row_id = Some(row_id.to_string());
        self.step_type_id = Some(step_type_id.to_string());
        self.retry_of_id = retry_of_id;
        self
    }

    /// Time used to order this event.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.completed_at
            .or(self.started_at)
            .or(self.queued_at)
            .or(self.observed_at)
    }

    fn is_terminal(&self) -> bool {
        self.status.is_some_and(StepStatus::is_terminal)
    }

    /// A stored row seen as an event, so it merges like any other. A row
    /// written before any identity-carrying event has a generated id and no
    /// type; that placeholder identity is not carried into the merge.
    pub fn from_row(row: &StepExecution) -> Self {
        let identified = row.has_identity();
        Self {
            status: Some(row.status),
            input_data: row.input_data.clone(),
            output_data: row.output_data.clone(),
            output_item_count: row.output_item_count,
            error: row.error.clone(),
            metadata: (!row.metadata.is_empty()).then(|| row.metadata.clone()),
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            observed_at: None,
            row_id: identified.then(|| row.id.clone()),
            step_type_id: identified.then(|| row.step_type_id.clone()),
            retry_of_id: row.retry_of_id.clone(),
        }
    }
}

/// Canonical step state reduced from a set of events.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedState {
    pub status: Option<StepStatus>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub output_item_count: Option<u64>,
    pub error: Option<Value>,
    pub metadata: Map<String, Value>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub row_id: Option<String>,
    pub step_type_id: Option<String>,
    pub retry_of_id: Option<String>,
}

/// Order-independent comparison: time, then status, then content.
fn total_order(a: &StepEvent, b: &StepEvent) -> Ordering {
    a.event_time()
        .cmp(&b.event_time())
        .then_with(|| status_rank(a.status).cmp(&status_rank(b.status)))
        .then_with(|| canonical(a).cmp(&canonical(b)))
}

fn status_rank(status: Option<StepStatus>) -> (u8, u8) {
    match status {
        None => (0, 0),
        Some(s) if s.is_terminal() => (2, s.priority()),
        Some(s) => (1, s.priority()),
    }
}

fn canonical(event: &StepEvent) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

/// Reduce a multiset of events. `now` fills a missing completion time.
pub fn merge(events: &[StepEvent], now: DateTime<Utc>) -> MergedState {
    let mut sorted: Vec<&StepEvent> = events.iter().collect();
    sorted.sort_by(|a, b| total_order(a, b));

    let terminal: Vec<&StepEvent> = sorted.iter().copied().filter(|e| e.is_terminal()).collect();

    let status = if terminal.is_empty() {
        sorted
            .iter()
            .filter_map(|e| e.status.map(|s| (s, e.event_time())))
            .max_by(|(sa, ta), (sb, tb)| sa.priority().cmp(&sb.priority()).then(ta.cmp(tb)))
            .map(|(s, _)| s)
    } else {
        terminal
            .iter()
            .filter_map(|e| e.status.map(|s| (s, e.completed_at)))
            .max_by(|(sa, ca), (sb, cb)| ca.cmp(cb).then(sa.priority().cmp(&sb.priority())))
            .map(|(s, _)| s)
    };

    let queued_at = sorted.iter().filter_map(|e| e.queued_at).min();
    let started_at = sorted.iter().filter_map(|e| e.started_at).min();
    let mut completed_at = sorted.iter().filter_map(|e| e.completed_at).max();
    if completed_at.is_none() && status.is_some_and(StepStatus::is_terminal) {
        completed_at = Some(now);
    }

    let input_data = sorted.iter().find_map(|e| e.input_data.clone());
    let output_data = terminal.iter().rev().find_map(|e| e.output_data.clone());
    let output_item_count = terminal.iter().rev().find_map(|e| e.output_item_count);
    let error = terminal.iter().rev().find_map(|e| e.error.clone());

    let mut metadata = Map::new();
    for event in &sorted {
        if let Some(m) = &event.metadata {
            for (k, v) in m {
                metadata.insert(k.clone(), v.clone());
            }
        }
    }

    MergedState {
        status,
        input_data,
        output_data,
        output_item_count,
        error,
        metadata,
        queued_at,
        started_at,
        completed_at,
        row_id: sorted.iter().find_map(|e| e.row_id.clone()),
        step_type_id: sorted.iter().find_map(|e| e.step_type_id.clone()),
        retry_of_id: sorted.iter().find_map(|e| e.retry_of_id.clone()),
    }
}

/// What applying events to a stored row amounts to.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Insert(StepExecution),
    Update(StepExecution),
    NoOp,
}

impl MergeOutcome {
    pub fn row(&self) -> Option<&StepExecution> {
        match self {
            Self::Insert(row) | Self::Update(row) => Some(row),
            Self::NoOp => None,
        }
    }
}

/// Compute the write that brings `existing` up to date with `events`.
pub fn apply(
    existing: Option<&StepExecution>,
    key: &StepKey,
    events: &[StepEvent],
    now: DateTime<Utc>,
) -> MergeOutcome {
    match try_apply(existing, key, events, now) {
        Ok(outcome) => {
            metrics::record_state_merge(match outcome {
                MergeOutcome::NoOp => "noop",
                _ => "applied",
            });
            outcome
        }
        Err(e) => {
            debug!(
                execution_id = %key.execution_id,
                step_id = %key.step_id,
                attempt = key.attempt,
                "Stale step event ignored: {}",
                e
            );
            metrics::record_state_merge("rejected");
            MergeOutcome::NoOp
        }
    }
}

fn try_apply(
    existing: Option<&StepExecution>,
    key: &StepKey,
    events: &[StepEvent],
    now: DateTime<Utc>,
) -> Result<MergeOutcome> {
    if events.is_empty() {
        return Ok(MergeOutcome::NoOp);
    }

    let mut all: Vec<StepEvent> = Vec::with_capacity(events.len() + 1);
    if let Some(row) = existing {
        all.push(StepEvent::from_row(row));
    }
    all.extend_from_slice(events);
    let merged = merge(&all, now);

    let Some(current) = existing else {
        let row = StepExecution {
            id: merged
                .row_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            execution_id: key.execution_id.clone(),
            step_id: key.step_id.clone(),
            step_type_id: merged.step_type_id.clone().unwrap_or_default(),
            status: merged.status.unwrap_or(StepStatus::Pending),
            input_data: merged.input_data,
            output_data: merged.output_data,
            output_item_count: merged.output_item_count,
            error: merged.error,
            metadata: merged.metadata,
            queued_at: merged.queued_at,
            started_at: merged.started_at,
            completed_at: merged.completed_at,
            attempt: key.attempt,
            retry_of_id: merged.retry_of_id,
            item_index: key.item_index,
        };
        return Ok(MergeOutcome::Insert(row));
    };

    let status = merged.status.unwrap_or(current.status);
    if status != current.status && !current.status.can_transition_to(status) {
        return Err(Error::TransitionRejected {
            from: current.status.to_string(),
            to: status.to_string(),
        });
    }

    let mut next = current.clone();
    next.status = status;
    next.input_data = merged.input_data;
    next.output_data = merged.output_data;
    next.output_item_count = merged.output_item_count;
    next.error = merged.error;
    next.metadata = merged.metadata;
    next.queued_at = merged.queued_at;
    next.started_at = merged.started_at;
    next.completed_at = merged.completed_at;
    if !current.has_identity() {
        if let Some(id) = merged.row_id {
            next.id = id;
        }
        next.step_type_id = merged.step_type_id.unwrap_or_default();
        next.retry_of_id = merged.retry_of_id;
    }

    if &next == current {
        trace!(step_id = %key.step_id, "Step state unchanged");
        return Ok(MergeOutcome::NoOp);
    }
    Ok(MergeOutcome::Update(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_terminal_beats_active() {
        let events = vec![
            StepEvent::completed(t(2), json!(1), 1),
            StepEvent::started(t(5), json!("in")),
        ];
        let merged = merge(&events, t(10));
        assert_eq!(merged.status, Some(StepStatus::Completed));
        assert_eq!(merged.started_at, Some(t(5)));
        assert_eq!(merged.completed_at, Some(t(2)));
        assert_eq!(merged.input_data, Some(json!("in")));
    }

    #[test]
    fn test_terminal_tie_broken_by_priority() {
        let events = vec![
            StepEvent::completed(t(3), json!(1), 1),
            StepEvent::failed(t(3), json!({"message": "x"})),
        ];
        assert_eq!(merge(&events, t(9)).status, Some(StepStatus::Failed));
    }

    #[test]
    fn test_active_highest_priority() {
        let events = vec![
            StepEvent::started(t(1), json!(null)),
            StepEvent::queued(t(4)),
        ];
        assert_eq!(merge(&events, t(9)).status, Some(StepStatus::Running));
    }

    #[test]
    fn test_terminal_without_time_defaults_to_now() {
        let merged = merge(&[StepEvent::status(StepStatus::Skipped)], t(7));
        assert_eq!(merged.completed_at, Some(t(7)));
    }

    #[test]
    fn test_metadata_merges_in_time_order() {
        let mut early = Map::new();
        early.insert("a".into(), json!(1));
        early.insert("b".into(), json!(1));
        let mut late = Map::new();
        late.insert("b".into(), json!(2));

        let events = vec![
            StepEvent::completed(t(5), json!(null), 0).with_metadata(late),
            StepEvent::queued(t(1)).with_metadata(early),
        ];
        let merged = merge(&events, t(9));
        assert_eq!(merged.metadata.get("a"), Some(&json!(1)));
        assert_eq!(merged.metadata.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_commutative_and_idempotent() {
        let e1 = StepEvent::started(t(1), json!({"x": 1}));
        let e2 = StepEvent::completed(t(2), json!({"y": 2}), 1);
        let e3 = StepEvent::queued(t(0));

        let a = merge(&[e1.clone(), e2.clone(), e3.clone()], t(9));
        let b = merge(&[e3.clone(), e2.clone(), e1.clone()], t(9));
        let c = merge(&[e2.clone(), e1.clone(), e3.clone(), e2.clone(), e1], t(9));
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_apply_noop_and_stale() {
        let key = StepKey::new("exec", "s", 1);
        let done = StepEvent::completed(t(2), json!(1), 1).with_identity("row-1", "identity", None);

        let row = match apply(None, &key, &[done.clone()], t(3)) {
            MergeOutcome::Insert(row) => row,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(row.id, "row-1");
        assert_eq!(row.status, StepStatus::Completed);

        // Re-delivery and a late "running" event change nothing.
        assert_eq!(apply(Some(&row), &key, &[done], t(4)), MergeOutcome::NoOp);
        let stale = StepEvent::started(t(1), json!(null));
        let outcome = apply(Some(&row), &key, &[stale], t(4));
        assert!(matches!(&outcome, MergeOutcome::Update(r) if r.status == StepStatus::Completed)
            || outcome == MergeOutcome::NoOp);

        // A different terminal status for a terminal row is rejected.
        let late_fail = StepEvent::failed(t(8), json!({"message": "late"}));
        assert_eq!(apply(Some(&row), &key, &[late_fail], t(9)), MergeOutcome::NoOp);
    }
}
