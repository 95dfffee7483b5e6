//! Engine metrics.
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding application.
//!
//! ## Metrics
//!
//! ### Counters
//! - `weft_executions_total` - Finished executions by status
//! - `weft_steps_executed_total` - Step attempts by step type and status
//! - `weft_map_items_total` - Map-mode items by outcome
//! - `weft_state_merges_total` - Merged step-state writes by result
//!
//! ### Histograms
//! - `weft_execution_duration_seconds` - Execution wall time
//! - `weft_step_duration_seconds` - Step attempt duration by step type
//!
//! ### Gauges
//! - `weft_active_executions` - Currently running executions

use std::time::Duration;

use metrics::{counter, gauge, histogram};

// =============================================================================
// Execution Metrics
// =============================================================================

/// Record a finished execution.
pub fn record_execution(status: &str) {
    counter!("weft_executions_total", "status" => status.to_string()).increment(1);
}

/// Record execution duration.
pub fn record_execution_duration(duration: Duration, workflow_name: &str) {
    histogram!(
        "weft_execution_duration_seconds",
        "workflow" => workflow_name.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment active executions gauge.
pub fn inc_active_executions() {
    gauge!("weft_active_executions").increment(1.0);
}

/// Decrement active executions gauge.
pub fn dec_active_executions() {
    gauge!("weft_active_executions").decrement(1.0);
}

// =============================================================================
// Step Metrics
// =============================================================================

/// Record one step attempt.
pub fn record_step_execution(step_type: &str, status: &str) {
    counter!(
        "weft_steps_executed_total",
        "type" => step_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record step attempt duration.
pub fn record_step_duration(duration: Duration, step_type: &str) {
    histogram!(
        "weft_step_duration_seconds",
        "type" => step_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record map-mode item outcomes.
pub fn record_map_items(successful: usize, failed: usize, skipped: usize) {
    counter!("weft_map_items_total", "outcome" => "successful").increment(successful as u64);
    counter!("weft_map_items_total", "outcome" => "failed").increment(failed as u64);
    counter!("weft_map_items_total", "outcome" => "skipped").increment(skipped as u64);
}

// =============================================================================
// State Metrics
// =============================================================================

/// Record a merged step-state write (`applied`, `noop`, `rejected`).
pub fn record_state_merge(result: &str) {
    counter!("weft_state_merges_total", "result" => result.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_execution("completed");
        record_step_execution("identity", "completed");
        record_step_duration(Duration::from_millis(5), "identity");
        record_map_items(3, 1, 0);
        inc_active_executions();
        dec_active_executions();
    }
}
