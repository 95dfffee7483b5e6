//! End-to-end execution through the public API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use weft::engine::Executor;
use weft::monitor::{EngineEvent, Monitor};
use weft::nodes::{StepContext, StepExecutor, StepOutcome, StepRegistry};
use weft::storage::{ExecutionStatus, MemoryStorage, StepStatus, Storage, Trigger};
use weft::workflow::{parse_workflow, Connection, Step, WorkflowDraft, WorkflowVersion};
use weft::{Error, Result};

/// Sleeps for `sleep_ms` (default 60s).
struct SlowStep;

#[async_trait]
impl StepExecutor for SlowStep {
    fn type_id(&self) -> &str {
        "slow"
    }

    async fn execute(&self, config: &Value, input: &Value, _ctx: &StepContext) -> Result<StepOutcome> {
        let sleep_ms = config
            .get("sleep_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(60_000);
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        Ok(StepOutcome::ok(input.clone()))
    }
}

/// Fails on odd numbers.
struct RejectOddStep;

#[async_trait]
impl StepExecutor for RejectOddStep {
    fn type_id(&self) -> &str {
        "reject_odd"
    }

    async fn execute(&self, _config: &Value, input: &Value, _ctx: &StepContext) -> Result<StepOutcome> {
        match input.as_i64() {
            Some(n) if n % 2 == 0 => Ok(StepOutcome::ok(json!(n))),
            _ => Err(Error::Step(format!("odd input {}", input))),
        }
    }
}

fn registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.register(Arc::new(SlowStep));
    registry.register(Arc::new(RejectOddStep));
    registry
}

fn setup() -> (Executor, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    (Executor::new(registry(), storage.clone()), storage)
}

fn version(yaml: &str) -> WorkflowVersion {
    WorkflowVersion::new(1, parse_workflow(yaml).unwrap())
}

#[tokio::test]
async fn linear_identity_workflow_records_full_context() {
    let (executor, storage) = setup();
    let wf = version(
        r#"
name: linear
steps:
  - id: step_1
    type: identity
  - id: step_2
    type: identity
connections:
  - from: step_1
    to: step_2
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!({"value": 1})))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        serde_json::to_value(&execution.context).unwrap(),
        json!({"step_1": {"value": 1}, "step_2": {"value": 1}})
    );
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == StepStatus::Completed));
}

#[tokio::test]
async fn cancelling_long_step_cancels_its_row() {
    let (executor, storage) = setup();
    let monitor = Monitor::new();
    let mut events = monitor.subscribe();
    let executor = executor.with_monitor(monitor);
    let wf = version(
        r#"
name: long-running
steps:
  - id: fast
    type: identity
  - id: slow
    type: slow
    depends_on: [fast]
"#,
    );

    let handle = executor.start(&wf, Trigger::manual(json!({}))).await.unwrap();
    let execution_id = handle.execution_id.clone();

    loop {
        if let EngineEvent::StepStarted { step } = events.recv().await.unwrap() {
            if step.step_id == "slow" {
                break;
            }
        }
    }
    assert!(executor.runs().is_running(&execution_id).await);

    let cancelled = executor.cancel(&execution_id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    let finished = handle.wait().await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Cancelled);
    assert_eq!(finished.error.unwrap().error_type, "cancelled");

    let rows = storage.list_step_executions(&execution_id).await.unwrap();
    let slow = rows.iter().find(|r| r.step_id == "slow").unwrap();
    let fast = rows.iter().find(|r| r.step_id == "fast").unwrap();
    assert_eq!(slow.status, StepStatus::Cancelled);
    assert_eq!(fast.status, StepStatus::Completed);

    let err = executor.cancel(&execution_id).await.unwrap_err();
    assert_eq!(err.code(), "ALREADY_TERMINAL");
}

#[tokio::test]
async fn map_item_failures_stay_isolated() {
    let (executor, storage) = setup();
    let wf = version(
        r#"
name: map-isolation
steps:
  - id: evens
    type: reject_odd
    execution_mode: map
    batch_size: 2
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!([1, 2, 3, 4])))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!([2, 4])));

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    let items = &rows[0].metadata["items"];
    assert_eq!(items["total"], json!(4));
    assert_eq!(items["successful"], json!(2));
    assert_eq!(items["failed"], json!(2));
    assert_eq!(items["skipped"], json!(0));
}

#[tokio::test]
async fn join_waits_for_both_branches() {
    let (executor, _storage) = setup();
    let wf = version(
        r#"
name: diamond
steps:
  - id: a
    type: identity
  - id: b
    type: set
    depends_on: [a]
    config:
      fields:
        - name: branch
          value: b
  - id: c
    type: set
    depends_on: [a]
    config:
      fields:
        - name: branch
          value: c
  - id: d
    type: identity
    depends_on: [b, c]
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!({"n": 1})))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.output,
        Some(json!([{"n": 1, "branch": "b"}, {"n": 1, "branch": "c"}]))
    );
}

#[tokio::test]
async fn switch_routes_by_branch_name() {
    let (executor, storage) = setup();
    let wf = version(
        r#"
name: router
steps:
  - id: route
    type: switch
    config:
      field: input.kind
      cases:
        - value: refund
          branch: refunds
      default_branch: other
  - id: refunds
    type: identity
  - id: other
    type: identity
connections:
  - from: route
    to: refunds
    source_output: refunds
  - from: route
    to: other
    source_output: other
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!({"kind": "refund"})))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.context.contains_key("refunds"));
    assert!(!execution.context.contains_key("other"));

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    let other = rows.iter().find(|r| r.step_id == "other").unwrap();
    assert_eq!(other.status, StepStatus::Skipped);
}

#[tokio::test]
async fn published_draft_runs_with_templates() {
    let (executor, _storage) = setup();
    let mut draft = WorkflowDraft::new("drafted");
    draft.add_step(Step::new("fetch", "identity")).unwrap();
    draft
        .add_step(Step::new("greet", "set").with_config(json!({
            "fields": [{"name": "greeting", "value": "hello {{ nodes.fetch.output.name }}"}],
            "replace": true,
        })))
        .unwrap();
    draft.add_connection(Connection::new("fetch", "greet")).unwrap();

    let err = draft
        .add_connection(Connection::new("greet", "fetch"))
        .unwrap_err();
    assert_eq!(err.code(), "CYCLE_DETECTED");

    let version = draft.publish(1).unwrap();
    let execution = executor
        .execute(&version, Trigger::manual(json!({"name": "ada"})))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!({"greeting": "hello ada"})));
}

#[tokio::test]
async fn join_inside_fan_out_runs_once_per_item() {
    let (executor, storage) = setup();
    let wf = version(
        r#"
name: fan-diamond
steps:
  - id: split
    type: split
  - id: b
    type: identity
    depends_on: [split]
  - id: c
    type: identity
    depends_on: [split]
  - id: d
    type: identity
    depends_on: [b, c]
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!([1, 2])))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.context["d"], json!([[1, 1], [2, 2]]));

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    let mut d_items: Vec<Option<usize>> = rows
        .iter()
        .filter(|r| r.step_id == "d")
        .map(|r| r.item_index)
        .collect();
    d_items.sort();
    assert_eq!(d_items, vec![Some(0), Some(1)]);
}

#[tokio::test]
async fn reduce_folds_inputs_from_outside_the_fan_out() {
    let (executor, _storage) = setup();
    let wf = version(
        r#"
name: mixed-depth
steps:
  - id: root
    type: identity
  - id: split
    type: split
    depends_on: [root]
  - id: each
    type: identity
    depends_on: [split]
  - id: total
    type: aggregate
    config:
      operation: collect
    depends_on: [each, root]
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!([1, 2])))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.context["total"], json!([[1, 2], 1, 2]));
    assert_eq!(execution.output, Some(json!([[1, 2], 1, 2])));
}

#[tokio::test]
async fn unresolvable_join_fails_the_run() {
    let (executor, _storage) = setup();
    let wf = version(
        r#"
name: zip
steps:
  - id: left
    type: split
    config:
      field: input.a
  - id: right
    type: split
    config:
      field: input.b
  - id: pair
    type: identity
    depends_on: [left, right]
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!({"a": [1, 2], "b": [1, 2, 3]})))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.unwrap();
    assert_eq!(error.error_type, "execution_error");
    assert_eq!(error.details["code"], json!("INCOMPLETE_BARRIER"));
    assert_eq!(error.details["waiting"], json!(["pair::join"]));
}

#[tokio::test]
async fn chained_map_steps_keep_item_failures() {
    let (executor, storage) = setup();
    let wf = version(
        r#"
name: map-chain
steps:
  - id: evens
    type: reject_odd
    execution_mode: map
  - id: again
    type: identity
    execution_mode: map
    depends_on: [evens]
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!([1, 2, 3, 4])))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!([2, 4])));

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    let again = rows.iter().find(|r| r.step_id == "again").unwrap();
    let items = &again.metadata["items"];
    assert_eq!(items["total"], json!(4));
    assert_eq!(items["successful"], json!(2));
    assert_eq!(items["failed"], json!(0));
    assert_eq!(items["skipped"], json!(2));
}

#[tokio::test]
async fn templates_see_item_and_collected_outputs() {
    let (executor, _storage) = setup();
    let wf = version(
        r#"
name: fan-templates
steps:
  - id: split
    type: split
  - id: each
    type: identity
    depends_on: [split]
  - id: tag
    type: set
    depends_on: [each]
    config:
      replace: true
      fields:
        - name: own
          value: "{{ nodes.each.output }}"
  - id: total
    type: aggregate
    depends_on: [tag]
  - id: report
    type: set
    depends_on: [total]
    config:
      replace: true
      fields:
        - name: seen
          value: "{{ nodes.each.output }}"
"#,
    );

    let execution = executor
        .execute(&wf, Trigger::manual(json!([1, 2])))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.context["tag"], json!([{"own": 1}, {"own": 2}]));
    assert_eq!(execution.output, Some(json!({"seen": [1, 2]})));
}
