//! Partial runs: target selection, pinned outputs and run-from-step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;

use weft::engine::{plan_subset, Executor, PartialRun};
use weft::nodes::StepRegistry;
use weft::storage::{ExecutionStatus, MemoryStorage, StepStatus, Storage, Trigger};
use weft::workflow::{parse_workflow, WorkflowVersion};

const DIAMOND: &str = r#"
name: diamond
steps:
  - id: a
    type: set
    config:
      fields:
        - name: from
          value: a
  - id: b
    type: set
    depends_on: [a]
    config:
      fields:
        - name: via
          value: b
  - id: c
    type: identity
    depends_on: [a]
  - id: d
    type: identity
    depends_on: [b, c]
"#;

fn diamond() -> WorkflowVersion {
    WorkflowVersion::new(1, parse_workflow(DIAMOND).unwrap())
}

fn setup() -> (Executor, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    (Executor::new(StepRegistry::new(), storage.clone()), storage)
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn subset_covers_all_ancestors() {
    let wf = diamond().workflow;
    let order = plan_subset(&ids(&["d"]), &wf.steps, &wf.connections, &HashSet::new()).unwrap();
    assert_eq!(order, ids(&["a", "b", "c", "d"]));
}

#[test]
fn subset_stops_at_pinned_steps() {
    let wf = diamond().workflow;
    let pinned: HashSet<String> = ["a".to_string()].into();
    let order = plan_subset(&ids(&["d"]), &wf.steps, &wf.connections, &pinned).unwrap();
    assert_eq!(order, ids(&["b", "c", "d"]));
}

#[test]
fn subset_rejects_unknown_target() {
    let wf = diamond().workflow;
    let err = plan_subset(&ids(&["zzz"]), &wf.steps, &wf.connections, &HashSet::new()).unwrap_err();
    assert_eq!(err.code(), "GRAPH_ERROR");
}

#[tokio::test]
async fn partial_run_only_touches_ancestors() {
    let (executor, storage) = setup();
    let execution = executor
        .execute_partial(&diamond(), Trigger::manual(json!({})), PartialRun::new(ids(&["b"])))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!({"from": "a", "via": "b"})));

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    let mut touched: Vec<&str> = rows.iter().map(|r| r.step_id.as_str()).collect();
    touched.sort();
    assert_eq!(touched, vec!["a", "b"]);
}

#[tokio::test]
async fn pinned_output_replaces_step() {
    let (executor, storage) = setup();
    let mut partial = PartialRun::new(ids(&["d"]));
    partial.pinned.insert("a".to_string(), json!({"from": "pin"}));

    let execution = executor
        .execute_partial(&diamond(), Trigger::manual(json!({})), partial)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.output,
        Some(json!([{"from": "pin", "via": "b"}, {"from": "pin"}]))
    );
    assert_eq!(execution.context["a"], json!({"from": "pin"}));

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    let a = rows.iter().find(|r| r.step_id == "a").unwrap();
    assert_eq!(a.status, StepStatus::Completed);
    assert_eq!(a.metadata["source"], json!("pinned"));
    assert!(a.started_at.is_none());
}

#[tokio::test]
async fn run_from_step_requires_its_output() {
    let (executor, _storage) = setup();
    let err = executor
        .execute_from(&diamond(), Trigger::manual(json!({})), "b", HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NODE_NOT_PINNED");
}

#[tokio::test]
async fn run_from_step_reruns_downstream() {
    let (executor, storage) = setup();
    let pinned = HashMap::from([
        ("b".to_string(), json!({"via": "pinned-b"})),
        ("c".to_string(), json!({"via": "pinned-c"})),
    ]);

    let execution = executor
        .execute_from(&diamond(), Trigger::manual(json!({})), "b", pinned)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.output,
        Some(json!([{"via": "pinned-b"}, {"via": "pinned-c"}]))
    );

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    assert!(rows.iter().all(|r| r.step_id != "a"));
    let d = rows.iter().find(|r| r.step_id == "d").unwrap();
    assert_eq!(d.status, StepStatus::Completed);
    assert!(d.started_at.is_some());
}

#[tokio::test]
async fn run_from_step_leaves_upstream_alone() {
    let (executor, storage) = setup();
    let wf = WorkflowVersion::new(
        1,
        parse_workflow(
            r#"
name: linear
steps:
  - id: a
    type: identity
  - id: b
    type: identity
    depends_on: [a]
  - id: c
    type: identity
    depends_on: [b]
"#,
        )
        .unwrap(),
    );
    let pinned = HashMap::from([("b".to_string(), json!({"pinned": true}))]);

    let execution = executor
        .execute_from(&wf, Trigger::manual(json!({"raw": 1})), "b", pinned)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!({"pinned": true})));
    assert_eq!(execution.metadata["partial"]["from"], json!("b"));

    let rows = storage.list_step_executions(&execution.id).await.unwrap();
    let mut touched: Vec<&str> = rows.iter().map(|r| r.step_id.as_str()).collect();
    touched.sort();
    assert_eq!(touched, vec!["b", "c"]);
}

#[tokio::test]
async fn partial_run_output_ignores_steps_feeding_pinned_ones() {
    let (executor, _storage) = setup();
    let partial = PartialRun::new(ids(&["d"]))
        .pin("b", json!({"via": "pinned-b"}))
        .pin("c", json!({"via": "pinned-c"}));

    let execution = executor
        .execute_partial(&diamond(), Trigger::manual(json!({})), partial)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.output,
        Some(json!([{"via": "pinned-b"}, {"via": "pinned-c"}]))
    );
}
