//! Workflow validation.

use std::collections::HashSet;

use super::graph::Graph;
use super::types::{OnErrorAction, Workflow};
use crate::error::{BuildError, Error, Result};
use crate::nodes::StepRegistry;

/// Validate a workflow definition.
///
/// Checks for:
/// - Required fields (name, steps)
/// - Unique, non-empty step IDs and non-empty types
/// - Sane per-step options (batch size, fallback values)
/// - Connection endpoints that resolve, and no cycles
pub fn validate_workflow(workflow: &Workflow) -> Result<()> {
    if workflow.name.is_empty() {
        return Err(Error::Validation("Workflow name is required".into()));
    }

    if !workflow
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(
            "Workflow name must contain only alphanumeric characters, hyphens, and underscores"
                .into(),
        ));
    }

    if workflow.steps.is_empty() {
        return Err(Error::Validation(
            "Workflow must have at least one step".into(),
        ));
    }

    let mut ids = HashSet::new();
    for step in &workflow.steps {
        if step.id.is_empty() {
            return Err(Error::Validation("Step ID cannot be empty".into()));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(Error::Validation(format!("Duplicate step ID: {}", step.id)));
        }
        if step.type_id.is_empty() {
            return Err(Error::Validation(format!(
                "Step '{}' has empty type",
                step.id
            )));
        }
        if step.batch_size == Some(0) {
            return Err(Error::Validation(format!(
                "Step '{}' has batch_size 0; it must be at least 1",
                step.id
            )));
        }
        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                return Err(Error::Validation(format!(
                    "Step '{}' has retry.max_attempts 0; it must be at least 1",
                    step.id
                )));
            }
        }
        if let Some(error_config) = &step.on_error {
            if error_config.action == OnErrorAction::Fallback
                && error_config.fallback_value.is_none()
            {
                return Err(Error::Validation(format!(
                    "Step '{}' has on_error.action=fallback but missing fallback_value",
                    step.id
                )));
            }
        }
    }

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(Error::Validation(format!(
                    "Step '{}' depends on non-existent step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    let graph = Graph::build(&workflow.steps, &workflow.connections)?;
    graph.topological_sort()?;

    Ok(())
}

/// Check every step type against a registry and run each executor's
/// config validation.
pub fn validate_step_types(workflow: &Workflow, registry: &StepRegistry) -> Result<()> {
    let mut issues = Vec::new();

    for step in &workflow.steps {
        let Some(executor) = registry.get(&step.type_id) else {
            return Err(BuildError::StepResolutionFailed {
                step_id: step.id.clone(),
                type_id: step.type_id.clone(),
            }
            .into());
        };
        if let Err(problems) = executor.validate_config(&step.config) {
            issues.extend(problems.into_iter().map(|p| format!("{}: {}", step.id, p)));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(issues.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::workflow::parse_workflow;

    #[test]
    fn test_validate_empty_name() {
        let yaml = r#"
name: ""
steps:
  - id: a
    type: identity
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn test_validate_invalid_name() {
        let yaml = r#"
name: "my workflow!"
steps:
  - id: a
    type: identity
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let yaml = r#"
name: test
steps:
  - id: a
    type: identity
  - id: a
    type: identity
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn test_validate_unknown_connection_target() {
        let yaml = r#"
name: test
steps:
  - id: a
    type: identity
connections:
  - id: c1
    from: a
    to: nonexistent
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let err = validate_workflow(&workflow).unwrap_err();
        assert_eq!(err.code(), "INVALID_CONNECTIONS");
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_validate_cycle() {
        let yaml = r#"
name: test
steps:
  - id: a
    type: identity
    depends_on: [b]
  - id: b
    type: identity
    depends_on: [a]
"#;
        let workflow = parse_workflow(yaml).unwrap();
        match validate_workflow(&workflow).unwrap_err() {
            Error::Graph(GraphError::CycleDetected(ids)) => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_valid_workflow() {
        let yaml = r#"
name: valid-workflow
steps:
  - id: step1
    type: identity
  - id: step2
    type: set
    depends_on: [step1]
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn test_validate_fallback_action_requires_value() {
        let yaml = r#"
name: fallback-workflow
steps:
  - id: risky
    type: identity
    on_error:
      action: fallback
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(err.to_string().contains("fallback_value"));
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let yaml = r#"
name: batches
steps:
  - id: each
    type: identity
    execution_mode: map
    batch_size: 0
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn test_validate_step_types() {
        let yaml = r#"
name: types
steps:
  - id: a
    type: teleport
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let err = validate_step_types(&workflow, &StepRegistry::new()).unwrap_err();
        assert_eq!(err.code(), "BUILD_ERROR");
    }
}
