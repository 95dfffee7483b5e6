//! Switch step - multi-way branch selection.
//!
//! The selected case's `branch` becomes the output route.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::if_node::evaluate_condition;
use super::template::resolve_field;
use super::types::{StepContext, StepExecutor, StepKind, StepOutcome, StepOutput};
use crate::error::{Error, Result};

/// Switch step implementation.
pub struct SwitchStep;

impl SwitchStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SwitchStep {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SwitchConfig {
    field: Value,
    #[serde(default)]
    cases: Vec<SwitchCase>,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SwitchCase {
    value: Value,
    branch: String,
    #[serde(default = "default_operator")]
    operator: String,
}

fn default_operator() -> String {
    "equals".to_string()
}

fn parse_config(config: &Value) -> Result<SwitchConfig> {
    let config: SwitchConfig = serde_json::from_value(config.clone())
        .map_err(|e| Error::Step(format!("Invalid switch config: {}", e)))?;

    if config.cases.is_empty() && config.default_branch.is_none() {
        return Err(Error::Step(
            "Switch step requires at least one case or a default_branch".to_string(),
        ));
    }
    Ok(config)
}

#[async_trait]
impl StepExecutor for SwitchStep {
    fn type_id(&self) -> &str {
        "switch"
    }

    fn kind(&self) -> StepKind {
        StepKind::Condition
    }

    fn description(&self) -> &str {
        "Route to the branch of the first matching case"
    }

    async fn execute(&self, config: &Value, input: &Value, _ctx: &StepContext) -> Result<StepOutcome> {
        let config = parse_config(config)?;

        let field_value = resolve_field(&config.field, input);
        let mut matched = None;
        for (idx, case) in config.cases.iter().enumerate() {
            if evaluate_condition(&field_value, &case.operator, &case.value)? {
                matched = Some((idx, case.branch.clone()));
                break;
            }
        }

        let (matched_case_index, branch) = match matched {
            Some((idx, branch)) => (Some(idx), branch),
            None => match config.default_branch {
                Some(branch) => (None, branch),
                None => {
                    return Ok(StepOutcome::skip(
                        "No switch case matched and no default_branch set",
                    ))
                }
            },
        };

        Ok(StepOutput::with_metadata(
            input.clone(),
            json!({
                "matched_case_index": matched_case_index,
                "field_value": field_value,
            }),
        )
        .routed(branch)
        .into())
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        parse_config(config).map(|_| ()).map_err(|e| vec![e.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Value {
        json!({
            "field": "input.kind",
            "cases": [
                {"value": "refund", "branch": "refunds"},
                {"value": "gift", "branch": "gifts", "operator": "contains"}
            ],
            "default_branch": "other"
        })
    }

    async fn route(config: &Value, input: Value) -> StepOutcome {
        let ctx = StepContext::new("exec", "wf");
        SwitchStep::new().execute(config, &input, &ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_switch_cases() {
        let StepOutcome::Ok(out) = route(&config(), json!({"kind": "refund"})).await else {
            panic!("expected ok");
        };
        assert_eq!(out.route.as_deref(), Some("refunds"));

        let StepOutcome::Ok(out) = route(&config(), json!({"kind": "giftcard"})).await else {
            panic!("expected ok");
        };
        assert_eq!(out.route.as_deref(), Some("gifts"));

        let StepOutcome::Ok(out) = route(&config(), json!({"kind": "order"})).await else {
            panic!("expected ok");
        };
        assert_eq!(out.route.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_switch_no_match_skips() {
        let config = json!({"field": "input.kind", "cases": [{"value": "a", "branch": "a"}]});
        let outcome = route(&config, json!({"kind": "b"})).await;
        assert!(matches!(outcome, StepOutcome::Skip(_)));
    }
}
