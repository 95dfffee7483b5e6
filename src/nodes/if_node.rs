//! IF step - two-way conditional branching.
//!
//! The input passes through unchanged; the output is routed to `true` or
//! `false` so that only connections leaving that port fire.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::template::resolve_field;
use super::types::{StepContext, StepExecutor, StepKind, StepOutcome, StepOutput};
use crate::error::{Error, Result};

/// IF step implementation.
pub struct IfStep;

impl IfStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IfStep {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct IfConfig {
    conditions: Vec<Condition>,
    #[serde(default = "default_match_mode")]
    match_mode: String, // "all" | "any"
}

#[derive(Debug, Deserialize)]
struct Condition {
    field: Value,
    operator: String,
    #[serde(default)]
    value: Value,
}

fn default_match_mode() -> String {
    "all".to_string()
}

fn parse_config(config: &Value) -> Result<IfConfig> {
    let config: IfConfig = serde_json::from_value(config.clone())
        .map_err(|e| Error::Step(format!("Invalid if config: {}", e)))?;

    if config.conditions.is_empty() {
        return Err(Error::Step("IF step requires at least one condition".to_string()));
    }

    let match_mode = config.match_mode.to_lowercase();
    if match_mode != "all" && match_mode != "any" {
        return Err(Error::Step(format!(
            "Invalid match_mode '{}', expected 'all' or 'any'",
            config.match_mode
        )));
    }

    Ok(config)
}

#[async_trait]
impl StepExecutor for IfStep {
    fn type_id(&self) -> &str {
        "if"
    }

    fn kind(&self) -> StepKind {
        StepKind::Condition
    }

    fn description(&self) -> &str {
        "Evaluate conditions and route to the true or false port"
    }

    async fn execute(&self, config: &Value, input: &Value, _ctx: &StepContext) -> Result<StepOutcome> {
        let config = parse_config(config)?;

        let mut results = Vec::with_capacity(config.conditions.len());
        for condition in &config.conditions {
            let left = resolve_field(&condition.field, input);
            results.push(evaluate_condition(&left, &condition.operator, &condition.value)?);
        }

        let condition_result = if config.match_mode.eq_ignore_ascii_case("any") {
            results.iter().any(|r| *r)
        } else {
            results.iter().all(|r| *r)
        };

        Ok(StepOutput::with_metadata(
            input.clone(),
            json!({
                "condition_result": condition_result,
                "conditions_evaluated": results.len(),
            }),
        )
        .routed(condition_result.to_string())
        .into())
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        parse_config(config).map(|_| ()).map_err(|e| vec![e.to_string()])
    }
}

/// Compare `left` against `right` with a named operator.
pub(crate) fn evaluate_condition(left: &Value, operator: &str, right: &Value) -> Result<bool> {
    match operator {
        "equals" => Ok(left == right),
        "not_equals" => Ok(left != right),
        "exists" => Ok(!left.is_null()),
        "contains" => match left {
            Value::String(s) => Ok(right
                .as_str()
                .map(|needle| s.contains(needle))
                .unwrap_or(false)),
            Value::Array(items) => Ok(items.contains(right)),
            Value::Object(map) => Ok(right.as_str().map(|k| map.contains_key(k)).unwrap_or(false)),
            _ => Ok(false),
        },
        "gt" | "lt" | "gte" | "lte" => {
            let l = as_f64(left).ok_or_else(|| {
                Error::Step(format!(
                    "Operator '{}' requires numeric left operand",
                    operator
                ))
            })?;
            let r = as_f64(right).ok_or_else(|| {
                Error::Step(format!(
                    "Operator '{}' requires numeric right operand",
                    operator
                ))
            })?;
            Ok(match operator {
                "gt" => l > r,
                "lt" => l < r,
                "gte" => l >= r,
                _ => l <= r,
            })
        }
        "regex" => {
            let pattern = right
                .as_str()
                .ok_or_else(|| Error::Step("regex operator requires string pattern".to_string()))?;
            let text = match left {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let regex = regex_lite::Regex::new(pattern)
                .map_err(|e| Error::Step(format!("Invalid regex '{}': {}", pattern, e)))?;
            Ok(regex.is_match(&text))
        }
        _ => Err(Error::Step(format!("Unsupported operator '{}'", operator))),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(config: Value, input: Value) -> StepOutput {
        let ctx = StepContext::new("exec-1", "wf");
        match IfStep::new().execute(&config, &input, &ctx).await.unwrap() {
            StepOutcome::Ok(out) => out,
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_if_true_route() {
        let out = run(
            json!({
                "conditions": [{"field": "input.priority", "operator": "equals", "value": "high"}]
            }),
            json!({"priority": "high"}),
        )
        .await;
        assert_eq!(out.route.as_deref(), Some("true"));
        assert_eq!(out.data, json!({"priority": "high"}));
    }

    #[tokio::test]
    async fn test_if_false_route() {
        let out = run(
            json!({
                "conditions": [{"field": "input.score", "operator": "gt", "value": 90}]
            }),
            json!({"score": 88}),
        )
        .await;
        assert_eq!(out.route.as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn test_if_any_mode() {
        let out = run(
            json!({
                "match_mode": "any",
                "conditions": [
                    {"field": "input.a", "operator": "equals", "value": 1},
                    {"field": "input.b", "operator": "exists"}
                ]
            }),
            json!({"a": 2, "b": true}),
        )
        .await;
        assert_eq!(out.route.as_deref(), Some("true"));
    }

    #[test]
    fn test_validate_config() {
        assert!(IfStep::new().validate_config(&json!({"conditions": []})).is_err());
        assert!(IfStep::new()
            .validate_config(&json!({"conditions": [{"field": "input", "operator": "exists"}], "match_mode": "some"}))
            .is_err());
    }
}
