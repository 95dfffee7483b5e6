//! Aggregate step - fold a collected list into one value.
//!
//! Used when the list arrives already joined. Under an upstream fan-out the
//! engine folds arriving items itself with the same operations.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::template::resolve_field;
use super::types::{StepContext, StepExecutor, StepKind, StepOutcome, StepOutput};
use crate::engine::reduce::{Accumulator, ReduceOp};
use crate::error::{Error, Result};

/// Aggregate step implementation.
pub struct AggregateStep;

impl AggregateStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AggregateStep {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
struct AggregateConfig {
    #[serde(default)]
    operation: Option<String>,
    /// Path picked out of each item before folding
    #[serde(default)]
    field: Option<String>,
    /// Where the list lives in the input; defaults to the whole input
    #[serde(default)]
    source: Option<Value>,
}

impl AggregateConfig {
    /// `field` relative to each item; `item.price` and `price` are the same.
    fn field_path(&self) -> Option<String> {
        self.field
            .as_deref()
            .map(|f| f.trim_start_matches("item.").to_string())
    }
}

fn parse_config(config: &Value) -> Result<AggregateConfig> {
    if config.is_null() {
        return Ok(AggregateConfig::default());
    }
    let parsed: AggregateConfig = serde_json::from_value(config.clone())
        .map_err(|e| Error::Step(format!("Invalid aggregate config: {}", e)))?;
    if let Some(op) = &parsed.operation {
        serde_json::from_value::<ReduceOp>(Value::String(op.to_lowercase())).map_err(|_| {
            Error::Step(format!(
                "Invalid aggregate operation '{}', expected sum/count/concat/first/last/min/max/collect",
                op
            ))
        })?;
    }
    Ok(parsed)
}

#[async_trait]
impl StepExecutor for AggregateStep {
    fn type_id(&self) -> &str {
        "aggregate"
    }

    fn kind(&self) -> StepKind {
        StepKind::Reduce
    }

    fn description(&self) -> &str {
        "Fold many items into one value (sum/count/concat/first/last/min/max/collect)"
    }

    async fn execute(&self, config: &Value, input: &Value, _ctx: &StepContext) -> Result<StepOutcome> {
        let parsed = parse_config(config)?;

        let source = match &parsed.source {
            Some(source) => resolve_field(source, input),
            None => input.clone(),
        };
        let items = match source {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let op = ReduceOp::from_config(config);
        let mut acc = Accumulator::new(op, parsed.field_path());
        for (idx, item) in items.iter().enumerate() {
            acc.fold(vec![idx], item.clone());
        }

        Ok(StepOutput::with_metadata(
            acc.finish(),
            json!({
                "operation": op,
                "field": parsed.field,
                "items_count": items.len(),
            }),
        )
        .into())
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        parse_config(config).map(|_| ()).map_err(|e| vec![e.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn aggregate(config: Value, input: Value) -> Value {
        let ctx = StepContext::new("exec", "wf");
        match AggregateStep::new().execute(&config, &input, &ctx).await.unwrap() {
            StepOutcome::Ok(out) => out.data,
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_aggregate_sum_field() {
        let out = aggregate(
            json!({"operation": "sum", "field": "price"}),
            json!([{"price": 2}, {"price": 5}]),
        )
        .await;
        assert_eq!(out, json!(7));
    }

    #[tokio::test]
    async fn test_aggregate_item_prefixed_field() {
        let out = aggregate(
            json!({"operation": "collect", "field": "item.sku"}),
            json!([{"sku": "a"}, {"sku": "b"}, {"price": 1}]),
        )
        .await;
        assert_eq!(out, json!(["a", "b", null]));
    }

    #[tokio::test]
    async fn test_aggregate_default_collect() {
        assert_eq!(aggregate(Value::Null, json!([1, 2])).await, json!([1, 2]));
        assert_eq!(aggregate(Value::Null, Value::Null).await, json!([]));
    }

    #[tokio::test]
    async fn test_aggregate_source_path() {
        let out = aggregate(
            json!({"operation": "max", "source": "input.scores"}),
            json!({"scores": [4, 9, 1]}),
        )
        .await;
        assert_eq!(out, json!(9));
    }

    #[test]
    fn test_invalid_operation() {
        assert!(AggregateStep::new()
            .validate_config(&json!({"operation": "median"}))
            .is_err());
    }
}
