//! Split step - fan a list out into one token per element.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::template::resolve_field;
use super::types::{StepContext, StepExecutor, StepKind, StepOutcome, StepOutput};
use crate::error::{Error, Result};

/// Split step implementation.
pub struct SplitStep;

impl SplitStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SplitStep {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SplitConfig {
    /// List to split; defaults to the whole input
    #[serde(default)]
    field: Option<Value>,
    /// Emit chunks of this size instead of single elements
    #[serde(default)]
    batch_size: Option<usize>,
}

fn parse_config(config: &Value) -> Result<SplitConfig> {
    if config.is_null() {
        return Ok(SplitConfig::default());
    }
    let config: SplitConfig = serde_json::from_value(config.clone())
        .map_err(|e| Error::Step(format!("Invalid split config: {}", e)))?;
    if config.batch_size == Some(0) {
        return Err(Error::Step("split batch_size must be >= 1".to_string()));
    }
    Ok(config)
}

#[async_trait]
impl StepExecutor for SplitStep {
    fn type_id(&self) -> &str {
        "split"
    }

    fn kind(&self) -> StepKind {
        StepKind::FanOut
    }

    fn description(&self) -> &str {
        "Fan a list out into one downstream token per element (or chunk)"
    }

    async fn execute(&self, config: &Value, input: &Value, _ctx: &StepContext) -> Result<StepOutcome> {
        let config = parse_config(config)?;

        let items = match &config.field {
            Some(field) => resolve_field(field, input),
            None => input.clone(),
        };
        let items = match items {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let output = match config.batch_size {
            Some(size) => items
                .chunks(size)
                .map(|chunk| Value::Array(chunk.to_vec()))
                .collect(),
            None => items,
        };

        let count = output.len();
        Ok(StepOutput::with_metadata(
            Value::Array(output),
            json!({
                "batch_size": config.batch_size,
                "items": count,
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

    async fn split(config: Value, input: Value) -> Value {
        let ctx = StepContext::new("exec", "wf");
        match SplitStep::new().execute(&config, &input, &ctx).await.unwrap() {
            StepOutcome::Ok(out) => out.data,
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_split_batches() {
        let out = split(
            json!({"field": "input.items", "batch_size": 2}),
            json!({"items": [1, 2, 3, 4, 5]}),
        )
        .await;
        assert_eq!(out, json!([[1, 2], [3, 4], [5]]));
    }

    #[tokio::test]
    async fn test_split_whole_input() {
        assert_eq!(split(Value::Null, json!(["a", "b"])).await, json!(["a", "b"]));
        assert_eq!(split(Value::Null, json!("solo")).await, json!(["solo"]));
        assert_eq!(split(Value::Null, Value::Null).await, json!([]));
    }

    #[tokio::test]
    async fn test_split_resolved_template_value() {
        // `{{ }}` fields arrive already resolved to the list itself.
        let out = split(json!({"field": [1, 2]}), json!({})).await;
        assert_eq!(out, json!([1, 2]));
    }
}
