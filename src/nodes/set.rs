//! Set step - add or update fields in object data.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::types::{StepContext, StepExecutor, StepOutcome, StepOutput};
use crate::error::{Error, Result};

/// Set step implementation.
pub struct SetStep;

impl SetStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SetStep {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SetConfig {
    fields: Vec<SetField>,
    /// Start from an empty object instead of the input
    #[serde(default)]
    replace: bool,
}

#[derive(Debug, Deserialize)]
struct SetField {
    name: String,
    value: Value,
}

fn parse_config(config: &Value) -> Result<SetConfig> {
    serde_json::from_value(config.clone())
        .map_err(|e| Error::Step(format!("Invalid set config: {}", e)))
}

#[async_trait]
impl StepExecutor for SetStep {
    fn type_id(&self) -> &str {
        "set"
    }

    fn description(&self) -> &str {
        "Set or update fields in object data"
    }

    async fn execute(&self, config: &Value, input: &Value, _ctx: &StepContext) -> Result<StepOutcome> {
        let config = parse_config(config)?;

        let mut output = match input {
            Value::Object(obj) if !config.replace => obj.clone(),
            _ => Map::new(),
        };

        for assignment in &config.fields {
            if assignment.name.trim().is_empty() {
                return Err(Error::Step("Set step field name cannot be empty".to_string()));
            }
            set_path_value(&mut output, &assignment.name, assignment.value.clone());
        }

        Ok(StepOutput::with_metadata(
            Value::Object(output),
            json!({ "fields_set": config.fields.len() }),
        )
        .into())
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        let config = parse_config(config).map_err(|e| vec![e.to_string()])?;
        if config.fields.is_empty() {
            return Err(vec!["set requires at least one field assignment".to_string()]);
        }
        Ok(())
    }
}

fn set_path_value(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = root;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }

        match entry.as_object_mut() {
            Some(map) => current = map,
            None => return,
        }
    }

    current.insert((*last).to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_add_fields() {
        let step = SetStep::new();
        let config = json!({
            "fields": [
                {"name": "status", "value": "processed"},
                {"name": "meta.source", "value": "weft"}
            ]
        });
        let input = json!({"order_id": "A-1"});
        let ctx = StepContext::new("exec", "wf");

        let StepOutcome::Ok(out) = step.execute(&config, &input, &ctx).await.unwrap() else {
            panic!("expected ok");
        };
        assert_eq!(out.data["order_id"], "A-1");
        assert_eq!(out.data["status"], "processed");
        assert_eq!(out.data["meta"]["source"], "weft");
    }

    #[tokio::test]
    async fn test_set_replace() {
        let step = SetStep::new();
        let config = json!({"replace": true, "fields": [{"name": "x", "value": 1}]});
        let ctx = StepContext::new("exec", "wf");

        let outcome = step.execute(&config, &json!({"y": 2}), &ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::Ok(StepOutput::with_metadata(json!({"x": 1}), json!({"fields_set": 1}))));
    }

    #[test]
    fn test_validate_config() {
        assert!(SetStep::new().validate_config(&json!({"fields": []})).is_err());
        assert!(SetStep::new().validate_config(&json!({"nope": 1})).is_err());
    }
}
