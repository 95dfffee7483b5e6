//! Identity step - pass input through unchanged.

use async_trait::async_trait;
use serde_json::Value;

use super::types::{StepContext, StepExecutor, StepOutcome};
use crate::error::Result;

/// Identity step implementation.
pub struct IdentityStep;

impl IdentityStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IdentityStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for IdentityStep {
    fn type_id(&self) -> &str {
        "identity"
    }

    fn description(&self) -> &str {
        "Pass input through unchanged"
    }

    async fn execute(&self, _config: &Value, input: &Value, _ctx: &StepContext) -> Result<StepOutcome> {
        Ok(StepOutcome::ok(input.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_identity_passthrough() {
        let step = IdentityStep::new();
        let ctx = StepContext::new("exec", "wf");
        let input = json!({"value": 1});

        let outcome = step.execute(&Value::Null, &input, &ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::ok(input));
    }
}
