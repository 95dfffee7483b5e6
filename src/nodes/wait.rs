//! Wait step - pause for a duration, then pass input through.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::types::{StepContext, StepExecutor, StepOutcome, StepOutput};
use crate::error::{Error, Result};

/// Cap to prevent accidental long waits.
const MAX_WAIT_MS: u64 = 60 * 60 * 1000;

/// Wait step that pauses execution.
pub struct WaitStep;

impl WaitStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WaitStep {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
struct WaitConfig {
    /// Duration to wait in seconds (can be fractional, e.g., 0.5 for 500ms)
    #[serde(default)]
    seconds: Option<f64>,

    /// Duration to wait in milliseconds
    #[serde(default)]
    milliseconds: Option<u64>,

    /// Duration to wait in minutes
    #[serde(default)]
    minutes: Option<f64>,

    /// Wait until a specific RFC 3339 timestamp (e.g., "2024-01-15T10:30:00Z")
    #[serde(default)]
    until: Option<String>,
}

fn parse_config(config: &Value) -> Result<WaitConfig> {
    if config.is_null() {
        return Ok(WaitConfig::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| Error::Step(format!("Invalid wait config: {}", e)))
}

#[async_trait]
impl StepExecutor for WaitStep {
    fn type_id(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Pause for a duration or until a timestamp, then pass input through"
    }

    async fn execute(&self, config: &Value, input: &Value, ctx: &StepContext) -> Result<StepOutcome> {
        let config = parse_config(config)?;
        let wait_ms = calculate_wait_duration(&config)?;

        if wait_ms > 0 {
            info!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step_id,
                "Wait step pausing for {}ms",
                wait_ms
            );
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
        }

        Ok(StepOutput::with_metadata(input.clone(), json!({ "waited_ms": wait_ms })).into())
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        parse_config(config)
            .and_then(|c| calculate_wait_duration(&c))
            .map(|_| ())
            .map_err(|e| vec![e.to_string()])
    }
}

/// Calculate the wait duration in milliseconds from config.
fn calculate_wait_duration(config: &WaitConfig) -> Result<u64> {
    if let Some(until) = &config.until {
        let target = chrono::DateTime::parse_from_rfc3339(until)
            .map_err(|e| Error::Step(format!("Invalid 'until' timestamp '{}': {}", until, e)))?
            .with_timezone(&chrono::Utc);

        let now = chrono::Utc::now();
        if target <= now {
            return Ok(0);
        }
        let ms = (target - now).num_milliseconds().max(0) as u64;
        return Ok(ms.min(MAX_WAIT_MS));
    }

    let mut total_ms: u64 = 0;

    if let Some(minutes) = config.minutes {
        if minutes < 0.0 {
            return Err(Error::Step("Wait duration cannot be negative".to_string()));
        }
        total_ms += (minutes * 60.0 * 1000.0) as u64;
    }

    if let Some(seconds) = config.seconds {
        if seconds < 0.0 {
            return Err(Error::Step("Wait duration cannot be negative".to_string()));
        }
        total_ms += (seconds * 1000.0) as u64;
    }

    if let Some(ms) = config.milliseconds {
        total_ms += ms;
    }

    if total_ms > MAX_WAIT_MS {
        return Err(Error::Step(format!(
            "Wait duration {}ms exceeds maximum of {}ms (1 hour)",
            total_ms, MAX_WAIT_MS
        )));
    }

    Ok(total_ms)
}
