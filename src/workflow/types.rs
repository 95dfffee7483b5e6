//! Workflow type definitions.
//!
//! A workflow is a set of steps plus explicit connections between them.
//! Steps may also declare `depends_on` as a shorthand; the parser turns it
//! into ordinary `main -> main` connections.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output/input port used when a connection does not name one.
pub const DEFAULT_PORT: &str = "main";

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// name: order-pipeline
/// steps:
///   - id: fetch
///     type: identity
///   - id: notify
///     type: identity
/// connections:
///   - from: fetch
///     to: notify
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow name (used as identifier)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Workflow variables, exposed to templates as `variables.*`
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Steps in the workflow
    pub steps: Vec<Step>,

    /// Data-flow connections between steps
    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Global workflow settings
    #[serde(default)]
    pub settings: WorkflowSettings,
}

/// How a step consumes its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run once with the whole input.
    #[default]
    Single,
    /// Run once per item of the input list, with bounded concurrency.
    Map,
}

/// A step in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step ID within this workflow
    pub id: String,

    /// Step type (identity, if, split, aggregate, ...)
    #[serde(rename = "type")]
    pub type_id: String,

    /// Step-specific configuration, possibly containing `{{ ... }}` templates
    #[serde(default)]
    pub config: Value,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    /// Concurrency bound for map mode
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Shorthand for `main -> main` connections from these steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Retry configuration
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Error handling configuration
    #[serde(default)]
    pub on_error: Option<ErrorConfig>,

    /// Timeout for one attempt of this step in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Step {
    /// Create a single-mode step with an empty config.
    pub fn new(id: &str, type_id: &str) -> Self {
        Self {
            id: id.to_string(),
            type_id: type_id.to_string(),
            config: Value::Null,
            execution_mode: ExecutionMode::Single,
            batch_size: None,
            depends_on: Vec::new(),
            retry: None,
            on_error: None,
            timeout_seconds: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_map_mode(mut self, batch_size: Option<usize>) -> Self {
        self.execution_mode = ExecutionMode::Map;
        self.batch_size = batch_size;
        self
    }

    pub fn is_map(&self) -> bool {
        self.execution_mode == ExecutionMode::Map
    }
}

/// A data-flow edge between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub id: String,

    #[serde(alias = "from")]
    pub source_step_id: String,

    #[serde(default = "default_port")]
    pub source_output: String,

    #[serde(alias = "to")]
    pub target_step_id: String,

    #[serde(default = "default_port")]
    pub target_input: String,
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

impl Connection {
    /// Connect `source` to `target` on the default ports.
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            id: format!("{}->{}", source, target),
            source_step_id: source.to_string(),
            source_output: default_port(),
            target_step_id: target.to_string(),
            target_input: default_port(),
        }
    }

    /// Connect a specific output port of `source` (e.g. a branch name).
    pub fn from_port(source: &str, port: &str, target: &str) -> Self {
        Self {
            id: format!("{}:{}->{}", source, port, target),
            source_output: port.to_string(),
            ..Self::new(source, target)
        }
    }
}

/// Retry configuration for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Backoff strategy
    #[serde(default)]
    pub backoff: BackoffType,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Linearly increasing delay
    Linear,
    /// Exponentially increasing delay
    Exponential,
}

/// Error handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorConfig {
    /// Error action for this step: fail | continue | skip | fallback
    #[serde(default)]
    pub action: OnErrorAction,

    /// Output value used when action is `fallback`
    #[serde(default)]
    pub fallback_value: Option<Value>,
}

/// Inline error actions for step failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorAction {
    /// Fail execution immediately
    #[default]
    Fail,
    /// Continue execution with null output
    Continue,
    /// Treat the step as skipped; downstream steps are skipped too
    Skip,
    /// Use `fallback_value` as step output and continue
    Fallback,
}

/// Global workflow settings.
///
/// Unset values fall back to the engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Maximum execution time in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Maximum number of DAG steps running at once
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Timeout for a single map item in seconds
    #[serde(default)]
    pub item_timeout_seconds: Option<u64>,

    /// Maximum number of items a map-mode step accepts
    #[serde(default)]
    pub max_map_items: Option<usize>,

    /// Save a checkpoint after every resolved step
    #[serde(default)]
    pub checkpoints: Option<bool>,
}

impl Workflow {
    /// Get a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Step IDs in declaration order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Get all step types used in this workflow.
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.steps.iter().map(|s| s.type_id.as_str()).collect();
        types.sort();
        types.dedup();
        types
    }

    /// Turn every `depends_on` entry into an explicit connection.
    ///
    /// Connections without an id get a derived one. Idempotent.
    pub fn normalize(&mut self) {
        for step in &mut self.steps {
            for parent in std::mem::take(&mut step.depends_on) {
                let exists = self.connections.iter().any(|c| {
                    c.source_step_id == parent
                        && c.target_step_id == step.id
                        && c.source_output == DEFAULT_PORT
                });
                if !exists {
                    self.connections.push(Connection::new(&parent, &step.id));
                }
            }
        }

        for (idx, conn) in self.connections.iter_mut().enumerate() {
            if conn.id.is_empty() {
                conn.id = format!(
                    "c{}:{}:{}->{}",
                    idx, conn.source_step_id, conn.source_output, conn.target_step_id
                );
            }
        }
    }
}

/// An immutable, published snapshot of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowVersion {
    pub version: u32,
    pub workflow: Arc<Workflow>,
    pub published_at: DateTime<Utc>,
}

impl WorkflowVersion {
    /// Wrap an already validated workflow as a version.
    pub fn new(version: u32, workflow: Workflow) -> Self {
        Self {
            version,
            workflow: Arc::new(workflow),
            published_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.workflow.name
    }
}
