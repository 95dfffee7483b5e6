//! Step executor trait and context types.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;

/// Structural role of a step type, consulted by the plan compiler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// One input, one output.
    #[default]
    Regular,
    /// Tags its output with a route; only matching connections fire.
    Condition,
    /// Turns a list into one downstream token per element.
    FanOut,
    /// Folds many inputs into one value.
    Reduce,
}

/// Successful step output.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Output data from the step
    pub data: Value,
    /// Metadata (timing, debug info, etc.)
    pub metadata: Value,
    /// Explicit production count; overrides shape-based counting
    pub item_count: Option<u64>,
    /// Output port selected by a condition step
    pub route: Option<String>,
}

impl StepOutput {
    /// Create a new output with just data.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            metadata: json!({}),
            item_count: None,
            route: None,
        }
    }

    /// Create an output with data and metadata.
    pub fn with_metadata(data: Value, metadata: Value) -> Self {
        Self {
            metadata,
            ..Self::new(data)
        }
    }

    /// Tag the output with the port downstream connections must match.
    pub fn routed(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_item_count(mut self, count: u64) -> Self {
        self.item_count = Some(count);
        self
    }
}

impl From<Value> for StepOutput {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

/// Why a step did not produce output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    /// The executor reported a failure.
    ExecutorFailed,
    /// A `{{ }}` placeholder in the config could not be resolved.
    ExpressionError,
    /// The executor panicked.
    Exception,
    /// The attempt exceeded its time bound.
    Timeout,
}

impl std::fmt::Display for StepFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExecutorFailed => "executor_failed",
            Self::ExpressionError => "expression_error",
            Self::Exception => "exception",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: StepFailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: StepFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "kind": self.kind, "message": self.message })
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Three-way result of running a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Ok(StepOutput),
    Err(StepFailure),
    Skip(String),
}

impl StepOutcome {
    pub fn ok(data: Value) -> Self {
        Self::Ok(StepOutput::new(data))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Err(StepFailure::new(StepFailureKind::ExecutorFailed, message))
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl From<Value> for StepOutcome {
    fn from(data: Value) -> Self {
        Self::ok(data)
    }
}

impl From<StepOutput> for StepOutcome {
    fn from(output: StepOutput) -> Self {
        Self::Ok(output)
    }
}

/// Context passed to a step during execution.
///
/// `node_outputs` is only populated when the step's config uses templates;
/// executors must not rely on it otherwise.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Execution ID
    pub execution_id: Arc<str>,

    /// Workflow name
    pub workflow_name: Arc<str>,

    /// Step being executed
    pub step_id: Arc<str>,

    /// Outputs of already resolved steps (keyed by step ID)
    pub node_outputs: Arc<HashMap<String, Value>>,

    /// Workflow variables
    pub variables: Arc<Value>,

    /// Trigger payload of the execution
    pub trigger: Arc<Value>,

    /// Current item index (map mode or under a fan-out)
    pub item_index: Option<usize>,

    /// Number of sibling items
    pub items_total: Option<usize>,

    /// Attempt number, starting at 1
    pub attempt: u32,
}

impl StepContext {
    /// Create a new context.
    pub fn new(execution_id: &str, workflow_name: &str) -> Self {
        Self {
            execution_id: Arc::from(execution_id),
            workflow_name: Arc::from(workflow_name),
            step_id: Arc::from(""),
            node_outputs: Arc::new(HashMap::new()),
            variables: Arc::new(json!({})),
            trigger: Arc::new(Value::Null),
            item_index: None,
            items_total: None,
            attempt: 1,
        }
    }

    pub fn with_step(mut self, step_id: &str) -> Self {
        self.step_id = Arc::from(step_id);
        self
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, Value>) -> Self {
        self.node_outputs = Arc::new(outputs);
        self
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    pub fn with_trigger(mut self, trigger: Value) -> Self {
        self.trigger = Arc::new(trigger);
        self
    }

    /// Get a previous step's output.
    pub fn get_output(&self, step_id: &str) -> Option<&Value> {
        self.node_outputs.get(step_id)
    }

    /// Cheap per-item view sharing the base context.
    pub fn for_item(&self, index: usize, total: usize) -> Self {
        Self {
            item_index: Some(index),
            items_total: Some(total),
            ..self.clone()
        }
    }
}

/// Trait that all step types must implement.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Get the step type name (e.g., "identity", "if", "split").
    fn type_id(&self) -> &str;

    /// Structural role of this step type.
    fn kind(&self) -> StepKind {
        StepKind::Regular
    }

    /// Get a description of this step type.
    fn description(&self) -> &str {
        "A workflow step"
    }

    /// Execute the step.
    ///
    /// # Arguments
    /// * `config` - Step configuration with templates already resolved
    /// * `input` - The data arriving on the step's input
    /// * `ctx` - Execution context
    ///
    /// Returning `Err` is reported as an `executor_failed` step failure.
    async fn execute(&self, config: &Value, input: &Value, ctx: &StepContext)
        -> Result<StepOutcome>;

    /// Check a config before a run starts.
    fn validate_config(&self, _config: &Value) -> std::result::Result<(), Vec<String>> {
        Ok(())
    }
}
