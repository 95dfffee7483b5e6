//! Step runtime: resolve a step's config, call its executor, normalize the
//! result.
//!
//! Nothing that happens inside a step escapes as a Rust error or a panic.
//! Template failures, executor errors, panics and timeouts all come back as
//! a [`StepOutcome::Err`] carrying a [`StepFailure`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::scratch::{ScratchKind, ScratchScope};
use crate::metrics;
use crate::nodes::template::{contains_template, ExpressionEvaluator, TemplateEvaluator};
use crate::nodes::{
    StepContext, StepExecutor, StepFailure, StepFailureKind, StepOutcome, StepRegistry,
};
use crate::workflow::Step;

/// Default bound on evaluating one step's templates.
pub const DEFAULT_EXPRESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of the outputs accumulated so far in an execution.
pub trait ContextProvider: Send + Sync {
    fn outputs(&self) -> HashMap<String, Value>;
}

impl ContextProvider for ScratchScope {
    fn outputs(&self) -> HashMap<String, Value> {
        self.all(ScratchKind::Output)
    }
}

impl ContextProvider for HashMap<String, Value> {
    fn outputs(&self) -> HashMap<String, Value> {
        self.clone()
    }
}

/// A step ready to run once or many times (map mode).
///
/// The template context, when the config needs one, is built here once and
/// shared by every run.
#[derive(Clone)]
pub struct PreparedStep {
    pub step: Arc<Step>,
    executor: Arc<dyn StepExecutor>,
    base_context: Option<Arc<Value>>,
    pub ctx: StepContext,
}

impl PreparedStep {
    pub fn needs_templates(&self) -> bool {
        self.base_context.is_some()
    }
}

impl std::fmt::Debug for PreparedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStep")
            .field("step_id", &self.step.id)
            .field("type", &self.step.type_id)
            .field("templated", &self.base_context.is_some())
            .finish()
    }
}

/// Executes single steps.
pub struct StepRuntime {
    registry: Arc<StepRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    expression_timeout: Duration,
}

impl StepRuntime {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            evaluator: Arc::new(TemplateEvaluator),
            expression_timeout: DEFAULT_EXPRESSION_TIMEOUT,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_expression_timeout(mut self, limit: Duration) -> Self {
        self.expression_timeout = limit;
        self
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Look up the executor and, only if the config is templated,
    /// materialize the context.
    pub fn prepare(
        &self,
        step: Arc<Step>,
        ctx: StepContext,
        provider: &dyn ContextProvider,
    ) -> Result<PreparedStep, StepFailure> {
        let executor = self.registry.get(&step.type_id).ok_or_else(|| {
            StepFailure::new(
                StepFailureKind::ExecutorFailed,
                format!("No executor registered for type '{}'", step.type_id),
            )
        })?;

        if !contains_template(&step.config) {
            return Ok(PreparedStep {
                step,
                executor,
                base_context: None,
                ctx,
            });
        }

        let outputs = provider.outputs();
        let nodes: Map<String, Value> = outputs
            .iter()
            .map(|(id, output)| (id.clone(), json!({ "output": output })))
            .collect();
        let base = json!({
            "nodes": nodes,
            "variables": ctx.variables.as_ref(),
            "trigger": ctx.trigger.as_ref(),
            "execution": {
                "id": ctx.execution_id.as_ref(),
                "workflow": ctx.workflow_name.as_ref(),
                "step": step.id,
            },
        });

        Ok(PreparedStep {
            step,
            executor,
            base_context: Some(Arc::new(base)),
            ctx: ctx.with_outputs(outputs),
        })
    }

    /// Prepare and run in one go.
    pub async fn execute(
        &self,
        step: Arc<Step>,
        input: &Value,
        ctx: StepContext,
        provider: &dyn ContextProvider,
        limit: Option<Duration>,
    ) -> StepOutcome {
        match self.prepare(step, ctx, provider) {
            Ok(prepared) => {
                let ctx = prepared.ctx.clone();
                self.run(&prepared, input, &ctx, limit).await
            }
            Err(failure) => StepOutcome::Err(failure),
        }
    }

    /// Run a prepared step on one input.
    #[instrument(
        name = "step.execute",
        skip_all,
        fields(
            execution_id = %ctx.execution_id,
            step_id = %prepared.step.id,
            step_type = %prepared.step.type_id,
            item_index = ?ctx.item_index,
            attempt = ctx.attempt,
        )
    )]
    pub async fn run(
        &self,
        prepared: &PreparedStep,
        input: &Value,
        ctx: &StepContext,
        limit: Option<Duration>,
    ) -> StepOutcome {
        let start = Instant::now();
        let type_id = prepared.step.type_id.as_str();

        let config = match self.resolve_config(prepared, input, ctx).await {
            Ok(config) => config,
            Err(failure) => {
                metrics::record_step_execution(type_id, "failed");
                return StepOutcome::Err(failure);
            }
        };

        let call = AssertUnwindSafe(prepared.executor.execute(&config, input, ctx)).catch_unwind();
        let joined = match limit {
            Some(limit) => match timeout(limit, call).await {
                Ok(joined) => joined,
                Err(_) => {
                    metrics::record_step_execution(type_id, "timeout");
                    metrics::record_step_duration(start.elapsed(), type_id);
                    return StepOutcome::Err(StepFailure::new(
                        StepFailureKind::Timeout,
                        format!("Step '{}' timed out after {:?}", prepared.step.id, limit),
                    ));
                }
            },
            None => call.await,
        };

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => StepOutcome::Err(StepFailure::new(
                StepFailureKind::ExecutorFailed,
                e.to_string(),
            )),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(step_id = %prepared.step.id, "Step executor panicked: {}", message);
                StepOutcome::Err(StepFailure::new(StepFailureKind::Exception, message))
            }
        };

        let status = match &outcome {
            StepOutcome::Ok(_) => "completed",
            StepOutcome::Err(_) => "failed",
            StepOutcome::Skip(_) => "skipped",
        };
        metrics::record_step_execution(type_id, status);
        metrics::record_step_duration(start.elapsed(), type_id);
        debug!(status, elapsed_ms = start.elapsed().as_millis() as u64, "Step finished");

        outcome
    }

    async fn resolve_config(
        &self,
        prepared: &PreparedStep,
        input: &Value,
        ctx: &StepContext,
    ) -> Result<Value, StepFailure> {
        let Some(base) = &prepared.base_context else {
            return Ok(prepared.step.config.clone());
        };

        let mut context = base.as_ref().clone();
        if let Value::Object(map) = &mut context {
            map.insert("input".to_string(), input.clone());
            map.insert("item".to_string(), input.clone());
            if let Some(Value::Object(execution)) = map.get_mut("execution") {
                execution.insert("item_index".to_string(), json!(ctx.item_index));
                execution.insert("items_total".to_string(), json!(ctx.items_total));
                execution.insert("attempt".to_string(), json!(ctx.attempt));
            }
        }

        let evaluator = self.evaluator.clone();
        let config = prepared.step.config.clone();
        let task = tokio::task::spawn_blocking(move || evaluator.evaluate_deep(&config, &context));

        match timeout(self.expression_timeout, task).await {
            Ok(Ok(Ok(resolved))) => Ok(resolved),
            Ok(Ok(Err(reason))) => Err(StepFailure::new(StepFailureKind::ExpressionError, reason)),
            Ok(Err(join_error)) => Err(StepFailure::new(
                StepFailureKind::Exception,
                format!("Template evaluation aborted: {}", join_error),
            )),
            Err(_) => Err(StepFailure::new(
                StepFailureKind::ExpressionError,
                format!(
                    "Template evaluation exceeded {:?}",
                    self.expression_timeout
                ),
            )),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "step executor panicked".to_string()
    }
}
