//! Workflow executor.
//!
//! Each execution is driven by one coordinator task that owns the scheduler
//! and every piece of run-level state. Step activations run as worker tasks
//! that write their own StepExecution rows through the merge engine and hand
//! a [`Resolution`] back. Cancellation requests and the timeout watchdog
//! reach the coordinator through its mailbox, never by touching its state.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::map_executor::{run_map, MapResult, MapSettings};
use super::partial::{build_downstream, plan_subset, PartialRun};
use super::plan::Plan;
use super::production;
use super::runtime::{ContextProvider, StepRuntime};
use super::scheduler::{Activation, Completion, Scheduler, Work};
use super::scratch::{ScratchKind, ScratchScope, ScratchStore};
use super::state_merge::StepEvent;
use super::token::{FanOutPosition, FanOutStack};
use crate::config::EngineConfig;
use crate::error::{Error, ErrorBody, Result};
use crate::metrics;
use crate::monitor::Monitor;
use crate::nodes::{
    ExpressionEvaluator, StepContext, StepFailure, StepFailureKind, StepOutcome, StepOutput,
    StepRegistry,
};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{
    Checkpoint, Execution, ExecutionStatus, StepKey, StepStatus, Storage, Trigger,
};
use crate::workflow::{BackoffType, OnErrorAction, RetryConfig, Step, Workflow, WorkflowVersion};

/// Messages accepted by a running execution's coordinator.
enum Command {
    Cancel {
        reason: String,
        reply: oneshot::Sender<Result<Execution>>,
    },
    Timeout,
}

/// Mailboxes of the executions running in this process.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, mpsc::Sender<Command>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, execution_id: &str, mailbox: mpsc::Sender<Command>) {
        self.runs
            .lock()
            .await
            .insert(execution_id.to_string(), mailbox);
    }

    async fn mailbox(&self, execution_id: &str) -> Option<mpsc::Sender<Command>> {
        self.runs.lock().await.get(execution_id).cloned()
    }

    async fn unregister(&self, execution_id: &str) {
        self.runs.lock().await.remove(execution_id);
    }

    pub async fn is_running(&self, execution_id: &str) -> bool {
        self.runs.lock().await.contains_key(execution_id)
    }

}

fn partial_metadata(partial: Value) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("partial".to_string(), partial);
    metadata
}

fn sorted_ids(ids: &HashSet<String>) -> Vec<&String> {
    let mut list: Vec<&String> = ids.iter().collect();
    list.sort();
    list
}

/// A started execution.
pub struct ExecutionHandle {
    pub execution_id: String,
    task: JoinHandle<Result<Execution>>,
}

impl ExecutionHandle {
    /// Wait for the execution to reach a terminal state.
    pub async fn wait(self) -> Result<Execution> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("execution task failed: {}", e)))?
    }
}

/// Workflow executor.
///
/// Cheap to clone; clones share the run registry and scratch store.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<StepRegistry>,
    storage: Arc<dyn Storage>,
    monitor: Option<Monitor>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    shutdown: Option<ShutdownCoordinator>,
    config: EngineConfig,
    runs: RunRegistry,
    scratch: ScratchStore,
}

/// Everything a run needs before it starts.
struct RunRequest {
    workflow: Arc<Workflow>,
    version: u32,
    trigger: Trigger,
    metadata: Map<String, Value>,
    plan: Result<Plan>,
    pinned: HashMap<String, Value>,
    resumed_from: Option<String>,
}

impl Executor {
    /// Create a new executor.
    pub fn new(registry: StepRegistry, storage: Arc<dyn Storage>) -> Self {
        Self {
            registry: Arc::new(registry),
            storage,
            monitor: None,
            evaluator: None,
            shutdown: None,
            config: EngineConfig::default(),
            runs: RunRegistry::new(),
            scratch: ScratchStore::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Broadcast lifecycle events to `monitor`.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Cancel running executions when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Replace the `{{ }}` evaluator used for step configs.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn without_checkpoints(mut self) -> Self {
        self.config.checkpoints = false;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    fn runtime(&self) -> Arc<StepRuntime> {
        let mut runtime = StepRuntime::new(self.registry.clone())
            .with_expression_timeout(self.config.expression_timeout());
        if let Some(evaluator) = &self.evaluator {
            runtime = runtime.with_evaluator(evaluator.clone());
        }
        Arc::new(runtime)
    }

    /// Run a published workflow to completion.
    pub async fn execute(&self, version: &WorkflowVersion, trigger: Trigger) -> Result<Execution> {
        self.start(version, trigger).await?.wait().await
    }

    /// Start a run in the background; the handle resolves when it ends.
    pub async fn start(&self, version: &WorkflowVersion, trigger: Trigger) -> Result<ExecutionHandle> {
        let plan = Plan::compile(&version.workflow, &self.registry);
        self.launch(RunRequest {
            workflow: version.workflow.clone(),
            version: version.version,
            trigger,
            metadata: Map::new(),
            plan,
            pinned: HashMap::new(),
            resumed_from: None,
        })
        .await
    }

    /// Run only what `partial.targets` need, treating pinned steps as done.
    pub async fn execute_partial(
        &self,
        version: &WorkflowVersion,
        trigger: Trigger,
        partial: PartialRun,
    ) -> Result<Execution> {
        self.start_partial(version, trigger, partial, None)
            .await?
            .wait()
            .await
    }

    /// Re-run everything downstream of `from_id`, feeding it the pinned
    /// output of `from_id`. Fails with `NodeNotPinned` when that output is
    /// missing from `pinned`.
    pub async fn execute_from(
        &self,
        version: &WorkflowVersion,
        trigger: Trigger,
        from_id: &str,
        pinned: HashMap<String, Value>,
    ) -> Result<Execution> {
        let pinned_ids: HashSet<String> = pinned.keys().cloned().collect();
        let workflow = &version.workflow;
        let downstream =
            build_downstream(from_id, &workflow.steps, &workflow.connections, &pinned_ids)?;

        // Only what lies downstream runs; nothing upstream of `from_id` is
        // re-executed, whatever else is pinned.
        let targets: Vec<String> = downstream
            .into_iter()
            .filter(|id| id != from_id && !pinned_ids.contains(id))
            .collect();
        let execution_set: HashSet<String> = targets.iter().cloned().collect();
        let metadata = partial_metadata(json!({
            "from": from_id,
            "targets": targets,
            "pinned": sorted_ids(&pinned_ids),
        }));

        self.launch_partial(version, trigger, &execution_set, pinned, metadata, None)
            .await?
            .wait()
            .await
    }

    /// Start a new execution that picks up where a failed, timed-out or
    /// cancelled one stopped.
    ///
    /// Outputs come from the latest checkpoint, or from the completed step
    /// rows when no checkpoint exists. `version` must be the workflow the
    /// original ran.
    pub async fn resume(&self, execution_id: &str, version: &WorkflowVersion) -> Result<Execution> {
        let original = self
            .storage
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::Execution(format!("Execution '{}' not found", execution_id)))?;

        if !matches!(
            original.status,
            ExecutionStatus::Failed | ExecutionStatus::Timeout | ExecutionStatus::Cancelled
        ) {
            return Err(Error::Execution(format!(
                "Cannot resume execution '{}' with status '{}'",
                execution_id, original.status
            )));
        }
        if original.workflow_name != version.name() {
            return Err(Error::Execution(format!(
                "Execution '{}' ran workflow '{}', not '{}'",
                execution_id,
                original.workflow_name,
                version.name()
            )));
        }

        let pinned: HashMap<String, Value> = self
            .recovered_outputs(&original)
            .await?
            .into_iter()
            .filter(|(id, _)| version.workflow.get_step(id).is_some())
            .collect();
        info!(
            execution_id,
            recovered = pinned.len(),
            "Resuming execution"
        );

        let partial = PartialRun {
            targets: version.workflow.steps.iter().map(|s| s.id.clone()).collect(),
            pinned,
        };
        self.start_partial(version, original.trigger.clone(), partial, Some(original.id))
            .await?
            .wait()
            .await
    }

    /// Cancel a running execution and return its final record.
    pub async fn cancel(&self, execution_id: &str) -> Result<Execution> {
        if let Some(mailbox) = self.runs.mailbox(execution_id).await {
            let (reply, response) = oneshot::channel();
            let command = Command::Cancel {
                reason: "cancelled by request".to_string(),
                reply,
            };
            if mailbox.send(command).await.is_ok() {
                if let Ok(result) = response.await {
                    return result;
                }
            }
        }

        match self.storage.get_execution(execution_id).await? {
            Some(execution) if execution.status.is_terminal() => {
                Err(Error::AlreadyTerminal(execution_id.to_string()))
            }
            Some(_) => Err(Error::Execution(format!(
                "Execution '{}' is not running in this process",
                execution_id
            ))),
            None => Err(Error::Execution(format!(
                "Execution '{}' not found",
                execution_id
            ))),
        }
    }

    async fn start_partial(
        &self,
        version: &WorkflowVersion,
        trigger: Trigger,
        partial: PartialRun,
        resumed_from: Option<String>,
    ) -> Result<ExecutionHandle> {
        let workflow = &version.workflow;
        let pinned_ids = partial.pinned_ids();
        let subset = plan_subset(
            &partial.targets,
            &workflow.steps,
            &workflow.connections,
            &pinned_ids,
        )?;
        let execution_set: HashSet<String> = subset.into_iter().collect();
        let metadata = partial_metadata(json!({
            "targets": partial.targets,
            "pinned": sorted_ids(&pinned_ids),
        }));

        self.launch_partial(
            version,
            trigger,
            &execution_set,
            partial.pinned,
            metadata,
            resumed_from,
        )
        .await
    }

    async fn launch_partial(
        &self,
        version: &WorkflowVersion,
        trigger: Trigger,
        execution_set: &HashSet<String>,
        pinned: HashMap<String, Value>,
        metadata: Map<String, Value>,
        resumed_from: Option<String>,
    ) -> Result<ExecutionHandle> {
        let workflow = &version.workflow;
        let pinned_ids: HashSet<String> = pinned.keys().cloned().collect();
        let plan = Plan::compile_partial(workflow, &self.registry, execution_set, &pinned_ids);

        self.launch(RunRequest {
            workflow: workflow.clone(),
            version: version.version,
            trigger,
            metadata,
            plan,
            pinned,
            resumed_from,
        })
        .await
    }

    async fn recovered_outputs(&self, original: &Execution) -> Result<HashMap<String, Value>> {
        if let Some(checkpoint) = self.storage.latest_checkpoint(&original.id).await? {
            debug!(checkpoint_id = %checkpoint.id, "Resuming from checkpoint");
            return Ok(checkpoint.step_outputs.into_iter().collect());
        }

        // Without a checkpoint, take the final attempt of every step that
        // left an output behind (recovered failures included).
        let mut latest: HashMap<String, (u32, Value)> = HashMap::new();
        for row in self.storage.list_step_executions(&original.id).await? {
            if row.item_index.is_some()
                || !matches!(row.status, StepStatus::Completed | StepStatus::Failed)
            {
                continue;
            }
            let Some(output) = row.output_data else {
                continue;
            };
            match latest.get(&row.step_id) {
                Some((attempt, _)) if *attempt >= row.attempt => {}
                _ => {
                    latest.insert(row.step_id, (row.attempt, output));
                }
            }
        }
        Ok(latest.into_iter().map(|(id, (_, v))| (id, v)).collect())
    }

    async fn launch(&self, request: RunRequest) -> Result<ExecutionHandle> {
        let execution_id = Uuid::new_v4().to_string();
        let mut execution = Execution::pending(
            execution_id.clone(),
            &request.workflow.name,
            request.version,
            request.trigger.clone(),
            request.metadata.clone(),
        );
        execution.resumed_from = request.resumed_from.clone();
        self.storage.save_execution(&execution).await?;

        let (mailbox, commands) = mpsc::channel(16);
        self.runs.register(&execution_id, mailbox.clone()).await;

        let this = self.clone();
        let id = execution_id.clone();
        let task = tokio::spawn(async move {
            let result = this.drive(execution, request, mailbox, commands).await;
            this.runs.unregister(&id).await;
            this.scratch.clear(&id);
            result
        });

        Ok(ExecutionHandle { execution_id, task })
    }

    #[instrument(
        name = "workflow.execute",
        skip_all,
        fields(
            execution_id = %execution.id,
            workflow = %execution.workflow_name,
            version = execution.workflow_version,
        )
    )]
    async fn drive(
        &self,
        mut execution: Execution,
        request: RunRequest,
        mailbox: mpsc::Sender<Command>,
        mut commands: mpsc::Receiver<Command>,
    ) -> Result<Execution> {
        let started = Instant::now();
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.storage.save_execution(&execution).await?;
        if let Some(monitor) = &self.monitor {
            monitor.execution_started(&execution);
        }
        metrics::inc_active_executions();
        info!("Execution started");

        let workflow = request.workflow.clone();
        let settings = &workflow.settings;
        let budget_seconds = settings.timeout_seconds.unwrap_or(self.config.timeout_seconds);

        let (end, context, output) = match request.plan {
            Err(err) => {
                warn!(error = %err, "Plan compilation failed");
                let context = request.pinned.into_iter().collect();
                (RunEnd::Failed(ErrorBody::from(&err)), context, None)
            }
            Ok(plan) => {
                let watchdog = CancellationToken::new();
                let _watchdog_guard = watchdog.clone().drop_guard();
                spawn_watchdog(mailbox, Duration::from_secs(budget_seconds), watchdog);

                let mut run = Run::new(self, &execution, &workflow, Arc::new(plan), request.pinned);
                let shutdown = self
                    .shutdown
                    .as_ref()
                    .map(ShutdownCoordinator::child_token)
                    .unwrap_or_default();

                let end = match run.run(&mut commands, shutdown).await {
                    Ok(end) => end,
                    Err(err) => {
                        error!(error = %err, "Execution aborted");
                        RunEnd::Failed(ErrorBody::from(&err))
                    }
                };
                if !matches!(end, RunEnd::Completed) {
                    run.workers.shutdown().await;
                }
                let output = matches!(end, RunEnd::Completed).then(|| run.output());
                (end, run.context(), output)
            }
        };

        let (status, error_body, reply) = match end {
            RunEnd::Completed => (ExecutionStatus::Completed, None, None),
            RunEnd::Failed(body) => (ExecutionStatus::Failed, Some(body), None),
            RunEnd::TimedOut => (
                ExecutionStatus::Timeout,
                Some(ErrorBody::timeout(budget_seconds)),
                None,
            ),
            RunEnd::Cancelled { reason, reply } => (
                ExecutionStatus::Cancelled,
                Some(ErrorBody::cancelled(&reason)),
                reply,
            ),
        };

        let now = Utc::now();
        if status != ExecutionStatus::Completed {
            let cancelled = self.storage.cancel_active_steps(&execution.id, now).await?;
            if cancelled > 0 {
                debug!(cancelled, "Marked in-flight steps cancelled");
            }
        }

        execution.status = status;
        execution.error = error_body;
        execution.context = context;
        execution.output = output;
        execution.completed_at = Some(now);
        let saved = self.storage.save_execution(&execution).await;

        let duration = started.elapsed();
        metrics::record_execution(&status.to_string());
        metrics::record_execution_duration(duration, &execution.workflow_name);
        metrics::dec_active_executions();
        if let Some(monitor) = &self.monitor {
            monitor.execution_finished(&execution);
        }
        info!(
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "Execution finished"
        );

        if let Some(reply) = reply {
            let response = match &saved {
                Ok(()) => Ok(execution.clone()),
                Err(err) => Err(Error::Storage(err.to_string())),
            };
            let _ = reply.send(response);
        }
        saved?;
        Ok(execution)
    }
}

fn spawn_watchdog(mailbox: mpsc::Sender<Command>, budget: Duration, token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = sleep(budget) => {
                let _ = mailbox.send(Command::Timeout).await;
            }
        }
    });
}

/// How a run ended.
enum RunEnd {
    Completed,
    Failed(ErrorBody),
    TimedOut,
    Cancelled {
        reason: String,
        reply: Option<oneshot::Sender<Result<Execution>>>,
    },
}

/// How one activation ended, after retries and `on_error`.
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    Produced { value: Value, route: Option<String> },
    Mapped(MapResult),
    Skipped,
    Failed { failure: StepFailure, attempt: u32 },
}

/// Shared, read-only state handed to every worker.
struct WorkerEnv {
    runtime: Arc<StepRuntime>,
    storage: Arc<dyn Storage>,
    monitor: Option<Monitor>,
    scratch: ScratchScope,
    plan: Arc<Plan>,
    execution_id: String,
    workflow_name: String,
    variables: Arc<Value>,
    trigger: Arc<Value>,
    map: MapSettings,
}

/// Coordinator state of one execution.
struct Run {
    env: Arc<WorkerEnv>,
    scheduler: Scheduler,
    queue: VecDeque<Work>,
    workers: JoinSet<Result<(Activation, Resolution)>>,
    max_concurrency: usize,
    pinned: HashMap<String, Value>,
    productions: HashMap<String, Vec<(FanOutStack, Value)>>,
    checkpoints: bool,
}

impl Run {
    fn new(
        executor: &Executor,
        execution: &Execution,
        workflow: &Workflow,
        plan: Arc<Plan>,
        pinned: HashMap<String, Value>,
    ) -> Self {
        let config = &executor.config;
        let settings = &workflow.settings;

        let variables: Map<String, Value> = workflow
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let env = WorkerEnv {
            runtime: executor.runtime(),
            storage: executor.storage.clone(),
            monitor: executor.monitor.clone(),
            scratch: executor.scratch.scope(&execution.id),
            plan: plan.clone(),
            execution_id: execution.id.clone(),
            workflow_name: execution.workflow_name.clone(),
            variables: Arc::new(Value::Object(variables)),
            trigger: Arc::new(execution.trigger.data.clone()),
            map: MapSettings {
                concurrency: config.batch_size,
                item_timeout: settings
                    .item_timeout_seconds
                    .or(config.item_timeout_seconds)
                    .map(Duration::from_secs),
                max_items: settings.max_map_items.unwrap_or(config.max_map_items),
            },
        };

        for (step_id, value) in &pinned {
            env.scratch.put(ScratchKind::Output, step_id, value.clone());
        }

        Self {
            env: Arc::new(env),
            scheduler: Scheduler::new(plan),
            queue: VecDeque::new(),
            workers: JoinSet::new(),
            max_concurrency: settings
                .max_concurrency
                .unwrap_or(config.max_concurrency)
                .max(1),
            pinned,
            productions: HashMap::new(),
            checkpoints: settings.checkpoints.unwrap_or(config.checkpoints),
        }
    }

    async fn run(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    ) -> Result<RunEnd> {
        let initial = self.scheduler.start(&self.env.trigger, &self.pinned);
        self.queue.extend(initial);

        loop {
            self.dispatch().await?;
            if self.workers.is_empty() && self.queue.is_empty() {
                return Ok(self.settled());
            }

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Cancel { reason, reply }) => {
                        info!(%reason, "Cancelling execution");
                        return Ok(RunEnd::Cancelled { reason, reply: Some(reply) });
                    }
                    Some(Command::Timeout) => {
                        warn!("Execution timed out");
                        return Ok(RunEnd::TimedOut);
                    }
                    None => {
                        return Ok(RunEnd::Cancelled {
                            reason: "executor dropped".to_string(),
                            reply: None,
                        });
                    }
                },

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, cancelling execution");
                    return Ok(RunEnd::Cancelled { reason: "shutdown".to_string(), reply: None });
                }

                joined = self.workers.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (activation, resolution) = joined
                        .map_err(|e| Error::Internal(format!("step task failed: {}", e)))??;
                    if let Some(end) = self.resolve(activation, resolution).await? {
                        return Ok(end);
                    }
                }
            }
        }
    }

    /// Drain ready work: spawn runs up to the concurrency bound, record
    /// skips and emitted outputs inline.
    async fn dispatch(&mut self) -> Result<()> {
        while let Some(work) = self.queue.pop_front() {
            match work {
                Work::Run(activation) => {
                    if self.workers.len() >= self.max_concurrency {
                        self.queue.push_front(Work::Run(activation));
                        break;
                    }
                    let env = self.env.clone();
                    let own = self.item_outputs(&activation.fan_out);
                    self.workers.spawn(async move {
                        let resolution = execute_activation(&env, &activation, own).await?;
                        Ok((activation, resolution))
                    });
                }
                Work::Skip {
                    node_id,
                    fan_out,
                    lineage,
                } => {
                    self.record_skip(&node_id, &fan_out).await?;
                    let next =
                        self.scheduler
                            .complete(&node_id, &fan_out, &lineage, Completion::Skipped);
                    self.queue.extend(next);
                }
                Work::Emit {
                    node_id,
                    value,
                    fan_out,
                    lineage,
                } => {
                    self.record_emit(&node_id, &value, &fan_out).await?;
                    self.produced(&node_id, &fan_out, value.clone()).await?;
                    let next = self.scheduler.complete(
                        &node_id,
                        &fan_out,
                        &lineage,
                        Completion::Produced { value, route: None },
                    );
                    self.queue.extend(next);
                }
            }
        }
        Ok(())
    }

    async fn resolve(
        &mut self,
        activation: Activation,
        resolution: Resolution,
    ) -> Result<Option<RunEnd>> {
        let Activation {
            node_id,
            fan_out,
            lineage,
            ..
        } = activation;

        let completion = match resolution {
            Resolution::Produced { value, route } => {
                self.produced(&node_id, &fan_out, value.clone()).await?;
                Completion::Produced { value, route }
            }
            Resolution::Mapped(result) => {
                self.produced(&node_id, &fan_out, result.output_value())
                    .await?;
                Completion::Mapped(result)
            }
            Resolution::Skipped => Completion::Skipped,
            Resolution::Failed { failure, attempt } => {
                error!(step_id = %node_id, attempt, error = %failure, "Step failed");
                let mut details = failure.to_value();
                if let Value::Object(map) = &mut details {
                    map.insert("step_id".to_string(), json!(node_id));
                    map.insert("attempt".to_string(), json!(attempt));
                    map.insert(
                        "item_index".to_string(),
                        json!(fan_out.last().map(|p| p.item_index)),
                    );
                }
                return Ok(Some(RunEnd::Failed(ErrorBody::new("step_failed", details))));
            }
        };

        let next = self
            .scheduler
            .complete(&node_id, &fan_out, &lineage, completion);
        self.queue.extend(next);
        Ok(None)
    }

    /// Nothing is running and nothing is ready. Barriers still holding
    /// inputs at this point can never resolve, so the run did not finish.
    fn settled(&self) -> RunEnd {
        let pending = self.scheduler.pending_barriers();
        if pending == 0 {
            return RunEnd::Completed;
        }
        let waiting = self.scheduler.pending_barrier_nodes();
        warn!(pending, ?waiting, "Run stalled with unresolved barriers");
        RunEnd::Failed(ErrorBody::new(
            "execution_error",
            json!({
                "code": "INCOMPLETE_BARRIER",
                "message": format!("{} barrier(s) never received all inputs", pending),
                "waiting": waiting,
            }),
        ))
    }

    /// Outputs of the producers on the same item path as `fan_out`, which
    /// a step inside a fan-out sees instead of the collected lists.
    fn item_outputs(&self, fan_out: &FanOutStack) -> HashMap<String, Value> {
        if fan_out.is_empty() {
            return HashMap::new();
        }
        self.productions
            .iter()
            .filter_map(|(id, prods)| {
                prods
                    .iter()
                    .find(|(stack, _)| !stack.is_empty() && fan_out.starts_with(stack))
                    .map(|(_, value)| (id.clone(), value.clone()))
            })
            .collect()
    }

    async fn produced(&mut self, node_id: &str, fan_out: &FanOutStack, value: Value) -> Result<()> {
        let prods = self.productions.entry(node_id.to_string()).or_default();
        prods.push((fan_out.clone(), value));
        // Readers outside the fan-out see every item produced so far.
        self.env
            .scratch
            .put(ScratchKind::Output, node_id, collapse(prods));

        // Outputs produced inside an open fan-out are partial until the
        // matching reduce has seen every item.
        if self.checkpoints && fan_out.is_empty() {
            self.save_checkpoint(node_id).await?;
        }
        Ok(())
    }

    async fn save_checkpoint(&self, step_id: &str) -> Result<()> {
        let mut step_outputs: BTreeMap<String, Value> = self
            .pinned
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (id, prods) in &self.productions {
            if prods.iter().all(|(stack, _)| stack.is_empty()) {
                if let Some((_, value)) = prods.last() {
                    step_outputs.insert(id.clone(), value.clone());
                }
            }
        }

        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            execution_id: self.env.execution_id.clone(),
            step_id: step_id.to_string(),
            step_outputs,
            created_at: Utc::now(),
        };
        self.env.storage.save_checkpoint(&checkpoint).await?;
        debug!(step_id, "Checkpoint saved");
        Ok(())
    }

    async fn record_skip(&self, node_id: &str, fan_out: &FanOutStack) -> Result<()> {
        let Some(step) = self.env.plan.node(node_id).and_then(|n| n.step.clone()) else {
            return Ok(());
        };
        let key = StepKey::new(&self.env.execution_id, node_id, 1).with_item(flat_index(fan_out));
        let mut metadata = Map::new();
        metadata.insert("reason".to_string(), json!("no input on any active path"));

        let event = StepEvent::finished(StepStatus::Skipped, Utc::now())
            .with_identity(&Uuid::new_v4().to_string(), &step.type_id, None)
            .with_metadata(metadata);
        write_row(&self.env, &key, &[event]).await
    }

    async fn record_emit(&self, node_id: &str, value: &Value, fan_out: &FanOutStack) -> Result<()> {
        let Some(node) = self.env.plan.node(node_id) else {
            return Ok(());
        };
        let Some(step) = &node.step else {
            return Ok(());
        };
        let key = StepKey::new(&self.env.execution_id, node_id, 1).with_item(flat_index(fan_out));
        let count = production::count(Some(value), Some(node.shape), None, node.in_fan_out());

        let mut metadata = Map::new();
        let source = if node.pinned { "pinned" } else { "accumulated" };
        metadata.insert("source".to_string(), json!(source));

        let event = StepEvent::completed(Utc::now(), value.clone(), count)
            .with_identity(&Uuid::new_v4().to_string(), &step.type_id, None)
            .with_metadata(metadata);
        write_row(&self.env, &key, &[event]).await
    }

    /// `step_id -> output`. Steps that ran once per fanned-out item map to
    /// the list of their outputs in item order.
    fn context(&self) -> BTreeMap<String, Value> {
        let mut context: BTreeMap<String, Value> = self
            .pinned
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (id, prods) in &self.productions {
            context.insert(id.clone(), collapse(prods));
        }
        context
    }

    /// Productions of the sink steps: nothing, a single value, or a list.
    fn output(&self) -> Value {
        let mut values = Vec::new();
        for sink in self.env.plan.sinks() {
            if let Some(prods) = self.productions.get(sink) {
                values.extend(sorted(prods));
            }
        }
        match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::Array(values),
        }
    }
}

fn sorted(prods: &[(FanOutStack, Value)]) -> Vec<Value> {
    let mut ordered: Vec<&(FanOutStack, Value)> = prods.iter().collect();
    ordered.sort_by(|a, b| {
        a.0.iter()
            .map(|p| p.item_index)
            .cmp(b.0.iter().map(|p| p.item_index))
    });
    ordered.into_iter().map(|(_, v)| v.clone()).collect()
}

fn collapse(prods: &[(FanOutStack, Value)]) -> Value {
    if prods.iter().all(|(stack, _)| stack.is_empty()) {
        return prods.last().map(|(_, v)| v.clone()).unwrap_or(Value::Null);
    }
    Value::Array(sorted(prods))
}

/// Row index of an activation under (possibly nested) fan-outs.
fn flat_index(fan_out: &FanOutStack) -> Option<usize> {
    if fan_out.is_empty() {
        return None;
    }
    Some(fan_out.iter().fold(0usize, |acc, p| {
        acc.saturating_mul(p.items_total.max(1))
            .saturating_add(p.item_index)
    }))
}

async fn write_row(env: &WorkerEnv, key: &StepKey, events: &[StepEvent]) -> Result<()> {
    let outcome = env.storage.apply_step_events(key, events).await?;
    if let (Some(monitor), Some(row)) = (&env.monitor, outcome.row()) {
        monitor.step(row);
    }
    Ok(())
}

/// Run one activation through its attempts and `on_error` policy.
#[instrument(
    name = "step.activation",
    skip_all,
    fields(
        execution_id = %env.execution_id,
        step_id = %activation.node_id,
        item_index = ?activation.position().map(|p| p.item_index),
    )
)]
async fn execute_activation(
    env: &WorkerEnv,
    activation: &Activation,
    own: HashMap<String, Value>,
) -> Result<Resolution> {
    let node = env
        .plan
        .node(&activation.node_id)
        .ok_or_else(|| Error::Internal(format!("unknown plan node '{}'", activation.node_id)))?;
    let step = node
        .step
        .clone()
        .ok_or_else(|| Error::Internal(format!("plan node '{}' has no step", node.id)))?;

    let max_attempts = step.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
    let item_index = flat_index(&activation.fan_out);
    let outputs = ItemScope {
        scratch: &env.scratch,
        own,
    };
    let mut retry_of: Option<String> = None;
    let mut attempt = 1;

    loop {
        let key = StepKey::new(&env.execution_id, &step.id, attempt).with_item(item_index);
        let row_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        write_row(
            env,
            &key,
            &[
                StepEvent::queued(now).with_identity(&row_id, &step.type_id, retry_of.clone()),
                StepEvent::started(now, activation.input.clone()),
            ],
        )
        .await?;

        let ctx = env.step_context(&step.id, attempt, activation.position());
        let (outcome, bundle) = env.attempt(&step, activation, ctx, &outputs).await;

        match outcome {
            StepOutcome::Ok(output) => {
                let count = production::count(
                    Some(&output.data),
                    Some(node.shape),
                    output.item_count,
                    node.in_fan_out(),
                );
                let mut event = StepEvent::completed(Utc::now(), output.data.clone(), count);
                if let Value::Object(metadata) = output.metadata {
                    if !metadata.is_empty() {
                        event = event.with_metadata(metadata);
                    }
                }
                write_row(env, &key, &[event]).await?;
                if let Some(position) = activation.position() {
                    let done = env.scratch.incr(ScratchKind::ItemsDone, &step.id);
                    debug!(items_done = done, items_total = position.items_total, "Item finished");
                }
                return Ok(match bundle {
                    Some(result) => Resolution::Mapped(result),
                    None => Resolution::Produced {
                        value: output.data,
                        route: output.route,
                    },
                });
            }
            StepOutcome::Skip(reason) => {
                debug!(%reason, "Step skipped itself");
                let mut metadata = Map::new();
                metadata.insert("reason".to_string(), json!(reason));
                let event =
                    StepEvent::finished(StepStatus::Skipped, Utc::now()).with_metadata(metadata);
                write_row(env, &key, &[event]).await?;
                return Ok(Resolution::Skipped);
            }
            StepOutcome::Err(failure) if attempt < max_attempts => {
                write_row(env, &key, &[StepEvent::failed(Utc::now(), failure.to_value())]).await?;

                let delay = step
                    .retry
                    .as_ref()
                    .map_or(Duration::ZERO, |r| retry_delay(r, attempt));
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Step failed, retrying"
                );
                sleep(delay).await;
                retry_of = Some(row_id);
                attempt += 1;
            }
            StepOutcome::Err(failure) => {
                let recovery = recover(&step, &failure);
                let mut event = StepEvent::failed(Utc::now(), failure.to_value());
                if let Some(resolution) = &recovery {
                    let mut metadata = Map::new();
                    metadata.insert("recovered".to_string(), json!(true));
                    event = event.with_metadata(metadata);
                    if let Resolution::Produced { value, .. } = resolution {
                        event.output_data = Some(value.clone());
                        event.output_item_count = Some(production::count(
                            Some(value),
                            Some(node.shape),
                            None,
                            node.in_fan_out(),
                        ));
                    }
                    warn!(attempt, error = %failure, "Step failed, recovered by on_error");
                }
                write_row(env, &key, &[event]).await?;
                return Ok(recovery.unwrap_or(Resolution::Failed { failure, attempt }));
            }
        }
    }
}

/// What `on_error` turns a final failure into, if anything.
fn recover(step: &Step, failure: &StepFailure) -> Option<Resolution> {
    let config = step.on_error.as_ref()?;
    match config.action {
        OnErrorAction::Fail => None,
        OnErrorAction::Continue => Some(Resolution::Produced {
            value: Value::Null,
            route: None,
        }),
        OnErrorAction::Fallback => {
            if config.fallback_value.is_none() {
                debug!(error = %failure, "Fallback requested without a value, using null");
            }
            Some(Resolution::Produced {
                value: config.fallback_value.clone().unwrap_or(Value::Null),
                route: None,
            })
        }
        OnErrorAction::Skip => Some(Resolution::Skipped),
    }
}

impl WorkerEnv {
    fn step_context(
        &self,
        step_id: &str,
        attempt: u32,
        position: Option<FanOutPosition>,
    ) -> StepContext {
        let mut ctx = StepContext::new(&self.execution_id, &self.workflow_name).with_step(step_id);
        ctx.variables = self.variables.clone();
        ctx.trigger = self.trigger.clone();
        ctx.attempt = attempt;
        match position {
            Some(p) => ctx.for_item(p.item_index, p.items_total),
            None => ctx,
        }
    }

    /// One attempt of a step: a single run, or a bounded map over its input.
    /// A map run also hands back its bundle.
    async fn attempt(
        &self,
        step: &Arc<Step>,
        activation: &Activation,
        ctx: StepContext,
        outputs: &dyn ContextProvider,
    ) -> (StepOutcome, Option<MapResult>) {
        let limit = step.timeout_seconds.map(Duration::from_secs);
        if !step.is_map() {
            let outcome = self
                .runtime
                .execute(step.clone(), &activation.input, ctx, outputs, limit)
                .await;
            return (outcome, None);
        }

        let prepared = match self.runtime.prepare(step.clone(), ctx.clone(), outputs) {
            Ok(prepared) => Arc::new(prepared),
            Err(failure) => return (StepOutcome::Err(failure), None),
        };
        let settings = MapSettings {
            concurrency: step.batch_size.unwrap_or(self.map.concurrency),
            ..self.map
        };

        let run = run_map(
            self.runtime.clone(),
            prepared,
            activation.map_items(),
            &ctx,
            settings,
        );
        let result = match limit {
            Some(limit) => match timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    let failure = StepFailure::new(
                        StepFailureKind::Timeout,
                        format!("Step '{}' timed out after {:?}", step.id, limit),
                    );
                    return (StepOutcome::Err(failure), None);
                }
            },
            None => run.await,
        };

        match result {
            Ok(result) => {
                let counters = result.counters;
                let metadata = json!({ "items": counters, "errors": result.errors() });
                let output = StepOutput::with_metadata(result.output_value(), metadata)
                    .with_item_count(counters.successful as u64);
                (StepOutcome::Ok(output), Some(result))
            }
            Err(failure) => (StepOutcome::Err(failure), None),
        }
    }
}

/// Scratch outputs overlaid with the outputs of the activation's own item.
struct ItemScope<'a> {
    scratch: &'a ScratchScope,
    own: HashMap<String, Value>,
}

impl ContextProvider for ItemScope<'_> {
    fn outputs(&self) -> HashMap<String, Value> {
        let mut outputs = self.scratch.outputs();
        outputs.extend(self.own.iter().map(|(k, v)| (k.clone(), v.clone())));
        outputs
    }
}

/// Delay before attempt `attempt + 1`.
fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.delay_ms;
    let ms = match config.backoff {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(attempt as u64),
        BackoffType::Exponential => {
            let shift = attempt.saturating_sub(1).min(20);
            base.saturating_mul(1u64 << shift)
        }
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::EngineEvent;
    use crate::nodes::StepExecutor;
    use crate::storage::{MemoryStorage, StepExecution};
    use crate::workflow::parse_workflow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails `fail_times` times, then succeeds.
    struct FailingStep {
        calls: AtomicUsize,
    }

    impl FailingStep {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StepExecutor for FailingStep {
        fn type_id(&self) -> &str {
            "failing"
        }

        async fn execute(
            &self,
            config: &Value,
            _input: &Value,
            _ctx: &StepContext,
        ) -> Result<StepOutcome> {
            let fail_times = config
                .get("fail_times")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let current = self.calls.fetch_add(1, Ordering::SeqCst);
            if current < fail_times {
                Err(Error::Step(format!(
                    "Simulated failure {}/{}",
                    current + 1,
                    fail_times
                )))
            } else {
                Ok(StepOutcome::ok(json!({"success": true, "attempts": current + 1})))
            }
        }
    }

    struct AlwaysFailStep;

    #[async_trait]
    impl StepExecutor for AlwaysFailStep {
        fn type_id(&self) -> &str {
            "always_fail"
        }

        async fn execute(
            &self,
            _config: &Value,
            _input: &Value,
            _ctx: &StepContext,
        ) -> Result<StepOutcome> {
            Err(Error::Step("Always fails".to_string()))
        }
    }

    fn version(yaml: &str) -> WorkflowVersion {
        WorkflowVersion::new(1, parse_workflow(yaml).unwrap())
    }

    fn executor_with(registry: StepRegistry) -> (Executor, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (Executor::new(registry, storage.clone()), storage)
    }

    fn executor() -> (Executor, Arc<MemoryStorage>) {
        let mut registry = StepRegistry::new();
        registry.register(Arc::new(AlwaysFailStep));
        executor_with(registry)
    }

    async fn rows_for(storage: &MemoryStorage, execution_id: &str, step_id: &str) -> Vec<StepExecution> {
        let mut rows: Vec<StepExecution> = storage
            .list_step_executions(execution_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.step_id == step_id)
            .collect();
        rows.sort_by_key(|r| (r.attempt, r.item_index));
        rows
    }

    #[tokio::test]
    async fn test_identity_chain() {
        let (executor, storage) = executor();
        let wf = version(
            r#"
name: chain
steps:
  - id: step_1
    type: identity
  - id: step_2
    type: identity
    depends_on: [step_1]
"#,
        );

        let execution = executor
            .execute(&wf, Trigger::manual(json!({"value": 1})))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.context["step_1"], json!({"value": 1}));
        assert_eq!(execution.context["step_2"], json!({"value": 1}));
        assert_eq!(execution.output, Some(json!({"value": 1})));
        assert!(execution.error.is_none());

        let rows = rows_for(&storage, &execution.id, "step_2").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, StepStatus::Completed);
        assert_eq!(rows[0].output_item_count, Some(1));
        assert_eq!(rows[0].input_data, Some(json!({"value": 1})));

        let stored = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(!executor.runs().is_running(&execution.id).await);
    }

    #[tokio::test]
    async fn test_condition_routes_one_branch() {
        let (executor, storage) = executor();
        let wf = version(
            r#"
name: branching
steps:
  - id: check
    type: if
    config:
      conditions:
        - field: input.amount
          operator: gt
          value: 100
  - id: big
    type: identity
  - id: small
    type: identity
connections:
  - from: check
    to: big
    source_output: "true"
  - from: check
    to: small
    source_output: "false"
"#,
        );

        let execution = executor
            .execute(&wf, Trigger::manual(json!({"amount": 250})))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.context.contains_key("big"));
        assert!(!execution.context.contains_key("small"));
        assert_eq!(execution.output, Some(json!({"amount": 250})));

        let small = rows_for(&storage, &execution.id, "small").await;
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_fan_out_then_accumulate() {
        let (executor, storage) = executor();
        let wf = version(
            r#"
name: fan-out-sum
steps:
  - id: split
    type: split
    config:
      field: input.items
  - id: each
    type: identity
    depends_on: [split]
  - id: total
    type: aggregate
    depends_on: [each]
    config:
      operation: sum
"#,
        );

        let execution = executor
            .execute(&wf, Trigger::manual(json!({"items": [1, 2, 3]})))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.context["split"], json!([1, 2, 3]));
        assert_eq!(execution.context["each"], json!([1, 2, 3]));
        assert_eq!(execution.context["total"], json!(6));
        assert_eq!(execution.output, Some(json!(6)));

        let each = rows_for(&storage, &execution.id, "each").await;
        assert_eq!(each.len(), 3);
        assert_eq!(
            each.iter().map(|r| r.item_index).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2)]
        );
        let split = rows_for(&storage, &execution.id, "split").await;
        assert_eq!(split[0].output_item_count, Some(3));
    }

    #[tokio::test]
    async fn test_map_mode_step() {
        let (executor, storage) = executor();
        let wf = version(
            r#"
name: map-mode
steps:
  - id: each
    type: identity
    execution_mode: map
    batch_size: 2
"#,
        );

        let execution = executor
            .execute(&wf, Trigger::manual(json!([1, 2, 3])))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output, Some(json!([1, 2, 3])));

        let rows = rows_for(&storage, &execution.id, "each").await;
        assert_eq!(rows[0].output_item_count, Some(3));
        assert_eq!(rows[0].metadata["items"]["successful"], json!(3));
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let mut registry = StepRegistry::new();
        registry.register(Arc::new(FailingStep::new()));
        let (executor, storage) = executor_with(registry);
        let wf = version(
            r#"
name: retry-fixed
steps:
  - id: flaky
    type: failing
    config:
      fail_times: 2
    retry:
      max_attempts: 3
      delay_ms: 1
      backoff: fixed
"#,
        );

        let execution = executor.execute(&wf, Trigger::manual(json!(null))).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output.as_ref().unwrap()["attempts"], json!(3));

        let rows = rows_for(&storage, &execution.id, "flaky").await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].status, StepStatus::Failed);
        assert_eq!(rows[1].status, StepStatus::Failed);
        assert_eq!(rows[2].status, StepStatus::Completed);
        assert_eq!(rows[0].retry_of_id, None);
        assert_eq!(rows[2].retry_of_id.as_deref(), Some(rows[1].id.as_str()));
    }

    #[tokio::test]
    async fn test_retry_exhausted_fails_execution() {
        let (executor, storage) = executor();
        let wf = version(
            r#"
name: retry-exhausted
steps:
  - id: doomed
    type: always_fail
    retry:
      max_attempts: 2
      delay_ms: 1
  - id: after
    type: identity
    depends_on: [doomed]
"#,
        );

        let execution = executor.execute(&wf, Trigger::manual(json!(null))).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        let error = execution.error.unwrap();
        assert_eq!(error.error_type, "step_failed");
        assert_eq!(error.details["step_id"], json!("doomed"));
        assert_eq!(error.details["attempt"], json!(2));
        assert_eq!(error.details["kind"], json!("executor_failed"));
        assert!(execution.output.is_none());
        assert!(rows_for(&storage, &execution.id, "after").await.is_empty());
    }

    #[tokio::test]
    async fn test_on_error_fallback_value() {
        let (executor, storage) = executor();
        let wf = version(
            r#"
name: fallback
steps:
  - id: risky
    type: always_fail
    on_error:
      action: fallback
      fallback_value:
        status: default
  - id: next
    type: identity
    depends_on: [risky]
"#,
        );

        let execution = executor.execute(&wf, Trigger::manual(json!(null))).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output, Some(json!({"status": "default"})));

        let risky = rows_for(&storage, &execution.id, "risky").await;
        assert_eq!(risky[0].status, StepStatus::Failed);
        assert_eq!(risky[0].output_data, Some(json!({"status": "default"})));
    }

    #[tokio::test]
    async fn test_on_error_continue_and_skip() {
        let (executor, storage) = executor();
        let wf = version(
            r#"
name: recoveries
steps:
  - id: soft
    type: always_fail
    on_error:
      action: continue
  - id: dropped
    type: always_fail
    on_error:
      action: skip
  - id: after_dropped
    type: identity
    depends_on: [dropped]
"#,
        );

        let execution = executor.execute(&wf, Trigger::manual(json!(null))).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.context["soft"], Value::Null);
        assert!(!execution.context.contains_key("dropped"));
        let after = rows_for(&storage, &execution.id, "after_dropped").await;
        assert_eq!(after[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_unknown_step_type_is_recorded() {
        let (executor, _storage) = executor();
        let wf = version(
            r#"
name: broken
steps:
  - id: mystery
    type: does_not_exist
"#,
        );

        let execution = executor.execute(&wf, Trigger::manual(json!(null))).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let error = execution.error.unwrap();
        assert_eq!(error.error_type, "build_failed");
        assert_eq!(error.details["code"], json!("BUILD_ERROR"));
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let (executor, storage) = executor();
        let monitor = Monitor::new();
        let mut events = monitor.subscribe();
        let executor = executor.with_monitor(monitor);
        let wf = version(
            r#"
name: long-wait
steps:
  - id: pause
    type: wait
    config:
      seconds: 30
"#,
        );

        let handle = executor.start(&wf, Trigger::manual(json!(null))).await.unwrap();
        let execution_id = handle.execution_id.clone();

        loop {
            match events.recv().await.unwrap() {
                EngineEvent::StepStarted { step } if step.step_id == "pause" => break,
                _ => {}
            }
        }

        let cancelled = executor.cancel(&execution_id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.error.as_ref().unwrap().error_type, "cancelled");

        let finished = handle.wait().await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Cancelled);

        let rows = rows_for(&storage, &execution_id, "pause").await;
        assert_eq!(rows[0].status, StepStatus::Cancelled);

        let again = executor.cancel(&execution_id).await.unwrap_err();
        assert_eq!(again.code(), "ALREADY_TERMINAL");
    }

    #[tokio::test]
    async fn test_execution_timeout() {
        let (executor, storage) = executor();
        let wf = version(
            r#"
name: too-slow
settings:
  timeout_seconds: 1
steps:
  - id: pause
    type: wait
    config:
      seconds: 30
"#,
        );

        let execution = executor.execute(&wf, Trigger::manual(json!(null))).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Timeout);
        let error = execution.error.unwrap();
        assert_eq!(error.error_type, "timeout");
        assert_eq!(error.details["timeout_seconds"], json!(1));

        let rows = rows_for(&storage, &execution.id, "pause").await;
        assert_eq!(rows[0].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_resume_failed_execution() {
        let mut registry = StepRegistry::new();
        registry.register(Arc::new(FailingStep::new()));
        let (executor, storage) = executor_with(registry);
        let wf = version(
            r#"
name: resumable
steps:
  - id: step1
    type: identity
  - id: step2
    type: failing
    depends_on: [step1]
    config:
      fail_times: 1
  - id: step3
    type: identity
    depends_on: [step2]
"#,
        );

        let first = executor
            .execute(&wf, Trigger::manual(json!({"n": 100})))
            .await
            .unwrap();
        assert_eq!(first.status, ExecutionStatus::Failed);

        let checkpoint = storage.latest_checkpoint(&first.id).await.unwrap().unwrap();
        assert_eq!(checkpoint.step_outputs["step1"], json!({"n": 100}));

        let resumed = executor.resume(&first.id, &wf).await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(resumed.resumed_from.as_deref(), Some(first.id.as_str()));
        assert_eq!(resumed.output.as_ref().unwrap()["attempts"], json!(2));

        let step1 = rows_for(&storage, &resumed.id, "step1").await;
        assert_eq!(step1[0].metadata["source"], json!("pinned"));

        let err = executor.resume(&resumed.id, &wf).await.unwrap_err();
        assert_eq!(err.code(), "EXECUTION_ERROR");
    }

    #[tokio::test]
    async fn test_checkpoints_can_be_disabled() {
        let (executor, storage) = executor();
        let executor = executor.without_checkpoints();
        let wf = version(
            r#"
name: no-checkpoints
steps:
  - id: only
    type: identity
"#,
        );

        let execution = executor.execute(&wf, Trigger::manual(json!(1))).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(storage.latest_checkpoint(&execution.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_monitor_sees_lifecycle() {
        let (executor, _storage) = executor();
        let monitor = Monitor::new();
        let mut events = monitor.subscribe();
        let executor = executor.with_monitor(monitor);
        let wf = version(
            r#"
name: observed
steps:
  - id: only
    type: identity
"#,
        );

        executor.execute(&wf, Trigger::manual(json!(1))).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                EngineEvent::ExecutionStarted { .. } => "execution_started",
                EngineEvent::StepStarted { .. } => "step_started",
                EngineEvent::StepCompleted { .. } => "step_completed",
                EngineEvent::ExecutionFinished { .. } => "execution_finished",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "execution_started",
                "step_started",
                "step_completed",
                "execution_finished"
            ]
        );
    }

    #[test]
    fn test_retry_delay_backoff() {
        let mut config = RetryConfig {
            max_attempts: 5,
            delay_ms: 100,
            backoff: BackoffType::Fixed,
        };
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(100));

        config.backoff = BackoffType::Linear;
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(300));

        config.backoff = BackoffType::Exponential;
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&config, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_flat_index_nested() {
        let outer = FanOutPosition {
            item_index: 1,
            items_total: 2,
        };
        let inner = FanOutPosition {
            item_index: 2,
            items_total: 3,
        };
        assert_eq!(flat_index(&Vec::new()), None);
        assert_eq!(flat_index(&vec![outer]), Some(1));
        assert_eq!(flat_index(&vec![outer, inner]), Some(5));
    }
}
