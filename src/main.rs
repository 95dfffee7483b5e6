use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use weft::config::Config;
use weft::engine::{plan_subset, Executor, Plan};
use weft::nodes::StepRegistry;
use weft::shutdown::ShutdownCoordinator;
use weft::storage::{ExecutionStatus, MemoryStorage, Trigger};
use weft::telemetry::init_tracing;
use weft::workflow::{parse_workflow_file, validate_step_types, WorkflowDraft};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Dataflow workflow execution engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/weft/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file: graph, options and step types
    Validate {
        /// Path to workflow YAML file
        file: String,
    },
    /// Show the compiled plan, optionally for a partial run
    Plan {
        /// Path to workflow YAML file
        file: String,
        /// Steps the partial run must produce
        #[arg(short, long = "target")]
        targets: Vec<String>,
        /// Supplied step output (id=JSON)
        #[arg(short, long = "pin", value_parser = parse_pin)]
        pins: Vec<(String, Value)>,
    },
    /// Run a workflow once and print the execution record
    Run {
        /// Path to workflow YAML file
        file: String,
        /// JSON trigger data
        #[arg(short, long)]
        input: Option<String>,
    },
}

fn parse_pin(s: &str) -> std::result::Result<(String, Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid pin '{}'. Expected id=JSON", s))?;
    let value = serde_json::from_str(&s[pos + 1..])
        .map_err(|e| format!("Invalid JSON for pin '{}': {}", &s[..pos], e))?;
    Ok((s[..pos].to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Validate { file } => cmd_validate(&file)?,
        Commands::Plan {
            file,
            targets,
            pins,
        } => cmd_plan(&file, &targets, pins)?,
        Commands::Run { file, input } => cmd_run(&file, input.as_deref(), config).await?,
    }

    Ok(())
}

fn load_draft(file: &str) -> anyhow::Result<WorkflowDraft> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }
    let workflow = parse_workflow_file(path)?;
    Ok(WorkflowDraft::from_workflow(&workflow))
}

fn cmd_validate(file: &str) -> anyhow::Result<()> {
    let version = load_draft(file)?.publish(1)?;
    validate_step_types(&version.workflow, &StepRegistry::new())?;

    let workflow = &version.workflow;
    println!("✓ Workflow '{}' is valid", workflow.name);
    println!();
    println!("  Steps: {}", workflow.steps.len());
    println!("  Connections: {}", workflow.connections.len());

    let map_steps = workflow.steps.iter().filter(|s| s.is_map()).count();
    if map_steps > 0 {
        println!("  Map-mode steps: {}", map_steps);
    }

    Ok(())
}

fn cmd_plan(file: &str, targets: &[String], pins: Vec<(String, Value)>) -> anyhow::Result<()> {
    let version = load_draft(file)?.publish(1)?;
    let workflow = &version.workflow;
    let registry = StepRegistry::new();

    let pinned: HashMap<String, Value> = pins.into_iter().collect();
    let pinned_ids: HashSet<String> = pinned.keys().cloned().collect();

    let (plan, execution_order) = if targets.is_empty() && pinned.is_empty() {
        let plan = Plan::compile(workflow, &registry)?;
        let order: Vec<String> = plan
            .executable_steps()
            .into_iter()
            .map(str::to_string)
            .collect();
        (plan, order)
    } else {
        let targets: Vec<String> = if targets.is_empty() {
            workflow.steps.iter().map(|s| s.id.clone()).collect()
        } else {
            targets.to_vec()
        };
        let order = plan_subset(&targets, &workflow.steps, &workflow.connections, &pinned_ids)?;
        let execution_set: HashSet<String> = order.iter().cloned().collect();
        let plan = Plan::compile_partial(workflow, &registry, &execution_set, &pinned_ids)?;
        (plan, order)
    };

    let mut pinned_list: Vec<&String> = pinned_ids.iter().collect();
    pinned_list.sort();
    let report = json!({
        "execution_order": execution_order,
        "pinned": pinned_list,
        "plan": plan.describe(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_run(file: &str, input: Option<&str>, config: Config) -> anyhow::Result<()> {
    let version = load_draft(file)?.publish(1)?;

    let trigger_data: Value = match input {
        Some(raw) => serde_json::from_str(raw)?,
        None => json!({}),
    };

    let shutdown = ShutdownCoordinator::new();
    shutdown.start_signal_listener();

    let executor = Executor::new(StepRegistry::new(), Arc::new(MemoryStorage::new()))
        .with_config(config.engine)
        .with_shutdown(shutdown);

    let execution = executor
        .execute(&version, Trigger::manual(trigger_data))
        .await?;

    println!("{}", serde_json::to_string_pretty(&execution)?);

    if execution.status != ExecutionStatus::Completed {
        anyhow::bail!("Execution {} finished with status {}", execution.id, execution.status);
    }
    Ok(())
}
