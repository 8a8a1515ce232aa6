// crates/flowcli/src/main.rs

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{ExecutionEvent, Step, StepKind, StepStatus, WorkflowDefinition, WorkflowInstance};
use flownodes::{standard_registry, JexlEvaluator};
use flowruntime::{resolver, FlowRuntime, RuntimeConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition file
    Run {
        /// Path to workflow definition JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Instance input as JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Correlation key stored on the instance
        #[arg(short, long, default_value = "cli")]
        business_id: String,

        /// Complete a human step: `step=JSON` (repeatable)
        #[arg(long, value_name = "STEP=JSON")]
        respond: Vec<String>,

        /// Reject a human step: `step=JSON` (repeatable)
        #[arg(long, value_name = "STEP=JSON")]
        reject: Vec<String>,

        /// How long to wait for scheduled retries before reporting
        #[arg(long, default_value_t = 10_000)]
        wait_ms: u64,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the per-drive iteration guard
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Override the instance lock wait
        #[arg(long)]
        lock_timeout_ms: Option<u64>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow definition file
    Validate {
        /// Path to workflow definition JSON file
        file: PathBuf,
    },

    /// List available task types
    Tasks,

    /// Create a new example workflow definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

enum Response {
    Complete,
    Reject,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            business_id,
            respond,
            reject,
            wait_ms,
            config,
            max_iterations,
            lock_timeout_ms,
            verbose,
        } => {
            init_logging(verbose);

            let mut config = load_config(config)?;
            if let Some(max_iterations) = max_iterations {
                config.max_iterations = max_iterations;
            }
            if let Some(lock_timeout_ms) = lock_timeout_ms {
                config.lock_timeout_ms = lock_timeout_ms;
            }
            let mut responses = Vec::new();
            for raw in &respond {
                responses.push((Response::Complete, parse_step_payload(raw)?));
            }
            for raw in &reject {
                responses.push((Response::Reject, parse_step_payload(raw)?));
            }

            run_workflow(file, input, business_id, responses, wait_ms, config).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Tasks => {
            list_tasks();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(RuntimeConfig::default()),
    }
}

fn load_definition(file: &PathBuf) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing workflow {}", file.display()))
}

/// Split `step=JSON` into the step id and its payload.
fn parse_step_payload(raw: &str) -> Result<(String, Value)> {
    let (step, payload) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected STEP=JSON, got '{}'", raw))?;
    let value = serde_json::from_str(payload)
        .with_context(|| format!("payload for step '{}' is not valid JSON", step))?;
    Ok((step.trim().to_string(), value))
}

async fn run_workflow(
    file: PathBuf,
    input: Option<String>,
    business_id: String,
    responses: Vec<(Response, (String, Value))>,
    wait_ms: u64,
    config: RuntimeConfig,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let definition = load_definition(&file)?;
    println!("📋 Workflow: {}", definition.name);
    println!("   Steps: {}", definition.steps.len());
    println!();

    let input: Value = match input {
        Some(raw) => serde_json::from_str(&raw).context("input is not valid JSON")?,
        None => json!({}),
    };
    if !input.is_object() {
        bail!("Input must be a JSON object");
    }

    let runtime = FlowRuntime::in_memory(standard_registry(), Arc::new(JexlEvaluator::new()), config);
    let shutdown = CancellationToken::new();
    runtime.start_background(shutdown.clone());

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::StateChanged { entity_id, status, .. } => {
                    let icon = match status.as_str() {
                        "RUNNING" => "⚡",
                        "COMPLETED" => "✅",
                        "FAILED" => "❌",
                        "RETRYING" => "🔁",
                        "AWAITING_INPUT" => "✋",
                        "SKIPPED" => "⏭️ ",
                        _ => "•",
                    };
                    println!("  {} {} → {}", icon, entity_id, status);
                }
                ExecutionEvent::ExecutionDuration { seconds, .. } => {
                    println!("  ⏱️  Finished in {:.3}s", seconds);
                }
            }
        }
    });

    let executor = runtime.executor();
    let definition = executor.create_definition(definition).await?;
    let mut instance = executor
        .start_workflow(definition.id, business_id, input)
        .await?;

    for (kind, (step_id, payload)) in responses {
        instance = match kind {
            Response::Complete => executor.complete_human_task(instance.id, &step_id, payload).await?,
            Response::Reject => executor.reject_human_task(instance.id, &step_id, payload).await?,
        };
    }

    let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
    while has_pending_retry(&instance) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        instance = executor.get_instance(instance.id).await?;
    }

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    event_task.abort();

    print_summary(&definition, &instance)?;
    Ok(())
}

fn has_pending_retry(instance: &WorkflowInstance) -> bool {
    !instance.status.is_terminal()
        && instance
            .state
            .step_executions
            .iter()
            .any(|e| e.status == StepStatus::Retrying)
}

fn print_summary(definition: &WorkflowDefinition, instance: &WorkflowInstance) -> Result<()> {
    println!();
    println!("📊 Execution Summary:");
    println!("   Instance ID: {}", instance.id);
    println!("   Status: {}", instance.status);
    println!("   Step executions: {}", instance.state.step_executions.len());

    if let Some(error) = &instance.error {
        println!("   Error: {}", error);
    }

    let awaiting = resolver::awaiting_input(definition, &instance.state);
    if !awaiting.is_empty() {
        println!();
        println!("✋ Waiting for input:");
        for step in awaiting {
            println!("   {}", step.id);
            if let Some(form) = instance.state.latest(&step.id).and_then(|e| e.form.as_ref()) {
                println!("     form: {}", serde_json::to_string(form)?);
            }
        }
        println!();
        println!("Re-run with --respond <step>='{{...}}' or --reject <step>='{{...}}'");
    }

    if instance.status.is_terminal() {
        println!();
        println!("📤 Output:");
        println!("{}", serde_json::to_string_pretty(&instance.output)?);
    }
    Ok(())
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let definition = load_definition(&file)?;
    definition.validate()?;

    let registry = standard_registry();
    let unknown: Vec<&str> = definition
        .steps
        .iter()
        .filter(|s| s.kind == StepKind::Task)
        .filter_map(|s| s.task_type())
        .filter(|t| !registry.contains(t))
        .collect();
    if !unknown.is_empty() {
        bail!("Unknown task types: {}", unknown.join(", "));
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", definition.name);
    println!("   Steps: {}", definition.steps.len());
    for step in &definition.steps {
        if step.dependencies.is_empty() {
            println!("     - {}", step.id);
        } else {
            println!("     - {} (after {})", step.id, step.dependencies.join(", "));
        }
    }

    Ok(())
}

fn list_tasks() {
    println!("📦 Available Task Types:");
    println!();

    let registry = standard_registry();
    for task_type in registry.list_task_types() {
        println!("  • {}", task_type);
        if let Some(description) = registry.description(&task_type).filter(|d| !d.is_empty()) {
            println!("    {}", description);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut definition = WorkflowDefinition::new("Expense Approval");
    definition.description =
        Some("Scores an expense, asks a manager when it is large, then reports".to_string());
    definition.input_schema = json!({
        "type": "object",
        "required": ["requestId", "amount"],
        "properties": {
            "requestId": { "type": "string" },
            "amount": { "type": "number" }
        }
    });
    definition.output_schema = json!({
        "type": "object",
        "properties": {
            "approved": { "type": "boolean" },
            "comments": { "type": "string" }
        }
    });

    definition
        .add_step(
            Step::script("score", "return {large: input.amount > 500, approved: input.amount <= 500}")
                .with_name("Score request")
                .with_input("amount", "$.input.amount")
                .with_output("approved", "$.output.approved"),
        )
        .add_step(
            Step::human("approve")
                .with_name("Manager approval")
                .depends_on("score")
                .with_condition("$.steps.score.output.large")
                .with_form(json!({
                    "fields": [
                        { "name": "approved", "type": "boolean" },
                        { "name": "comments", "type": "string" }
                    ]
                }))
                .with_output("approved", "$.output.approved")
                .with_output("comments", "$.output.comments"),
        );

    let json = serde_json::to_string_pretty(&definition)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"requestId\": \"REQ-1\", \"amount\": 900}}' --respond 'approve={{\"approved\": true, \"comments\": \"ok\"}}'",
        output.display()
    );

    Ok(())
}
