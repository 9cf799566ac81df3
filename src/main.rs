use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use relay::config::Config;
use relay::core::WorkflowDefinition;
use relay::orchestration::{
    BreakerConfig, BreakerRegistry, OperationRegistry, ShellRunner, WorkflowEvent,
    WorkflowOrchestrator,
};
use relay::state::StateStore;
use relay::workflow::WorkflowId;
use relay::{rlog, Error, Result};

/// Relay - checkpointed parallel workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RELAY_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.relay/relay.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a workflow definition
    Run {
        /// Path to a TOML workflow definition
        definition: PathBuf,

        /// Resume an interrupted run instead of starting a new one
        #[arg(long)]
        resume: Option<String>,
    },

    /// Show the status of a run
    Status {
        /// Workflow ID to inspect
        workflow_id: String,
    },

    /// List all persisted runs
    List,

    /// Delete a finished run's state
    Delete {
        /// Workflow ID to delete
        workflow_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    relay::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    config.ensure_dirs()?;

    match cli.command {
        Command::Run { definition, resume } => run(&config, &definition, resume).await,
        Command::Status { workflow_id } => status(&config, &workflow_id),
        Command::List => list(&config),
        Command::Delete { workflow_id } => delete(&config, &workflow_id),
    }
}

fn build_orchestrator(
    config: &Config,
    event_tx: mpsc::Sender<WorkflowEvent>,
) -> Result<WorkflowOrchestrator> {
    let mut operations = OperationRegistry::new();
    operations.register("shell", Arc::new(ShellRunner));

    let breaker_config = BreakerConfig {
        failure_threshold: config
            .breaker_failure_threshold
            .unwrap_or(BreakerConfig::default().failure_threshold),
        timeout: config
            .breaker_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(BreakerConfig::default().timeout),
        success_threshold: config
            .breaker_success_threshold
            .unwrap_or(BreakerConfig::default().success_threshold),
    };

    Ok(WorkflowOrchestrator::new(
        StateStore::open(config.state_dir()?)?,
        Arc::new(operations),
        Arc::new(BreakerRegistry::new(breaker_config)),
        config.effective_concurrency_limit(),
        event_tx,
    ))
}

fn load_definition(path: &PathBuf) -> Result<WorkflowDefinition> {
    let contents = std::fs::read_to_string(path)?;
    let definition: WorkflowDefinition = toml::from_str(&contents)?;
    definition.validate()?;
    Ok(definition)
}

fn parse_workflow_id(raw: &str) -> Result<WorkflowId> {
    raw.parse::<WorkflowId>()
        .map_err(|_| Error::Validation(format!("Invalid workflow id: {}", raw)))
}

async fn run(config: &Config, path: &PathBuf, resume: Option<String>) -> Result<()> {
    let definition = load_definition(path)?;
    let (event_tx, event_rx) = mpsc::channel(100);
    let orchestrator = Arc::new(build_orchestrator(config, event_tx)?);

    let printer = tokio::spawn(print_events(event_rx));

    // Ctrl-C requests cooperative cancellation
    let canceller = Arc::clone(&orchestrator);
    let ctrlc = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Cancelling... (state will be saved for resume)");
            for id in canceller.active_runs() {
                let _ = canceller.cancel(id);
            }
        }
    });

    let result = match resume {
        Some(raw) => {
            let id = parse_workflow_id(&raw)?;
            orchestrator.resume(id, &definition).await?
        }
        None => orchestrator.execute(&definition).await?,
    };

    // Drop every sender so the printer drains and exits
    ctrlc.abort();
    drop(orchestrator);
    let _ = printer.await;

    rlog!(
        "Run finished id={} status={}",
        result.workflow_id.short(),
        result.status
    );
    println!(
        "\nWorkflow {} {} in {}ms ({} completed, {} failed, {} skipped)",
        result.workflow_id,
        result.status,
        result.duration_ms,
        result.completed_phases.len(),
        result.failed_phases.len(),
        result.skipped_phases.len()
    );

    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn print_events(mut event_rx: mpsc::Receiver<WorkflowEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            WorkflowEvent::WorkflowStarted {
                workflow_id,
                definition_name,
                total_phases,
            } => {
                println!(
                    "[{}] starting '{}' ({} phases)",
                    workflow_id.short(),
                    definition_name,
                    total_phases
                );
            }
            WorkflowEvent::BatchStarted {
                batch_index, phases, ..
            } => {
                let names: Vec<&str> = phases.iter().map(|p| p.as_str()).collect();
                println!("  batch {}: {}", batch_index + 1, names.join(", "));
            }
            WorkflowEvent::PhaseCompleted {
                phase_id,
                duration_ms,
                ..
            } => {
                println!("    ok   {} ({}ms)", phase_id, duration_ms);
            }
            WorkflowEvent::PhaseFailed {
                phase_id, error, ..
            } => {
                println!("    FAIL {} - {}", phase_id, error);
            }
            WorkflowEvent::PhaseSkipped { phase_id, .. } => {
                println!("    skip {}", phase_id);
            }
            WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowFailed { .. }
            | WorkflowEvent::WorkflowPaused { .. } => {}
        }
    }
}

fn status(config: &Config, raw_id: &str) -> Result<()> {
    let (event_tx, _event_rx) = mpsc::channel(1);
    let orchestrator = build_orchestrator(config, event_tx)?;
    let report = orchestrator.status(parse_workflow_id(raw_id)?)?;

    println!("Workflow:   {}", report.workflow_id);
    println!("Definition: {}", report.definition_name);
    println!("Status:     {}", report.status);
    println!(
        "Phases:     {} completed, {} failed, {} skipped",
        report.completed, report.failed, report.skipped
    );
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let (event_tx, _event_rx) = mpsc::channel(1);
    let orchestrator = build_orchestrator(config, event_tx)?;
    let reports = orchestrator.list()?;

    if reports.is_empty() {
        println!("No workflow runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:>5} {:>5} {:>5}",
        "ID", "DEFINITION", "STATUS", "OK", "FAIL", "SKIP"
    );
    for report in reports {
        println!(
            "{:<38} {:<20} {:<10} {:>5} {:>5} {:>5}",
            report.workflow_id.to_string(),
            report.definition_name,
            report.status.to_string(),
            report.completed,
            report.failed,
            report.skipped
        );
    }
    Ok(())
}

fn delete(config: &Config, raw_id: &str) -> Result<()> {
    let (event_tx, _event_rx) = mpsc::channel(1);
    let orchestrator = build_orchestrator(config, event_tx)?;
    let id = parse_workflow_id(raw_id)?;
    orchestrator.delete(id)?;
    println!("Deleted workflow {}", id);
    Ok(())
}
