//! NodeFleet Orchestrator CLI
//!
//! Connects to a set of worker nodes, runs one task across all of them and
//! prints the aggregate report.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use nodefleet_core::{
    AggregateReport, OrchestratorConfig, SuccessPolicy, Task, TaskPayload, TaskResult,
};
use nodefleet_orchestrator::{NodeTransport, Orchestrator, TcpTransport};

/// NodeFleet - run a task across a fleet of workers
#[derive(Parser, Debug)]
#[command(name = "nodefleet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker address (repeat for each node)
    #[arg(short = 'n', long = "node", required = true)]
    nodes: Vec<SocketAddr>,

    /// TOML configuration file
    #[arg(short, long, env = "NODEFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Per-node task timeout in milliseconds
    #[arg(long)]
    task_timeout_ms: Option<u64>,

    /// Retry rounds for failed nodes
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-node connection timeout in milliseconds
    #[arg(long)]
    startup_timeout_ms: Option<u64>,

    /// Per-node heartbeat timeout in milliseconds
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Delay before the first retry round in milliseconds
    #[arg(long)]
    retry_backoff_ms: Option<u64>,

    /// Success policy: all, majority or at-least:N
    #[arg(short, long, default_value = "all")]
    policy: SuccessPolicy,

    /// Orchestrator name sent in the handshake
    #[arg(long, default_value = "nodefleet")]
    name: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a shell command on every node
    Exec {
        command: String,
        args: Vec<String>,
    },
    /// Evaluate an arithmetic expression on every node
    Compute { expression: String },
    /// Apply a data function (uppercase, reverse, word_count, ...) to input
    Data { function: String, input: String },
    /// Connect, ping and report fleet health without running a task
    Status,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => OrchestratorConfig::default(),
        };

        if let Some(ms) = self.task_timeout_ms {
            config.task_timeout_ms = ms;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(ms) = self.startup_timeout_ms {
            config.startup_timeout_ms = ms;
        }
        if let Some(ms) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout_ms = ms;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    fn task(&self) -> Option<Task> {
        let task = match &self.command {
            Command::Exec { command, args } => Task::new(
                "exec",
                TaskPayload::Command {
                    command: command.clone(),
                    args: args.clone(),
                },
            ),
            Command::Compute { expression } => Task::new_compute("compute", expression.clone()),
            Command::Data { function, input } => {
                Task::new_data("data", function.clone(), input.as_bytes().to_vec())
            }
            Command::Status => return None,
        };
        Some(task.with_policy(self.policy))
    }
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))
}

fn print_report(report: &AggregateReport) {
    println!("task {}: {} after {} round(s)", report.task_id, report.verdict, report.attempts);
    for (node_id, result) in &report.results {
        match result {
            TaskResult::Success(data) => {
                println!("  {}  ok       {}", node_id, String::from_utf8_lossy(data).trim_end())
            }
            TaskResult::Failure(error) => println!("  {}  failed   {}", node_id, error),
            TaskResult::Timeout => println!("  {}  timeout", node_id),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config = args.load_config()?;
    info!("Starting NodeFleet orchestrator");
    info!("  Nodes: {}", args.nodes.len());
    info!("  Task timeout: {}ms", config.task_timeout_ms);
    info!("  Max retries: {}", config.max_retries);

    let transports = args.nodes.iter().map(|addr| {
        Arc::new(TcpTransport::new(*addr, args.name.clone())) as Arc<dyn NodeTransport>
    });
    let orchestrator = Orchestrator::with_transports(config, transports)?;

    let started = orchestrator.start_all_nodes().await;
    for (node_id, reason) in &started.failed {
        warn!(node_id = %node_id, "Node unavailable: {}", reason);
    }

    let outcome = match args.task() {
        Some(task) => orchestrator.coordinate_task(&task).await.map(Some),
        None => {
            let heartbeat = orchestrator.heartbeat_all_nodes().await;
            info!(alive = heartbeat.alive.len(), lost = heartbeat.lost.len(), "Heartbeat complete");
            Ok(None)
        }
    };

    println!("{}", orchestrator.registry().summary());
    for node in orchestrator.registry().snapshot() {
        println!("  {}  {:<8}  {}", node.id, node.state.to_string(), node.name);
    }

    orchestrator.stop_all_nodes().await;

    match outcome? {
        Some(report) => {
            print_report(&report);
            if !report.is_success() {
                bail!("task failed under policy {}", args.policy);
            }
        }
        None => {
            if !started.all_started() {
                bail!("{} of {} nodes failed to start", started.failed.len(), args.nodes.len());
            }
        }
    }

    Ok(())
}
