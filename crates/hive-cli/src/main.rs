//! `hive`: run or check a batch of tasks from the command line.
//!
//! ```text
//! hive run --config hive.toml --tasks tasks.json [--events events.jsonl]
//! hive validate --tasks tasks.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use hive_core::app::HiveBuilder;
use hive_core::config::HiveConfig;
use hive_core::domain::{Artifact, HiveError, Outcome, TaskPayload, TaskRecord, TaskSpec};
use hive_core::graph::{resolve_order, validate_dependencies};
use hive_core::impls::JsonlEventLog;
use hive_core::ports::TaskExecutor;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "Fault-tolerant task scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task batch until nothing can make progress.
    Run {
        /// TOML config; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON array of task specs.
        #[arg(long)]
        tasks: PathBuf,

        /// Append execution events to this JSON-lines file.
        #[arg(long)]
        events: Option<PathBuf>,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 3600)]
        wait_secs: u64,
    },

    /// Check a task batch without running it.
    Validate {
        #[arg(long)]
        tasks: PathBuf,
    },
}

/// `custom` tasks with `executor = "echo"` succeed and hand back their data.
struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(
        &self,
        task: &TaskRecord,
        _workdir: &Path,
        _deadline: tokio::time::Instant,
    ) -> Result<Outcome, HiveError> {
        let data = match &task.payload {
            TaskPayload::Custom { data, .. } => data.clone(),
            _ => serde_json::Value::Null,
        };
        Ok(Outcome::success(format!("echoed {}", task.key)).with_artifact(Artifact::Json(data)))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_tasks(path: &Path) -> Result<Vec<TaskSpec>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let tasks: Vec<TaskSpec> = serde_json::from_str(&content)
        .with_context(|| format!("parsing task specs in {}", path.display()))?;
    for task in &tasks {
        task.validate()?;
    }
    Ok(tasks)
}

fn load_config(path: Option<&Path>) -> Result<HiveConfig> {
    match path {
        Some(path) => HiveConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => {
            let mut config = HiveConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn validate(tasks_path: &Path) -> Result<()> {
    let tasks = load_tasks(tasks_path)?;
    let report = validate_dependencies(&tasks);
    println!("{}", serde_json::to_string_pretty(&report)?);
    let order = resolve_order(&tasks)?;
    if !report.is_valid() {
        bail!("task batch is invalid");
    }
    println!("execution order: {}", order.join(" -> "));
    Ok(())
}

async fn run(config: Option<&Path>, tasks: &Path, events: Option<&Path>, wait: Duration) -> Result<()> {
    let config = load_config(config)?;
    let tasks = load_tasks(tasks)?;

    let mut builder = HiveBuilder::new(config)
        .with_command_executor()?
        .register_executor("echo", Arc::new(EchoExecutor))?;
    if let Some(path) = events {
        let log = JsonlEventLog::open(path)
            .await
            .with_context(|| format!("opening event log {}", path.display()))?;
        builder = builder.with_event_bus(Arc::new(log));
    }
    let running = builder.build()?.start().await;

    let ids = running.submit(tasks).await?;
    info!(tasks = ids.len(), "batch accepted");

    let outcome = tokio::select! {
        status = running.wait_until_settled(wait) => Some(status),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down");
            None
        }
    };
    let status = match outcome {
        Some(status) => status,
        None => running.status().await,
    };

    running.shutdown_and_join().await;
    let status = status?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            tasks,
            events,
            wait_secs,
        } => {
            run(
                config.as_deref(),
                &tasks,
                events.as_deref(),
                Duration::from_secs(wait_secs),
            )
            .await
        }
        Command::Validate { tasks } => validate(&tasks),
    }
}
