//! CLI command definitions for jobforge.
//!
//! Every command opens the task store described by the layered
//! configuration (defaults, optional YAML file, `JOBFORGE_*` environment,
//! then command-line flags) and registers the demo task types.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::later_by;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    NewTask, QueueConfig, SchedulingPolicy, TaskId, TaskQueue, TaskStatus, WorkerPool,
};
use crate::storage::{CancelOutcome, MigrationRunner, TaskFilter, TaskStore};

use super::demo_tasks::demo_registry;

/// Durable task queue with pluggable scheduling policies.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Durable SQLite-backed task queue with pluggable scheduling policies")]
#[command(version)]
#[command(
    long_about = "jobforge stores tasks in SQLite and runs them on workers that claim work under a\nscheduling policy (fifo, lifo, priority, weighted_random).\n\nExample usage:\n  jobforge init\n  jobforge enqueue echo '{\"message\": \"hello\"}' --priority 80\n  jobforge worker --workers 4 --policy priority"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// SQLite database URL.
    #[arg(long, env = "JOBFORGE_DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// YAML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create or upgrade the database schema.
    Init(InitArgs),

    /// Submit a task.
    #[command(alias = "add")]
    Enqueue(EnqueueArgs),

    /// Show one task and its log.
    Get(GetArgs),

    /// List tasks.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Request cancellation of a task.
    Cancel(CancelArgs),

    /// Run a worker pool with the demo executors until Ctrl-C.
    Worker(WorkerArgs),

    /// Run the health monitor.
    Monitor(MonitorArgs),

    /// Print queue statistics.
    Stats(StatsArgs),

    /// Print Prometheus metrics for the current queue state.
    Metrics,
}

/// Arguments for `jobforge init`.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Drop every table before applying migrations. Destroys all data.
    #[arg(long)]
    pub reset: bool,
}

/// Arguments for `jobforge enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Task type tag.
    pub task_type: String,

    /// Parameters as a JSON document.
    #[arg(default_value = "{}")]
    pub params: String,

    /// Priority in [0, 100]; higher is more urgent.
    #[arg(short, long)]
    pub priority: Option<i32>,

    /// Seconds to wait before the task becomes claimable.
    #[arg(long)]
    pub delay_secs: Option<u64>,

    /// Retry ceiling (defaults to the configured value).
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Arguments for `jobforge get`.
#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Task identifier.
    pub id: TaskId,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `jobforge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only tasks in this status.
    #[arg(short, long)]
    pub status: Option<TaskStatus>,

    /// Only tasks of this type.
    #[arg(short = 't', long = "type")]
    pub task_type: Option<String>,

    /// Only tasks claimed by this worker.
    #[arg(short, long)]
    pub worker: Option<String>,

    #[arg(long, default_value = "50")]
    pub limit: i64,

    #[arg(long, default_value = "0")]
    pub offset: i64,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `jobforge cancel`.
#[derive(Parser, Debug)]
pub struct CancelArgs {
    /// Task identifier.
    pub id: TaskId,
}

/// Arguments for `jobforge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of worker runtimes.
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,

    /// Scheduling policy (fifo, lifo, priority, weighted_random).
    #[arg(short, long)]
    pub policy: Option<SchedulingPolicy>,

    /// Do not run the health monitor in this process.
    #[arg(long)]
    pub no_monitor: bool,
}

/// Arguments for `jobforge monitor`.
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Run a single sweep and exit.
    #[arg(long)]
    pub once: bool,
}

/// Arguments for `jobforge stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Throughput window in seconds.
    #[arg(long, default_value = "3600")]
    pub window_secs: u64,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Init(args) => run_init_command(config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(config, args).await,
        Commands::Get(args) => run_get_command(config, args).await,
        Commands::List(args) => run_list_command(config, args).await,
        Commands::Cancel(args) => run_cancel_command(config, args).await,
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Monitor(args) => run_monitor_command(config, args).await,
        Commands::Stats(args) => run_stats_command(config, args).await,
        Commands::Metrics => run_metrics_command(config).await,
    }
}

/// Builds the configuration: file (or environment), then flags.
fn load_config(cli: &Cli) -> anyhow::Result<QueueConfig> {
    let mut config = match &cli.config {
        Some(path) => QueueConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => QueueConfig::from_env().context("Invalid JOBFORGE_* environment")?,
    };
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    Ok(config)
}

async fn open_queue(config: QueueConfig) -> anyhow::Result<TaskQueue> {
    let registry = demo_registry().context("Failed to register demo task types")?;
    let url = config.database_url.clone();
    TaskQueue::open(config, Arc::new(registry))
        .await
        .with_context(|| format!("Failed to open task queue at {}", url))
}

/// Resolves on Ctrl-C. A failure to install the handler is logged and
/// treated as an immediate signal.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
    }
}

// ============================================================================
// Command implementations
// ============================================================================

async fn run_init_command(config: QueueConfig, args: InitArgs) -> anyhow::Result<()> {
    let registry = Arc::new(demo_registry()?);
    let store = TaskStore::connect(&config.database_url, config.max_connections, registry).await?;
    let runner = MigrationRunner::new(store.pool().clone());
    if args.reset {
        runner.reset_database().await?;
    }
    let applied = runner.run_migrations().await?;
    let migrations = runner.list_applied_migrations().await?;
    println!(
        "Database {} ready: {} migration(s) applied now, {} total",
        config.database_url,
        applied,
        migrations.len()
    );
    Ok(())
}

async fn run_enqueue_command(config: QueueConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("Parameters must be valid JSON")?;
    let queue = open_queue(config).await?;

    let mut task = NewTask::new(args.task_type, params);
    if let Some(priority) = args.priority {
        task = task.with_priority(priority);
    }
    if let Some(delay) = args.delay_secs {
        task = task.with_run_after(later_by(Utc::now(), Duration::from_secs(delay)));
    }
    if let Some(max_retries) = args.max_retries {
        task = task.with_max_retries(max_retries);
    }

    let id = queue.enqueue(task).await?;
    println!("{}", id);
    Ok(())
}

async fn run_get_command(config: QueueConfig, args: GetArgs) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let task = queue.get_task(args.id).await?;
    let logs = queue.task_logs(args.id).await?;

    if args.json {
        let output = serde_json::json!({ "task": task, "logs": logs });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Task {} ({})", task.id, task.task_type);
    println!("  status:      {}", task.status);
    println!("  priority:    {}", task.priority);
    println!("  run_after:   {}", task.run_after.to_rfc3339());
    println!("  retries:     {}/{}", task.retry_count, task.max_retries);
    if let Some(worker) = &task.claimed_by {
        println!("  claimed_by:  {}", worker);
    }
    if task.cancel_requested {
        println!("  cancel requested");
    }
    if let Some(error) = &task.error_message {
        println!("  error:       {}", error);
    }
    if let Some(result) = &task.result {
        println!("  result:      {}", result);
    }
    println!("  parameters:  {}", task.parameters);
    println!();
    println!("Log:");
    for entry in logs {
        println!(
            "  {}  {:<10} {:<20} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.event,
            entry.worker_id.as_deref().unwrap_or("-"),
            entry.message
        );
    }
    Ok(())
}

async fn run_list_command(config: QueueConfig, args: ListArgs) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let mut filter = TaskFilter::new().with_limit(args.limit).with_offset(args.offset);
    if let Some(status) = args.status {
        filter = filter.with_status(status);
    }
    if let Some(task_type) = args.task_type {
        filter = filter.with_task_type(task_type);
    }
    if let Some(worker) = args.worker {
        filter = filter.with_worker_id(worker);
    }
    let tasks = queue.list_tasks(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    println!(
        "{:>8}  {:<16} {:<10} {:>4}  {:>7}  {}",
        "ID", "TYPE", "STATUS", "PRI", "RETRIES", "WORKER"
    );
    for task in &tasks {
        println!(
            "{:>8}  {:<16} {:<10} {:>4}  {:>3}/{:<3}  {}",
            task.id,
            task.task_type,
            task.status,
            task.priority,
            task.retry_count,
            task.max_retries,
            task.claimed_by.as_deref().unwrap_or("-")
        );
    }
    println!("{} task(s)", tasks.len());
    Ok(())
}

async fn run_cancel_command(config: QueueConfig, args: CancelArgs) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    match queue.cancel(args.id).await? {
        CancelOutcome::Cancelled => println!("Task {} cancelled", args.id),
        CancelOutcome::Requested => {
            println!("Task {} is held by a worker; cancellation requested", args.id)
        }
        CancelOutcome::AlreadyFinished(status) => {
            println!("Task {} already finished ({})", args.id, status)
        }
    }
    Ok(())
}

async fn run_worker_command(mut config: QueueConfig, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(policy) = args.policy {
        config = config.with_policy(policy);
    }
    config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let queue = open_queue(config).await?;
    let mut pool: WorkerPool = queue.worker_pool();
    if args.no_monitor {
        pool = pool.without_monitor();
    }

    info!(
        workers = pool.num_workers(),
        policy = %queue.config().policy,
        "Starting workers, press Ctrl-C to stop"
    );
    let stats = pool.run_until(ctrl_c()).await?;
    println!(
        "Processed {} task(s): {} completed, {} failed ({:.1}% success)",
        stats.tasks_processed,
        stats.tasks_completed,
        stats.tasks_failed,
        stats.success_rate()
    );
    Ok(())
}

async fn run_monitor_command(config: QueueConfig, args: MonitorArgs) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let monitor = queue.health_monitor();

    if args.once {
        let report = monitor.sweep().await?;
        println!(
            "Stale workers: {}  reclaimed: {}  cancelled: {}  skipped: {}",
            report.stale_workers.len(),
            report.reclaimed.len(),
            report.cancelled.len(),
            report.skipped
        );
        return Ok(());
    }

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { monitor.run(token).await }
    });
    ctrl_c().await;
    token.cancel();
    handle.await.context("Health monitor task failed")?;
    Ok(())
}

async fn run_stats_command(config: QueueConfig, args: StatsArgs) -> anyhow::Result<()> {
    let ttl = config.heartbeat_ttl;
    let queue = open_queue(config).await?;
    let stats = queue
        .views()
        .snapshot(ttl, Duration::from_secs(args.window_secs))
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Queue depth:");
    for (status, count) in &stats.depth_by_status {
        println!("  {:<10} {}", status, count);
    }
    println!("Active workers: {}", stats.active_workers);
    println!(
        "Throughput ({}s): {} completed, {} failed, {:.2}/min",
        stats.throughput.window_secs,
        stats.throughput.completed,
        stats.throughput.failed,
        stats.throughput.per_minute
    );
    if !stats.type_rates.is_empty() {
        println!("Per type:");
        for rates in &stats.type_rates {
            println!(
                "  {:<16} total {:>6}  failure {:>5.1}%  retried {:>5.1}%",
                rates.task_type,
                rates.total,
                rates.failure_rate * 100.0,
                rates.retry_rate * 100.0
            );
        }
    }
    let fairness = &stats.fairness;
    println!(
        "Wait times ({} samples): mean {:.2}s  p95 {:.2}s  max {:.2}s  gini {:.3}  jain {:.3}",
        fairness.samples,
        fairness.mean_wait_secs,
        fairness.p95_wait_secs,
        fairness.max_wait_secs,
        fairness.gini,
        fairness.jain
    );
    Ok(())
}

async fn run_metrics_command(config: QueueConfig) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    let queue = open_queue(config).await?;
    queue.health_monitor().refresh_gauges().await?;
    print!("{}", export_metrics());
    Ok(())
}
