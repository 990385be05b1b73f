//! CLI command definitions for rowforge.
//!
//! Every command loads `EngineConfig` from the environment, opens the
//! connections it needs and prints JSON to stdout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{wait_for_terminal, Engine};
use crate::ingest::BulkSubmission;
use crate::listing::{RowQuery, RowStatus, DEFAULT_PAGE_SIZE};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{WorkerPool, WorkerPoolConfig};
use crate::storage::Database;

/// Batch-row processing engine.
#[derive(Parser)]
#[command(name = "rowforge")]
#[command(about = "Run a script over every row of a tabular input")]
#[command(version)]
#[command(
    long_about = "rowforge splits a CSV input into per-row tasks, runs each row through a user script on a bounded worker pool, and compiles the row outputs into consolidated artifacts.\n\nConfiguration is read from the environment (DATABASE_URL, REDIS_URL, RESULTS_PATH, ...).\n\nExample usage:\n  rowforge submit --owner 1 --script-id 7 --input ./people.csv --wait\n  rowforge worker"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply database migrations.
    Migrate,

    /// Submit a CSV input as a new bulk job.
    Submit(SubmitArgs),

    /// Run a worker pool until interrupted.
    Worker(WorkerArgs),

    /// Abort a job.
    Abort(JobArgs),

    /// Show a job's status and counters.
    Status(JobArgs),

    /// List a job's rows with their derived status.
    Rows(RowsArgs),

    /// Show a row's log.
    Logs(LogsArgs),

    /// Build the consolidated artifacts of a job.
    Compile(JobArgs),

    /// Show task queue depths.
    #[command(name = "queue-stats")]
    QueueStats,
}

/// Arguments for `rowforge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Owner of the job; the script must belong to this owner.
    #[arg(long)]
    pub owner: i64,

    /// Script to run for every row.
    #[arg(long)]
    pub script_id: Option<i64>,

    /// CSV input file.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Rows per bulk enqueue (default: CHUNK_SIZE).
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Move the input instead of copying it into the uploads directory.
    #[arg(long)]
    pub consume_input: bool,

    /// Wait for the job to reach a terminal status.
    #[arg(short, long)]
    pub wait: bool,

    /// Seconds to wait with --wait.
    #[arg(long, default_value = "3600")]
    pub wait_timeout: u64,
}

/// Arguments for `rowforge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Concurrent leases (default: WORKER_CONCURRENCY).
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Concurrent executions (default: WORKER_MAX_CHILDREN).
    #[arg(long)]
    pub max_children: Option<usize>,

    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Job id.
    pub job_id: Uuid,
}

/// Arguments for `rowforge rows`.
#[derive(Parser, Debug)]
pub struct RowsArgs {
    /// Job id.
    pub job_id: Uuid,

    /// 1-based page number.
    #[arg(short, long, default_value = "1")]
    pub page: usize,

    /// Rows per page.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Only rows with this status (success, failed, pending, unreadable).
    #[arg(short, long)]
    pub status: Option<RowStatus>,
}

/// Arguments for `rowforge logs`.
#[derive(Parser, Debug)]
pub struct LogsArgs {
    /// Job id.
    pub job_id: Uuid,

    /// Row index.
    pub row: u64,

    /// Show only the last N non-empty lines.
    #[arg(short, long, num_args = 0..=1, default_missing_value = "50")]
    pub tail: Option<usize>,

    /// List the row's files instead of printing its log.
    #[arg(long)]
    pub files: bool,
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
    let config = EngineConfig::from_env().context("Failed to load configuration")?;

    if let Commands::Migrate = cli.command {
        return run_migrate_command(&config).await;
    }

    let engine = Engine::connect(config)
        .await
        .context("Failed to connect engine")?;
    let result = match cli.command {
        Commands::Migrate => Ok(()),
        Commands::Submit(args) => run_submit_command(&engine, args).await,
        Commands::Worker(args) => run_worker_command(&engine, args).await,
        Commands::Abort(args) => run_abort_command(&engine, args.job_id).await,
        Commands::Status(args) => print_json(&engine.job(args.job_id).await?),
        Commands::Rows(args) => run_rows_command(&engine, args).await,
        Commands::Logs(args) => run_logs_command(&engine, args).await,
        Commands::Compile(args) => run_compile_command(&engine, args.job_id).await,
        Commands::QueueStats => print_json(&engine.queue().stats().await?),
    };
    engine.shutdown().await;
    result
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_migrate_command(config: &EngineConfig) -> anyhow::Result<()> {
    let db = Database::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let applied = db.run_migrations().await.context("Migrations failed")?;
    info!(applied, "Migrations complete");
    db.close().await;
    print_json(&serde_json::json!({ "applied": applied }))
}

async fn run_submit_command(engine: &Engine, args: SubmitArgs) -> anyhow::Result<()> {
    let input_file = match &args.input {
        Some(path) if !args.consume_input => Some(stage_copy(engine, path).await?),
        other => other.clone(),
    };

    let receipt = engine
        .submission()
        .submit_bulk(BulkSubmission {
            owner_id: args.owner,
            script_id: args.script_id,
            input_file,
            chunk_size: args.chunk_size,
        })
        .await?;
    print_json(&receipt)?;

    if args.wait {
        let job = wait_for_terminal(
            engine,
            receipt.job_id,
            Duration::from_secs(1),
            Duration::from_secs(args.wait_timeout),
        )
        .await?;
        print_json(&job)?;
    }
    Ok(())
}

/// Copies the input next to the uploads root so the submission can consume
/// it without touching the caller's file.
async fn stage_copy(engine: &Engine, path: &Path) -> anyhow::Result<PathBuf> {
    if !path.exists() {
        anyhow::bail!("Input file does not exist: {}", path.display());
    }
    let staging = engine.config().uploads_path.join("incoming");
    tokio::fs::create_dir_all(&staging).await?;
    let staged = staging.join(format!("{}.csv", Uuid::new_v4()));
    tokio::fs::copy(path, &staged)
        .await
        .with_context(|| format!("Failed to stage {}", path.display()))?;
    Ok(staged)
}

async fn run_worker_command(engine: &Engine, args: WorkerArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registration failed");
    }

    let mut config = engine.config().clone();
    if let Some(concurrency) = args.concurrency {
        config = config.with_worker_concurrency(concurrency);
    }
    if let Some(max_children) = args.max_children {
        config = config.with_worker_max_children(max_children);
    }
    config.validate()?;

    let mut pool = WorkerPool::new(WorkerPoolConfig::from_engine(&config), engine.pool_deps());
    pool.start().await?;
    info!(
        workers = pool.num_workers(),
        max_children = config.worker_max_children,
        "Worker pool running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down worker pool");
    pool.shutdown().await?;
    print_json(&pool.stats())?;

    if args.metrics {
        println!("{}", export_metrics());
    }
    Ok(())
}

async fn run_abort_command(engine: &Engine, job_id: Uuid) -> anyhow::Result<()> {
    let report = engine.abort_controller().abort(job_id).await?;
    print_json(&report)
}

async fn run_rows_command(engine: &Engine, args: RowsArgs) -> anyhow::Result<()> {
    let page = engine
        .rows(
            args.job_id,
            RowQuery {
                page: args.page,
                page_size: args.page_size,
                status: args.status,
            },
        )
        .await?;
    print_json(&page)
}

async fn run_logs_command(engine: &Engine, args: LogsArgs) -> anyhow::Result<()> {
    let store = engine.store();
    if args.files {
        let files: Vec<String> = store
            .row_files(args.job_id, args.row)
            .await?
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        return print_json(&files);
    }

    match args.tail {
        Some(lines) => match store.tail_log(args.job_id, args.row, lines).await? {
            Some(tail) => print_json(&tail),
            None => anyhow::bail!("Log not found for row {} of job {}", args.row, args.job_id),
        },
        None => match store.read_log(args.job_id, args.row).await? {
            Some(content) => {
                print!("{}", content);
                Ok(())
            }
            None => anyhow::bail!("Log not found for row {} of job {}", args.row, args.job_id),
        },
    }
}

async fn run_compile_command(engine: &Engine, job_id: Uuid) -> anyhow::Result<()> {
    engine.job(job_id).await?;
    let report = engine.compiler().compile(job_id).await?;
    print_json(&report)
}
