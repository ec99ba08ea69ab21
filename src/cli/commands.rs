//! CLI command definitions for dacrew.
//!
//! `serve` runs the webhook ingest server (optionally with in-process
//! workers), `worker` runs a standalone worker pool, and `dead-letters` /
//! `stats` inspect the queue.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{IngestConfig, WorkerConfig};
use crate::evaluator;
use crate::ingest::{self, stream_key_for, AppState, Producer};
use crate::metrics::init_metrics;
use crate::stream::{self, StreamStats};
use crate::worker::WorkerPool;

/// Reliable work queue between Jira webhooks and issue evaluators.
#[derive(Parser)]
#[command(name = "dacrew")]
#[command(about = "Queue Jira webhooks durably and evaluate them with competing workers")]
#[command(version)]
#[command(
    long_about = "dacrew accepts signed Jira webhooks, appends them to per-project streams and \
    processes them with a pool of competing workers.\n\nExample usage:\n  \
    dacrew serve --port 8080\n  dacrew worker run --num-workers 4\n  \
    dacrew dead-letters --project ABC"
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
    /// Run the webhook ingest server.
    Serve(ServeArgs),

    /// Run or inspect the worker pool.
    Worker(WorkerArgs),

    /// List dead-lettered messages of a project.
    #[command(name = "dead-letters")]
    DeadLetters(DeadLettersArgs),

    /// Show stream counters.
    Stats(StatsArgs),
}

/// Arguments for `dacrew serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address (overrides JIRA_INGEST_HOST).
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port (overrides JIRA_INGEST_PORT).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Also run this many workers in the same process.
    #[arg(short = 'w', long, default_value = "0")]
    pub workers: usize,
}

/// Worker entrypoint arguments.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerSubcommand,
}

/// Worker subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum WorkerSubcommand {
    /// Start the worker pool and process messages until interrupted.
    Run(WorkerRunArgs),

    /// Print the effective worker configuration.
    Config,
}

/// Arguments for `dacrew worker run`.
#[derive(Parser, Debug)]
pub struct WorkerRunArgs {
    /// Number of workers (overrides WORKER_NUM_WORKERS).
    #[arg(short = 'n', long)]
    pub num_workers: Option<usize>,

    /// Messages claimed per poll (overrides WORKER_BATCH_SIZE).
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Idle poll wait in milliseconds (overrides WORKER_POLL_INTERVAL_MS).
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Use the logging mock evaluator (overrides WORKER_MOCK_PROCESSING).
    #[arg(long)]
    pub mock_processing: Option<bool>,
}

/// Arguments for `dacrew dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Jira project key.
    #[arg(short, long)]
    pub project: String,

    /// Maximum entries to show, newest first.
    #[arg(long, default_value = "20")]
    pub limit: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `dacrew stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Jira project key. All known streams when omitted.
    #[arg(short, long)]
    pub project: Option<String>,

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
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Worker(args) => match args.command {
            WorkerSubcommand::Run(args) => run_worker_command(args).await,
            WorkerSubcommand::Config => run_worker_config_command(),
        },
        Commands::DeadLetters(args) => run_dead_letters_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
    }
}

// ============================================================================
// Serve / worker
// ============================================================================

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = IngestConfig::from_env()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    let worker_config = if args.workers > 0 {
        let worker_config = WorkerConfig::from_env()?
            .with_num_workers(args.workers)
            .with_redis_url(config.redis_url.clone());
        worker_config.validate()?;
        Some(worker_config)
    } else {
        None
    };

    let orphan_timeout = worker_config
        .as_ref()
        .map(|c| c.orphan_timeout)
        .unwrap_or_else(|| WorkerConfig::default().orphan_timeout);
    let store = stream::open_store(&config.redis_url, &config.stream_prefix, orphan_timeout).await?;

    let mut pool = match worker_config {
        Some(worker_config) => {
            let evaluator = evaluator::from_config(&worker_config)?;
            let mut pool = WorkerPool::new(worker_config, Arc::clone(&store), evaluator);
            pool.start()?;
            Some(pool)
        }
        None => None,
    };

    let producer = Producer::new(
        store,
        config.webhook_secret.as_bytes(),
        config.stream_prefix.clone(),
    );
    let app = ingest::router(
        AppState {
            producer: Arc::new(producer),
        },
        &config.webhook_endpoint,
    );

    info!(
        endpoint = %config.webhook_endpoint,
        stream_prefix = %config.stream_prefix,
        workers = args.workers,
        "Starting ingest service"
    );
    ingest::serve(&config.bind_address(), app, shutdown_signal()).await?;

    if let Some(pool) = pool.as_mut() {
        pool.shutdown().await?;
        log_pool_stats(pool);
    }
    Ok(())
}

async fn run_worker_command(args: WorkerRunArgs) -> anyhow::Result<()> {
    let mut config = WorkerConfig::from_env()?;
    if let Some(n) = args.num_workers {
        config = config.with_num_workers(n);
    }
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(ms) = args.poll_interval {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }
    if let Some(mock) = args.mock_processing {
        config = config.with_mock_processing(mock);
    }
    config.validate()?;

    info!(
        redis_url = %config.redis_url,
        group = %config.consumer_group,
        num_workers = config.num_workers,
        batch_size = config.batch_size,
        mock_processing = config.mock_processing,
        "Starting worker pool"
    );

    let mut pool = WorkerPool::connect(config).await?;
    pool.start()?;

    shutdown_signal().await;
    pool.shutdown().await?;
    log_pool_stats(&pool);
    Ok(())
}

fn run_worker_config_command() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;

    println!("\n=== Worker Configuration ===");
    println!("Redis URL:          {}", config.redis_url);
    println!("Stream prefix:      {}", config.stream_prefix);
    println!("Consumer group:     {}", config.consumer_group);
    println!("Workers:            {}", config.num_workers);
    println!("Batch size:         {}", config.batch_size);
    println!("Poll interval:      {:?}", config.poll_interval);
    println!("Mock processing:    {}", config.mock_processing);
    if config.mock_processing {
        println!("Mock delay:         {:?}", config.mock_delay);
    }
    println!(
        "Evaluator URL:      {}",
        config.evaluator_url.as_deref().unwrap_or("-")
    );
    println!("Evaluation timeout: {:?}", config.evaluation_timeout);
    println!("Max retries:        {}", config.max_retries);
    println!("Orphan timeout:     {:?}", config.orphan_timeout);
    println!("Reclaim interval:   {:?}", config.reclaim_interval);
    println!("Shutdown timeout:   {:?}", config.shutdown_timeout);
    Ok(())
}

fn log_pool_stats(pool: &WorkerPool) {
    let stats = pool.stats();
    info!(
        acknowledged = stats.messages_acknowledged,
        failed = stats.messages_failed,
        dead_lettered = stats.messages_dead_lettered,
        orphans_released = stats.orphans_released,
        success_rate = stats.success_rate(),
        average_ms = stats.average_duration.as_millis() as u64,
        "Worker pool statistics"
    );
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// ============================================================================
// Inspection
// ============================================================================

async fn run_dead_letters_command(args: DeadLettersArgs) -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    let store =
        stream::open_store(&config.redis_url, &config.stream_prefix, config.orphan_timeout).await?;

    let stream_key = stream_key_for(&config.stream_prefix, &args.project);
    let dead_letters = store.dead_letters(&stream_key, args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&dead_letters)?);
        return Ok(());
    }

    if dead_letters.is_empty() {
        println!("No dead letters in {}", stream_key);
        return Ok(());
    }

    println!("\n=== Dead letters: {} ===", stream_key);
    for dead in &dead_letters {
        let issue = dead
            .envelope
            .payload
            .get("issue_key")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        println!(
            "  {} [{}] deliveries={} at={}",
            dead.envelope.id,
            issue,
            dead.envelope.delivery_count,
            dead.dead_lettered_at.to_rfc3339()
        );
        println!("    reason: {}", dead.reason);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    group: String,
    streams: Vec<StreamStats>,
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    let store =
        stream::open_store(&config.redis_url, &config.stream_prefix, config.orphan_timeout).await?;

    let stream_keys = match args.project {
        Some(project) => vec![stream_key_for(&config.stream_prefix, &project)],
        None => store.streams().await?,
    };

    let mut streams = Vec::with_capacity(stream_keys.len());
    for stream_key in &stream_keys {
        streams.push(store.stats(stream_key, &config.consumer_group).await?);
    }

    let output = StatsOutput {
        group: config.consumer_group,
        streams,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\n=== Streams (group {}) ===", output.group);
    if output.streams.is_empty() {
        println!("  no streams");
    }
    for stats in &output.streams {
        println!(
            "  {:<32} length={:<6} pending={:<6} dead_letters={}",
            stats.stream_key, stats.length, stats.pending, stats.dead_letters
        );
    }
    Ok(())
}
