//! CLI command definitions for analysis-rpc.
//!
//! - `serve`: run a worker pool against a Redis queue until Ctrl+C or SIGTERM
//! - `submit`: send one request and print the correlated reply
//! - `dead-letters`: list messages that were rejected without requeue

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::broker::{Broker, RedisBroker};
use crate::client::AnalysisClient;
use crate::engine::{EngineConfig, RSessionFactory};
use crate::request::{AnalysisRequest, ArgValue};
use crate::scheduler::{PoolStats, WorkerPool, WorkerPoolConfig};

/// Default queue for the submit and dead-letters utilities.
const DEFAULT_QUEUE: &str = "pals_analysis";

/// Default Redis URL for the submit and dead-letters utilities.
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Queued R analysis service.
#[derive(Parser)]
#[command(name = "analysis-rpc")]
#[command(about = "Serve and submit queued R analysis requests")]
#[command(version)]
#[command(
    long_about = "analysis-rpc runs a pool of workers that take analysis requests from a queue,\nevaluate them in R and publish a reply to each request's reply queue.\n\nExample usage:\n  analysis-rpc serve --workers 4 --queue pals_analysis\n  analysis-rpc submit QCPLOT --arg obsNC=file:///data/obs.nc --arg userName=alice"
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
    /// Run a worker pool until interrupted.
    ///
    /// Settings not given on the command line are read from the
    /// `ANALYSIS_*` environment variables, then defaults.
    Serve(ServeArgs),

    /// Submit one request and print the reply as JSON.
    Submit(SubmitArgs),

    /// Print dead-lettered messages as JSON, newest first.
    #[command(name = "dead-letters")]
    DeadLetters(DeadLettersArgs),
}

/// Arguments for `analysis-rpc serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Number of workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Request queue name.
    #[arg(short = 'q', long)]
    pub queue: Option<String>,

    /// Redis connection URL.
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Directory for staged input files.
    #[arg(long)]
    pub input_dir: Option<PathBuf>,

    /// Directory for staged output files.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

/// Arguments for `analysis-rpc submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Analysis kind (e.g. CVS2NETCDF, QCPLOT, OBSAnnualCycle).
    pub kind: String,

    /// Analysis argument as NAME=VALUE. May be repeated.
    #[arg(short = 'a', long = "arg", value_parser = parse_key_value)]
    pub arguments: Vec<(String, String)>,

    /// Request queue name.
    #[arg(short = 'q', long, env = "ANALYSIS_QUEUE_NAME", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Redis connection URL.
    #[arg(long, env = "ANALYSIS_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Seconds to wait for the reply.
    #[arg(short = 't', long, default_value = "300")]
    pub timeout: u64,
}

/// Arguments for `analysis-rpc dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Request queue name.
    #[arg(short = 'q', long, env = "ANALYSIS_QUEUE_NAME", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Redis connection URL.
    #[arg(long, env = "ANALYSIS_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Maximum number of entries to print.
    #[arg(short = 'n', long, default_value = "10")]
    pub limit: usize,
}

/// Parses a `NAME=VALUE` pair. The value may itself contain `=`.
fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("argument name is empty in '{}'", raw));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(args).await,
    }
}

/// Builds the pool configuration: command line over environment over defaults.
fn serve_config(args: ServeArgs) -> anyhow::Result<WorkerPoolConfig> {
    let mut config = WorkerPoolConfig::from_env().context("Invalid worker pool environment")?;

    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if let Some(queue) = args.queue {
        config = config.with_queue_name(queue);
    }
    if let Some(url) = args.redis_url {
        config = config.with_redis_url(url);
    }
    if let Some(dir) = args.input_dir {
        config.input_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    config.validate()?;
    Ok(config)
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let config = serve_config(args)?;
    let engine_config = EngineConfig::from_env().context("Invalid R engine environment")?;

    let broker = RedisBroker::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redis_url))?;

    info!(
        workers = config.num_workers,
        queue = %config.queue_name,
        r_binary = %engine_config.r_binary.display(),
        "Starting analysis service"
    );

    let api_package = engine_config.api_package.clone();
    let mut pool = WorkerPool::new(
        config.clone(),
        Arc::new(broker),
        Arc::new(RSessionFactory::new(engine_config)),
    )
    .with_api_package(api_package);

    pool.start(config.num_workers).await?;
    let stats = serve_until(&mut pool, shutdown_signal()).await?;

    info!(
        processed = stats.total_processed(),
        normal = stats.replies_normal,
        error = stats.replies_error,
        rejected = stats.messages_rejected,
        success_rate = stats.success_rate(),
        "Analysis service stopped"
    );
    Ok(())
}

/// Waits for `shutdown`, stops the pool and returns the statistics
/// including requests that finished during shutdown.
async fn serve_until<F>(pool: &mut WorkerPool, shutdown: F) -> anyhow::Result<PoolStats>
where
    F: Future<Output = std::io::Result<()>>,
{
    shutdown
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    pool.stop().await?;
    Ok(pool.stats())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminated = async {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminated => {
            info!("Received SIGTERM");
            Ok(())
        }
    }
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let arguments: HashMap<String, ArgValue> = args
        .arguments
        .into_iter()
        .map(|(name, value)| (name, ArgValue::String(value)))
        .collect();
    let request = AnalysisRequest::new(args.kind).with_arguments(arguments);

    let broker = RedisBroker::connect(&args.redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", args.redis_url))?;
    let mut client = AnalysisClient::connect(Arc::new(broker), args.queue)
        .await?
        .with_timeout(Duration::from_secs(args.timeout));

    info!(request_id = %request.id(), kind = %request.kind(), "Submitting request");
    let reply = client.submit(&request).await?;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn run_dead_letters_command(args: DeadLettersArgs) -> anyhow::Result<()> {
    let broker = RedisBroker::connect(&args.redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", args.redis_url))?;

    let letters = broker.dead_letters(&args.queue, args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&letters)?);
    Ok(())
}
