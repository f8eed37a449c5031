//! Worker pool for processing analysis requests from a shared queue.
//!
//! Each worker runs as an independent tokio task with its own consumer,
//! analyser and engine session. All workers compete for messages on the
//! same queue.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Cooperative shutdown with a cancellation token per pool start
//! - Bounded redelivery of undecodable messages, then dead-lettering
//! - Pool statistics tracking

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyser::Analyser;
use crate::broker::{Broker, BrokerError};
use crate::config::{parse_env_millis, parse_env_secs, parse_env_value, ConfigError};
use crate::engine::EngineFactory;
use crate::handlers::{HandlerContext, StagingArea};
use crate::remote::RemoteFileRegistry;

use super::worker::Worker;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The work queue could not be declared.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] BrokerError),

    /// A pool needs at least one worker.
    #[error("Worker count must be at least 1")]
    NoWorkers,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the request queue.
    pub queue_name: String,
    /// Directory for staged inputs.
    pub input_dir: PathBuf,
    /// Directory for staged outputs.
    pub output_dir: PathBuf,
    /// Back-off after a broker error.
    pub poll_interval: Duration,
    /// Pause after each processed message.
    pub idle_pause: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Redeliveries allowed for an undecodable message before it is
    /// dead-lettered.
    pub max_redeliveries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "pals_analysis".to_string(),
            input_dir: PathBuf::from("/tmp/palsAnalyser/input"),
            output_dir: PathBuf::from("/tmp/palsAnalyser/output"),
            poll_interval: Duration::from_secs(1),
            idle_pause: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(60),
            max_redeliveries: 3,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ANALYSIS_NUM_WORKERS`: number of workers (default: 4)
    /// - `ANALYSIS_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `ANALYSIS_QUEUE_NAME`: request queue (default: pals_analysis)
    /// - `ANALYSIS_INPUT_DIR`: staged inputs (default: /tmp/palsAnalyser/input)
    /// - `ANALYSIS_OUTPUT_DIR`: staged outputs (default: /tmp/palsAnalyser/output)
    /// - `ANALYSIS_POLL_INTERVAL_MS`: broker error back-off (default: 1000)
    /// - `ANALYSIS_IDLE_PAUSE_MS`: pause between messages (default: 100)
    /// - `ANALYSIS_SHUTDOWN_TIMEOUT_SECS`: graceful shutdown bound (default: 60)
    /// - `ANALYSIS_MAX_REDELIVERIES`: redeliveries before dead-lettering (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ANALYSIS_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "ANALYSIS_NUM_WORKERS")?;
        }

        if let Ok(val) = std::env::var("ANALYSIS_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("ANALYSIS_QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Ok(val) = std::env::var("ANALYSIS_INPUT_DIR") {
            config.input_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ANALYSIS_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ANALYSIS_POLL_INTERVAL_MS") {
            config.poll_interval = parse_env_millis(&val, "ANALYSIS_POLL_INTERVAL_MS")?;
        }

        if let Ok(val) = std::env::var("ANALYSIS_IDLE_PAUSE_MS") {
            config.idle_pause = parse_env_millis(&val, "ANALYSIS_IDLE_PAUSE_MS")?;
        }

        if let Ok(val) = std::env::var("ANALYSIS_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout = parse_env_secs(&val, "ANALYSIS_SHUTDOWN_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("ANALYSIS_MAX_REDELIVERIES") {
            config.max_redeliveries = parse_env_value(&val, "ANALYSIS_MAX_REDELIVERIES")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.input_dir.as_os_str().is_empty() || self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "staging directories cannot be empty".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "shutdown_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the staging area described by this configuration.
    pub fn staging(&self) -> StagingArea {
        StagingArea::new(&self.input_dir, &self.output_dir)
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the staging directories.
    pub fn with_staging_dirs(
        mut self,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        self.input_dir = input_dir.into();
        self.output_dir = output_dir.into();
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the pause between messages.
    pub fn with_idle_pause(mut self, pause: Duration) -> Self {
        self.idle_pause = pause;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the redelivery limit for undecodable messages.
    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of workers started.
    pub num_workers: usize,
    /// Number of workers currently processing a request.
    pub active_workers: usize,
    /// Replies sent with `NORMAL` status.
    pub replies_normal: u64,
    /// Replies sent with `ERROR` status.
    pub replies_error: u64,
    /// Messages rejected because they could not be decoded.
    pub messages_rejected: u64,
    /// Average request processing duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of requests answered.
    pub fn total_processed(&self) -> u64 {
        self.replies_normal + self.replies_error
    }

    /// Returns the share of `NORMAL` replies as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.replies_normal as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    replies_normal: AtomicU64,
    replies_error: AtomicU64,
    messages_rejected: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn record_reply(&self, normal: bool, duration: Duration) {
        let counter = if normal {
            &self.replies_normal
        } else {
            &self.replies_error
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Clears the active count after workers were aborted mid-request.
    pub(crate) fn reset_active(&self) {
        self.active_workers.store(0, Ordering::SeqCst);
    }

    pub(crate) fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let normal = self.replies_normal.load(Ordering::SeqCst);
        let failed = self.replies_error.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = normal + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            replies_normal: normal,
            replies_error: failed,
            messages_rejected: self.messages_rejected.load(Ordering::SeqCst),
            average_duration,
        }
    }
}

/// Pool of workers consuming one queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Arc<dyn Broker>,
    engine_factory: Arc<dyn EngineFactory>,
    remotes: Arc<RemoteFileRegistry>,
    api_package: String,
    /// Present while the pool is running.
    cancel: Option<CancellationToken>,
    worker_handles: Vec<JoinHandle<()>>,
    running_workers: usize,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a stopped pool.
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<dyn Broker>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            config,
            broker,
            engine_factory,
            remotes: Arc::new(RemoteFileRegistry::default()),
            api_package: "pals".to_string(),
            cancel: None,
            worker_handles: Vec::new(),
            running_workers: 0,
            stats: Arc::new(SharedPoolStats::default()),
        }
    }

    /// Replaces the remote file protocol handlers.
    pub fn with_remotes(mut self, remotes: Arc<RemoteFileRegistry>) -> Self {
        self.remotes = remotes;
        self
    }

    /// Sets the R package whose functions the handlers call.
    pub fn with_api_package(mut self, package: impl Into<String>) -> Self {
        self.api_package = package.into();
        self
    }

    /// Starts `num_workers` workers.
    ///
    /// Declares the queue and recovers messages left in flight by a previous
    /// run before spawning. Calling this while the pool is running does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoWorkers` if `num_workers` is zero and
    /// `PoolError::QueueConnection` if the queue cannot be declared.
    pub async fn start(&mut self, num_workers: usize) -> Result<(), PoolError> {
        if num_workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        if self.is_running() {
            info!(
                num_workers = self.running_workers,
                "Worker pool already running"
            );
            return Ok(());
        }

        let queue = &self.config.queue_name;
        self.broker.declare(queue).await?;

        match self.broker.recover(queue).await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered, queue = %queue, "Recovered in-flight messages");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to recover in-flight messages");
            }
        }

        let cancel = CancellationToken::new();
        for i in 0..num_workers {
            let context = HandlerContext::new(
                self.config.staging(),
                Arc::clone(&self.remotes),
                self.api_package.clone(),
            );
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.broker),
                Analyser::new(Arc::clone(&self.engine_factory), context),
                cancel.child_token(),
                &self.config,
                Arc::clone(&self.stats),
            );

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.cancel = Some(cancel);
        self.running_workers = num_workers;
        info!(
            num_workers,
            queue = %self.config.queue_name,
            broker = self.broker.name(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Stops all workers.
    ///
    /// Workers finish the request they are processing. Calling this on a
    /// pool that is not running does nothing.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within the
    /// configured timeout; the remaining workers are aborted.
    pub async fn stop(&mut self) -> Result<(), PoolError> {
        let Some(cancel) = self.cancel.take() else {
            debug!("Worker pool not running");
            return Ok(());
        };

        info!("Initiating worker pool shutdown");
        cancel.cancel();
        self.running_workers = 0;

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(self.config.shutdown_timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task panicked during shutdown");
                    }
                }
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                for handle in abort_handles {
                    handle.abort();
                }
                self.stats.reset_active();
                warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "Worker pool shutdown timed out; aborted remaining workers"
                );
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.running_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Returns the number of running workers.
    pub fn num_workers(&self) -> usize {
        self.running_workers
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}
