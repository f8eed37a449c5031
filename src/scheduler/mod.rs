//! Worker pool serving analysis requests from a shared queue.
//!
//! - **WorkerPool**: starts and stops a set of workers on one queue
//! - **Worker**: consumes, analyses and replies, one message at a time
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Client    │
//!                      │ (submit/CLI) │
//!                      └──────┬───────┘
//!                             │ request (reply_to, correlation_id)
//!                      ┌──────▼───────┐
//!                      │    Broker    │
//!                      │    Queue     │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│         │ Worker N│
//!    │ + R     │         │ + R     │         │ + R     │
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────── reply ───┴─── to reply_to ───┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use analysis_rpc::broker::RedisBroker;
//! use analysis_rpc::engine::{EngineConfig, RSessionFactory};
//! use analysis_rpc::scheduler::{WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let config = WorkerPoolConfig::from_env()?;
//! let broker = Arc::new(RedisBroker::connect(&config.redis_url).await?);
//! let factory = Arc::new(RSessionFactory::new(EngineConfig::from_env()?));
//!
//! let mut pool = WorkerPool::new(config.clone(), broker, factory);
//! pool.start(config.num_workers).await?;
//!
//! tokio::signal::ctrl_c().await?;
//! pool.stop().await?;
//! ```

mod worker;
pub mod worker_pool;

pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
