//! analysis-rpc: request/reply dispatch for queued R analysis jobs.
//!
//! Clients publish named analysis requests to a shared queue. A pool of
//! workers consumes them, stages the referenced remote files locally,
//! evaluates the analysis in a per-worker R session, stores the outputs
//! next to the inputs and publishes a correlated reply.

// Core modules
pub mod analyser;
pub mod broker;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod remote;
pub mod request;
pub mod scheduler;

pub use analyser::Analyser;
pub use broker::{Broker, InMemoryBroker, RedisBroker};
pub use client::{AnalysisClient, ClientError};
pub use codec::{CodecError, MessageCodec};
pub use config::ConfigError;
pub use error::{AnalysisError, EngineError, TransferError};
pub use request::{AnalysisKind, AnalysisReply, AnalysisRequest, ArgValue, ReplyStatus};
pub use scheduler::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
