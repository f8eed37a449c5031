//! Error types for analysis request handling.
//!
//! Defines the error taxonomy shared by the request-handling subsystems:
//! - Request routing and argument extraction
//! - Remote file transfer (fetch/store)
//! - Engine evaluation
//! - Staging directory cleanup
//!
//! Every error in this module is resolved into an `ERROR` reply at the
//! handler boundary. Codec and broker errors live next to their modules
//! because they are handled by the worker loop instead.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while routing or handling a single analysis request.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Unrecognized analysis kind: '{0}'")]
    UnrecognizedAnalysisKind(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Invalid value for argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Failed to remove staged file {path:?}: {source}")]
    StagingCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Analysis '{0}' is not implemented")]
    NotImplemented(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    /// Shorthand for an `InvalidArgument` error.
    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns true when the engine session behind this error is unusable.
    pub fn is_fatal_engine(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_fatal())
    }
}

/// Errors that can occur while moving files between remote and local storage.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL does not name a usable location: {0}")]
    InvalidLocation(String),

    #[error("Failed to copy {from} to {to}: {source}")]
    CopyFailed {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by an engine session.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to start engine session: {0}")]
    StartFailed(String),

    #[error("Evaluation of `{statement}` failed: {message}")]
    EvaluationFailed { statement: String, message: String },

    #[error("Engine session is unusable: {0}")]
    Fatal(String),

    #[error("Engine IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Returns true when the session must be discarded and recreated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Io(_))
    }
}
