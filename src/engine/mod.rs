//! Engine binding for the external R analysis runtime.
//!
//! An [`Engine`] owns one session with the scripting engine and is the only
//! path through which analysis code is evaluated. `evaluate` takes `&mut
//! self`, so a session can never be driven by two callers at once; each
//! worker gets its own session from an [`EngineFactory`].
//!
//! Statements evaluated on the same session share one global namespace:
//! a later statement may use variables assigned by an earlier one.
//!
//! # Example
//!
//! ```rust,ignore
//! use analysis_rpc::engine::{EngineConfig, EngineFactory, RSessionFactory, StatementBuilder};
//!
//! let factory = RSessionFactory::new(EngineConfig::default());
//! let mut engine = factory.create().await?;
//!
//! let statements = StatementBuilder::new()
//!     .library("pals")
//!     .assign_str("userName", "u")
//!     .call("result", "whoAmI", &["userName"])
//!     .build();
//! let value = engine.evaluate_all(&statements).await?;
//! ```

mod config;
mod r_session;
mod statement;

use std::fmt;

use async_trait::async_trait;

use crate::error::EngineError;

pub use config::EngineConfig;
pub use r_session::{RSession, RSessionFactory};
pub use statement::{quote_r_string, StatementBuilder};

/// Textual value returned by an evaluation. Callers know its shape.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineValue(String);

impl EngineValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A session with the scripting engine.
#[async_trait]
pub trait Engine: Send {
    /// Evaluates one statement in the session's global namespace.
    async fn evaluate(&mut self, statement: &str) -> Result<EngineValue, EngineError>;

    /// Evaluates statements in order, stopping at the first failure.
    /// Returns the value of the last statement.
    async fn evaluate_all(&mut self, statements: &[String]) -> Result<EngineValue, EngineError> {
        let mut last = EngineValue::default();
        for statement in statements {
            last = self.evaluate(statement).await?;
        }
        Ok(last)
    }

    /// Returns false once the session can no longer evaluate anything.
    fn is_usable(&self) -> bool {
        true
    }

    /// Ends the session. The default does nothing.
    async fn shutdown(&mut self) {}
}

/// Creates engine sessions. Session setup is expensive, so callers keep the
/// session they get for as long as it stays usable.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Engine>, EngineError>;
}
