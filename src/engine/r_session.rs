//! R engine session backed by a long-lived `R --vanilla --slave` process.
//!
//! Each statement is written to the process's stdin wrapped in a `tryCatch`
//! that prints a single status line prefixed with a per-session marker:
//!
//! ```text
//! <marker> OK <formatted value>
//! <marker> ERR <condition message>
//! ```
//!
//! Everything else the process prints on stdout is analysis chatter and is
//! logged at debug level. Stderr is drained on a separate task.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::EngineConfig;
use super::statement::quote_r_string;
use super::{Engine, EngineFactory, EngineValue};
use crate::error::EngineError;

/// Consecutive failures across distinct statements after which the session
/// is considered broken.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Outcome carried by a marker line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MarkerStatus {
    Ok(String),
    Err(String),
}

/// Parses a status line. Returns `None` for lines that are not status lines.
fn parse_marker_line(marker: &str, line: &str) -> Option<MarkerStatus> {
    let rest = line.strip_prefix(marker)?.trim_start();
    if let Some(value) = rest.strip_prefix("OK") {
        Some(MarkerStatus::Ok(value.trim().to_string()))
    } else if let Some(message) = rest.strip_prefix("ERR") {
        Some(MarkerStatus::Err(message.trim().to_string()))
    } else {
        Some(MarkerStatus::Err(format!("unexpected status line: {}", rest)))
    }
}

/// Wraps a statement so its outcome is reported on one marker line.
fn wrap_statement(marker: &str, statement: &str) -> String {
    format!(
        "local({{ .status <- tryCatch({{ .value <- eval(parse(text={stmt}), envir=.GlobalEnv); \
         paste(c(\"OK\", format(.value)), collapse=\" \") }}, \
         error=function(e) paste(\"ERR\", conditionMessage(e))); \
         cat(\"\\n{marker} \", gsub(\"\\n\", \" \", .status), \"\\n\", sep=\"\") }})\n",
        stmt = quote_r_string(statement),
        marker = marker,
    )
}

/// Tracks consecutive evaluation failures.
///
/// A success resets the count. Repeated failures of the same statement
/// count once.
#[derive(Debug, Default)]
struct FailureTracker {
    consecutive: u32,
    last_failed: Option<String>,
}

impl FailureTracker {
    fn record_success(&mut self) {
        self.consecutive = 0;
        self.last_failed = None;
    }

    /// Records a failure and returns true once the threshold is reached.
    fn record_failure(&mut self, statement: &str) -> bool {
        if self.last_failed.as_deref() != Some(statement) {
            self.consecutive += 1;
            self.last_failed = Some(statement.to_string());
        }
        self.consecutive >= MAX_CONSECUTIVE_FAILURES
    }
}

/// A live R process.
pub struct RSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    marker: String,
    failures: FailureTracker,
    usable: bool,
}

impl RSession {
    /// Starts R, configures its library path and display, and loads the
    /// configured packages.
    pub async fn start(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut child = Command::new(&config.r_binary)
            .args(["--vanilla", "--slave"])
            .env("R_LIBS_USER", &config.lib_user_path)
            .env("DISPLAY", &config.display)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::StartFailed(format!(
                    "could not spawn {}: {}",
                    config.r_binary.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::StartFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::StartFailed("stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "analysis_rpc::engine::r", "{}", line);
                }
            });
        }

        let mut session = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            marker: format!("__ANALYSIS_RPC_{}__", Uuid::new_v4().simple()),
            failures: FailureTracker::default(),
            usable: true,
        };

        for statement in Self::setup_statements(config) {
            if let Err(e) = session.evaluate(&statement).await {
                session.shutdown().await;
                return Err(EngineError::StartFailed(e.to_string()));
            }
        }

        info!(
            pid = ?session.child.id(),
            packages = ?config.packages_to_load(),
            "R session started"
        );
        Ok(session)
    }

    fn setup_statements(config: &EngineConfig) -> Vec<String> {
        let lib_path = config.lib_user_path.to_string_lossy();
        let mut statements = vec![
            format!(
                "Sys.setenv(R_LIBS_USER={}, DISPLAY={})",
                quote_r_string(&lib_path),
                quote_r_string(&config.display)
            ),
            format!(".libPaths(c({}, .libPaths()))", quote_r_string(&lib_path)),
        ];
        statements.extend(
            config
                .packages_to_load()
                .into_iter()
                .map(|package| format!("library({})", package)),
        );
        statements
    }

    async fn read_status(&mut self) -> Result<MarkerStatus, EngineError> {
        loop {
            let line = self.stdout.next_line().await?;
            let Some(line) = line else {
                return Err(EngineError::Fatal("R process closed its output".to_string()));
            };
            if let Some(status) = parse_marker_line(&self.marker, &line) {
                return Ok(status);
            }
            if !line.is_empty() {
                debug!(target: "analysis_rpc::engine::r", "{}", line);
            }
        }
    }

    async fn exchange(&mut self, statement: &str) -> Result<MarkerStatus, EngineError> {
        let wrapped = wrap_statement(&self.marker, statement);
        self.stdin.write_all(wrapped.as_bytes()).await?;
        self.stdin.flush().await?;
        self.read_status().await
    }
}

#[async_trait]
impl Engine for RSession {
    async fn evaluate(&mut self, statement: &str) -> Result<EngineValue, EngineError> {
        if !self.usable {
            return Err(EngineError::Fatal("session already failed".to_string()));
        }

        debug!(statement = %statement, "Evaluating");
        let status = match self.exchange(statement).await {
            Ok(status) => status,
            Err(e) => {
                self.usable = false;
                return Err(e);
            }
        };

        match status {
            MarkerStatus::Ok(value) => {
                self.failures.record_success();
                Ok(EngineValue::new(value))
            }
            MarkerStatus::Err(message) => {
                if self.failures.record_failure(statement) {
                    self.usable = false;
                    warn!(
                        failures = MAX_CONSECUTIVE_FAILURES,
                        "R session marked unusable after repeated failures"
                    );
                    return Err(EngineError::Fatal(format!(
                        "{} consecutive failures, last: {}",
                        MAX_CONSECUTIVE_FAILURES, message
                    )));
                }
                Err(EngineError::EvaluationFailed {
                    statement: statement.to_string(),
                    message,
                })
            }
        }
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    async fn shutdown(&mut self) {
        self.usable = false;
        let _ = self.stdin.write_all(b"quit(save=\"no\")\n").await;
        let _ = self.stdin.flush().await;
        match tokio::time::timeout(std::time::Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(status = %status, "R session exited"),
            _ => {
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill R session");
                }
            }
        }
    }
}

/// Creates [`RSession`]s from a shared configuration.
#[derive(Debug, Clone, Default)]
pub struct RSessionFactory {
    config: EngineConfig,
}

impl RSessionFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[async_trait]
impl EngineFactory for RSessionFactory {
    async fn create(&self) -> Result<Box<dyn Engine>, EngineError> {
        let session = RSession::start(&self.config).await?;
        Ok(Box::new(session))
    }
}
