//! Local staging directories for analysis inputs and outputs.
//!
//! Every staged file name starts with the request id, so concurrent workers
//! sharing the same directories never collide.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AnalysisError;

/// Input and output staging directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl StagingArea {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `<input_dir>/<request_id><suffix>`
    pub fn input_path(&self, request_id: Uuid, suffix: &str) -> PathBuf {
        self.input_dir.join(staged_name(request_id, suffix))
    }

    /// `<output_dir>/<request_id><suffix>`
    pub fn output_path(&self, request_id: Uuid, suffix: &str) -> PathBuf {
        self.output_dir.join(staged_name(request_id, suffix))
    }

    /// Creates both directories if they do not exist.
    pub async fn ensure_dirs(&self) -> Result<(), AnalysisError> {
        fs::create_dir_all(&self.input_dir).await?;
        fs::create_dir_all(&self.output_dir).await?;
        Ok(())
    }

    /// Deletes staged files. Every removal is attempted; the first failure
    /// is reported.
    pub async fn remove(&self, paths: &[&Path]) -> Result<(), AnalysisError> {
        let mut first_error = None;
        for path in paths {
            match fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "Removed staged file"),
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "Failed to remove staged file");
                    first_error.get_or_insert(AnalysisError::StagingCleanup {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// File name for a staged file: the request id followed by `suffix`.
pub fn staged_name(request_id: Uuid, suffix: &str) -> String {
    format!("{}{}", request_id, suffix)
}
