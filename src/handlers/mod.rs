//! Request handlers: one per analysis kind.
//!
//! A handler validates its arguments, stages remote inputs locally, drives
//! the engine through an ordered statement sequence, stores the produced
//! outputs next to the first remote input, and assembles the reply.
//!
//! Handlers implement the fallible [`RequestHandler::run`]; the provided
//! [`RequestHandler::handle`] turns every failure into an `ERROR` reply, so
//! nothing a handler does can escape as an error to the worker.

mod csv2netcdf;
mod emp_benchmark;
mod plots;
mod qc_plot;
mod staging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use crate::engine::Engine;
use crate::error::{AnalysisError, TransferError};
use crate::remote::{RemoteFileHandler, RemoteFileRegistry};
use crate::request::{AnalysisKind, AnalysisReply, AnalysisRequest};

pub use csv2netcdf::Csv2NetCdfHandler;
pub use emp_benchmark::EmpBenchmarkHandler;
pub use plots::PlotHandler;
pub use qc_plot::QcPlotHandler;
pub use staging::{staged_name, StagingArea};

/// Name of the variable holding every analysis function's return value.
pub(crate) const RESULT_VAR: &str = "result";

/// Handles one kind of analysis request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Runs the analysis.
    async fn run(
        &self,
        engine: &mut dyn Engine,
        request: &AnalysisRequest,
        kind: &AnalysisKind,
    ) -> Result<AnalysisReply, AnalysisError>;

    /// Runs the analysis and converts any failure into an `ERROR` reply.
    async fn handle(
        &self,
        engine: &mut dyn Engine,
        request: &AnalysisRequest,
        kind: &AnalysisKind,
    ) -> AnalysisReply {
        match self.run(engine, request, kind).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    request_id = %request.id(),
                    kind = %request.kind(),
                    error = %e,
                    "Analysis failed"
                );
                AnalysisReply::from_error(request, &e)
            }
        }
    }
}

/// Everything a handler needs besides the engine.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    staging: StagingArea,
    remotes: Arc<RemoteFileRegistry>,
    api_package: String,
}

impl HandlerContext {
    pub fn new(
        staging: StagingArea,
        remotes: Arc<RemoteFileRegistry>,
        api_package: impl Into<String>,
    ) -> Self {
        Self {
            staging,
            remotes,
            api_package: api_package.into(),
        }
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn api_package(&self) -> &str {
        &self.api_package
    }

    /// Returns the protocol handler for a remote location.
    pub fn resolve(&self, url: &Url) -> Result<Arc<dyn RemoteFileHandler>, AnalysisError> {
        Ok(self.remotes.resolve(url)?)
    }

    /// Fetches a remote input into local staging.
    pub async fn fetch_input(
        &self,
        remote: &dyn RemoteFileHandler,
        url: &Url,
        local_path: &Path,
    ) -> Result<(), AnalysisError> {
        self.staging.ensure_dirs().await?;
        remote.fetch(url, local_path).await?;
        debug!(url = %url, path = %local_path.display(), "Staged input");
        Ok(())
    }

    /// Stores a staged output next to `input_url` under `file_name` and
    /// returns its remote location.
    pub async fn store_output(
        &self,
        remote: &dyn RemoteFileHandler,
        input_url: &Url,
        local_path: &Path,
        file_name: &str,
    ) -> Result<Url, AnalysisError> {
        let directory = remote.locate_containing_directory(input_url)?;
        let target = directory
            .join(file_name)
            .map_err(|_| TransferError::InvalidLocation(format!("{}{}", directory, file_name)))?;
        remote.store(local_path, &target).await?;
        debug!(path = %local_path.display(), url = %target, "Stored output");
        Ok(target)
    }

    /// Deletes staged files once they are no longer needed.
    ///
    /// A staged file that is itself one of the `stored` locations (an input
    /// living inside a staging directory) is the delivered result and is
    /// kept.
    pub async fn cleanup(
        &self,
        remote: &dyn RemoteFileHandler,
        staged: &[&Path],
        stored: &[&Url],
    ) -> Result<(), AnalysisError> {
        let kept: Vec<PathBuf> = stored
            .iter()
            .filter_map(|url| remote.local_path(url))
            .collect();
        let removable: Vec<&Path> = staged
            .iter()
            .copied()
            .filter(|path| !kept.iter().any(|kept| kept.as_path() == *path))
            .collect();
        self.staging.remove(&removable).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Fixture;
    use super::*;

    #[tokio::test]
    async fn test_store_output_lands_next_to_input() {
        let fixture = Fixture::new();
        let input_url = fixture.remote_file("site.csv", "a,b");
        let local = fixture.temp.path().join("produced.nc");
        std::fs::write(&local, "nc").expect("write");

        let remote = fixture.context.resolve(&input_url).expect("file handler");
        let url = fixture
            .context
            .store_output(remote.as_ref(), &input_url, &local, "abc.flux.nc")
            .await
            .expect("store");

        assert_eq!(url.to_file_path().expect("path"), fixture.remote_dir().join("abc.flux.nc"));
        assert!(fixture.remote_dir().join("abc.flux.nc").exists());
    }

    #[tokio::test]
    async fn test_resolve_unknown_scheme() {
        let fixture = Fixture::new();
        let url = Url::parse("gridftp://host/data/a.csv").expect("url");
        let err = fixture.context.resolve(&url).err().expect("unsupported");
        assert!(matches!(
            err,
            AnalysisError::Transfer(TransferError::UnsupportedScheme(_))
        ));
    }
}
