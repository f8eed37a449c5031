//! Remote file protocol handlers.
//!
//! Handlers move files between a remote location (named by URL) and local
//! staging storage. They are selected by URL scheme through a
//! [`RemoteFileRegistry`], so adding a new transport means registering one
//! more handler; callers never change.
//!
//! Both `fetch` and `store` must leave no partially written destination file
//! behind when they fail.

mod file_protocol;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::TransferError;

pub use file_protocol::FileProtocolHandler;

/// A transport for one URL scheme.
#[async_trait]
pub trait RemoteFileHandler: Send + Sync {
    /// The URL scheme this handler serves (e.g. `"file"`).
    fn scheme(&self) -> &'static str;

    /// Copies the remote file into `local_path`.
    async fn fetch(&self, remote_url: &Url, local_path: &Path) -> Result<(), TransferError>;

    /// Copies `local_path` to the remote location.
    async fn store(&self, local_path: &Path, remote_url: &Url) -> Result<(), TransferError>;

    /// Returns the location of the directory that contains `remote_url`.
    fn locate_containing_directory(&self, remote_url: &Url) -> Result<Url, TransferError>;

    /// Returns the local path behind `remote_url` when remote and local
    /// storage share a filesystem.
    fn local_path(&self, _remote_url: &Url) -> Option<PathBuf> {
        None
    }
}

/// Scheme-keyed set of remote file handlers.
#[derive(Clone)]
pub struct RemoteFileRegistry {
    handlers: HashMap<&'static str, Arc<dyn RemoteFileHandler>>,
}

impl RemoteFileRegistry {
    /// Creates a registry with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler, replacing any previous handler for its scheme.
    pub fn register(mut self, handler: Arc<dyn RemoteFileHandler>) -> Self {
        self.handlers.insert(handler.scheme(), handler);
        self
    }

    /// Returns the handler for the URL's scheme.
    pub fn resolve(&self, url: &Url) -> Result<Arc<dyn RemoteFileHandler>, TransferError> {
        self.handlers
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| TransferError::UnsupportedScheme(url.scheme().to_string()))
    }

    /// Returns the registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<_> = self.handlers.keys().copied().collect();
        schemes.sort_unstable();
        schemes
    }
}

impl Default for RemoteFileRegistry {
    /// The default registry serves the local filesystem (`file://`).
    fn default() -> Self {
        Self::empty().register(Arc::new(FileProtocolHandler::new()))
    }
}

impl std::fmt::Debug for RemoteFileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFileRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_serves_file_scheme() {
        let registry = RemoteFileRegistry::default();
        let url = Url::parse("file:///tmp/in/a.csv").expect("url");

        let handler = registry.resolve(&url).expect("file handler");
        assert_eq!(handler.scheme(), "file");
        assert_eq!(registry.schemes(), vec!["file"]);
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let registry = RemoteFileRegistry::default();
        let url = Url::parse("sftp://host/data/a.csv").expect("url");

        assert!(matches!(
            registry.resolve(&url),
            Err(TransferError::UnsupportedScheme(s)) if s == "sftp"
        ));
    }

    #[test]
    fn test_empty_registry() {
        let registry = RemoteFileRegistry::empty();
        let url = Url::parse("file:///tmp/a.csv").expect("url");
        assert!(registry.resolve(&url).is_err());
        assert!(registry.schemes().is_empty());
    }
}
