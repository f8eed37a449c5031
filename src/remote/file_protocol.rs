//! Local filesystem (`file://`) protocol handler.
//!
//! Remote and local storage are the same filesystem here, so fetch and store
//! are plain copies. The host part of the URL (`file://host/path`) is
//! ignored. Copies go to a hidden sibling temp file first and are renamed
//! into place, so readers never observe a half-written destination.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::RemoteFileHandler;
use crate::error::TransferError;

/// Handler for `file://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProtocolHandler;

impl FileProtocolHandler {
    pub fn new() -> Self {
        Self
    }

    /// Converts a `file://` URL to a local path, discarding any host.
    fn url_to_path(url: &Url) -> Result<PathBuf, TransferError> {
        let mut local = url.clone();
        if local.host().is_some() {
            local
                .set_host(None)
                .map_err(|_| TransferError::InvalidLocation(url.to_string()))?;
        }
        local
            .to_file_path()
            .map_err(|_| TransferError::InvalidLocation(url.to_string()))
    }

    async fn copy_atomically(from: &Path, to: &Path) -> Result<(), TransferError> {
        let copy_failed = |source: std::io::Error| TransferError::CopyFailed {
            from: from.display().to_string(),
            to: to.display().to_string(),
            source,
        };

        let file_name = to
            .file_name()
            .ok_or_else(|| TransferError::InvalidLocation(to.display().to_string()))?;

        if let Some(parent) = to.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(copy_failed)?;
            }
        }

        let temp_path = to.with_file_name(format!(
            ".{}.part-{}",
            file_name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));

        if let Err(e) = fs::copy(from, &temp_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(copy_failed(e));
        }

        if let Err(e) = fs::rename(&temp_path, to).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(copy_failed(e));
        }

        debug!(from = %from.display(), to = %to.display(), "Copied file");
        Ok(())
    }
}

#[async_trait]
impl RemoteFileHandler for FileProtocolHandler {
    fn scheme(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, remote_url: &Url, local_path: &Path) -> Result<(), TransferError> {
        let remote_path = Self::url_to_path(remote_url)?;
        Self::copy_atomically(&remote_path, local_path).await
    }

    async fn store(&self, local_path: &Path, remote_url: &Url) -> Result<(), TransferError> {
        let remote_path = Self::url_to_path(remote_url)?;
        Self::copy_atomically(local_path, &remote_path).await
    }

    fn locate_containing_directory(&self, remote_url: &Url) -> Result<Url, TransferError> {
        remote_url
            .join("./")
            .map_err(|_| TransferError::InvalidLocation(remote_url.to_string()))
    }

    fn local_path(&self, remote_url: &Url) -> Option<PathBuf> {
        Self::url_to_path(remote_url).ok()
    }
}
