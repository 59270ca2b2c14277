// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote blob sources

use super::LocalizerError;
use async_trait::async_trait;
use slotd_core::BlobKey;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Where blobs are downloaded from
#[async_trait]
pub trait BlobSource: Clone + Send + Sync + 'static {
    /// Version currently advertised for `key`
    async fn version(&self, key: &BlobKey) -> Result<u64, LocalizerError>;

    /// Copy the blob to `dest`, returning the version written
    async fn fetch(&self, key: &BlobKey, dest: &Path) -> Result<u64, LocalizerError>;
}

/// Blob source backed by a shared directory laid out as
/// `<root>/<topology_id>/<blob file>`.
///
/// A blob's version is its modification time in milliseconds.
#[derive(Clone)]
pub struct DirBlobSource {
    root: PathBuf,
}

impl DirBlobSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.root
            .join(&key.topology_id.0)
            .join(key.kind.file_name())
    }
}

fn map_io(key: &BlobKey, e: std::io::Error) -> LocalizerError {
    match e.kind() {
        ErrorKind::NotFound => LocalizerError::KeyNotFound(key.to_string()),
        ErrorKind::PermissionDenied => LocalizerError::Unauthorized(key.to_string()),
        _ => LocalizerError::Io(format!("{}: {}", key, e)),
    }
}

#[async_trait]
impl BlobSource for DirBlobSource {
    async fn version(&self, key: &BlobKey) -> Result<u64, LocalizerError> {
        let meta = tokio::fs::metadata(self.path_for(key))
            .await
            .map_err(|e| map_io(key, e))?;
        let modified = meta.modified().map_err(|e| map_io(key, e))?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0))
    }

    async fn fetch(&self, key: &BlobKey, dest: &Path) -> Result<u64, LocalizerError> {
        let version = self.version(key).await?;
        tokio::fs::copy(self.path_for(key), dest)
            .await
            .map_err(|e| map_io(key, e))?;
        Ok(version)
    }
}
