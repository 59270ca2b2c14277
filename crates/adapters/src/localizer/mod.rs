// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Blob localizer: downloads, versions and reference-counts topology blobs

mod disk;
mod pending;
mod source;

pub use disk::DiskLocalizer;
pub use pending::{BlobChangeAck, ChangeLatch, DownloadResolver, PendingDownload};
pub use source::{BlobSource, DirBlobSource};

#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeLocalizer, LocalizerCall};

use async_trait::async_trait;
use slotd_core::{BlobKey, LocalAssignment, Port};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from blob operations.
///
/// Cloneable so a single download outcome can be handed to every slot
/// waiting on it.
#[derive(Debug, Clone, Error)]
pub enum LocalizerError {
    #[error("not authorized to read blob: {0}")]
    Unauthorized(String),
    #[error("blob key not found: {0}")]
    KeyNotFound(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for LocalizerError {
    fn from(e: std::io::Error) -> Self {
        LocalizerError::Io(e.to_string())
    }
}

/// Notice that a blob referenced by `assignment` is about to change.
///
/// The holder must acknowledge through `ack` once nothing it runs still
/// uses the old version.
#[derive(Debug, Clone)]
pub struct BlobChanging {
    pub assignment: LocalAssignment,
    pub blob: BlobKey,
    pub ack: BlobChangeAck,
}

/// Delivers [`BlobChanging`] notices from localizer tasks to a slot's queue
#[derive(Clone)]
pub struct BlobChangeCallback {
    tx: mpsc::Sender<BlobChanging>,
}

impl BlobChangeCallback {
    /// A callback and the queue its notices land in
    pub fn channel(capacity: usize) -> (BlobChangeCallback, mpsc::Receiver<BlobChanging>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (BlobChangeCallback { tx }, rx)
    }

    /// Queue a notice, waiting for room if the queue is full.
    ///
    /// If the slot is gone the notice is acknowledged on its behalf so the
    /// change is not held up forever.
    pub async fn notify(&self, change: BlobChanging) {
        if let Err(mpsc::error::SendError(change)) = self.tx.send(change).await {
            tracing::debug!(blob = %change.blob, "slot gone, acknowledging blob change");
            change.ack.acknowledge();
        }
    }
}

impl std::fmt::Debug for BlobChangeCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlobChangeCallback")
    }
}

/// Manages the blobs that worker processes need on local disk
#[async_trait]
pub trait Localizer: Clone + Send + Sync + 'static {
    /// Ensure the topology's blobs are present at the current remote
    /// version, adding a reference for `port`.
    ///
    /// Concurrent requests for the same topology share one download.
    /// `callback` is told when a referenced blob is later updated remotely.
    async fn request_download_topology_blobs(
        &self,
        assignment: &LocalAssignment,
        port: Port,
        callback: BlobChangeCallback,
    ) -> Result<PendingDownload, LocalizerError>;

    /// Drop the references `port` holds for the assignment's blobs
    async fn release_slot_for(
        &self,
        assignment: &LocalAssignment,
        port: Port,
    ) -> Result<(), LocalizerError>;

    /// Re-establish references for a worker that survived an agent restart
    async fn recover_running_topology(
        &self,
        assignment: &LocalAssignment,
        port: Port,
        callback: BlobChangeCallback,
    ) -> Result<(), LocalizerError>;

    /// Check the remote store for newer blob versions and start updates
    async fn update_blobs(&self) -> Result<(), LocalizerError> {
        Ok(())
    }

    /// Delete blobs no slot references; returns how many topologies went
    async fn cleanup_unused(&self) -> Result<usize, LocalizerError> {
        Ok(0)
    }
}
