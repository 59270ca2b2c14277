// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shareable completion handles for downloads and blob-change consensus

use super::LocalizerError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type Outcome = Option<Result<(), LocalizerError>>;

/// A download (or blob update) that completes in the background.
///
/// Clones observe the same completion, which is how concurrent requests for
/// one topology share a single download.
#[derive(Clone)]
pub struct PendingDownload {
    rx: watch::Receiver<Outcome>,
}

/// Completes the paired [`PendingDownload`]
pub struct DownloadResolver {
    tx: watch::Sender<Outcome>,
}

impl DownloadResolver {
    pub fn resolve(self, result: Result<(), LocalizerError>) {
        self.tx.send_replace(Some(result));
    }
}

impl PendingDownload {
    pub fn new() -> (DownloadResolver, PendingDownload) {
        let (tx, rx) = watch::channel(None);
        (DownloadResolver { tx }, PendingDownload { rx })
    }

    /// An already finished download
    pub fn ready(result: Result<(), LocalizerError>) -> PendingDownload {
        let (_tx, rx) = watch::channel(Some(result));
        PendingDownload { rx }
    }

    /// Result if finished; `None` while still running
    pub fn result(&self) -> Option<Result<(), LocalizerError>> {
        let current = self.rx.borrow().clone();
        match current {
            Some(result) => Some(result),
            None if self.rx.has_changed().is_err() => Some(Err(abandoned())),
            None => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.result().is_some()
    }

    /// Wait at most `timeout` for completion; `None` means still running
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), LocalizerError>> {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|outcome| outcome.is_some())).await;
        match waited {
            Ok(Ok(outcome)) => outcome.clone(),
            Ok(Err(_)) => Some(Err(abandoned())),
            Err(_) => None,
        }
    }

    /// Wait for completion however long it takes
    pub async fn wait(&self) -> Result<(), LocalizerError> {
        let mut rx = self.rx.clone();
        let waited = rx.wait_for(|outcome| outcome.is_some()).await;
        match waited {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(abandoned())),
            Err(_) => Err(abandoned()),
        }
    }
}

impl std::fmt::Debug for PendingDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.result() {
            None => f.write_str("PendingDownload(running)"),
            Some(Ok(())) => f.write_str("PendingDownload(done)"),
            Some(Err(e)) => write!(f, "PendingDownload(failed: {})", e),
        }
    }
}

fn abandoned() -> LocalizerError {
    LocalizerError::Other("download abandoned before completion".to_string())
}

/// Counts acknowledgements from every slot referencing a changing blob.
///
/// The localizer only replaces the blob once the count reaches zero.
pub struct ChangeLatch {
    remaining: watch::Sender<usize>,
    update: PendingDownload,
}

impl ChangeLatch {
    /// A latch expecting `count` acknowledgements; `update` completes once the new version is in place
    pub fn new(count: usize, update: PendingDownload) -> Arc<ChangeLatch> {
        let (remaining, _) = watch::channel(count);
        Arc::new(ChangeLatch { remaining, update })
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Resolves once every holder acknowledged
    pub async fn wait_all_acknowledged(&self) {
        let mut rx = self.remaining.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn count_down(&self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// One slot's share of a [`ChangeLatch`].
///
/// Clones share an acknowledged flag, so the latch is counted down at most
/// once per notice no matter how many copies of the state carried it.
#[derive(Clone)]
pub struct BlobChangeAck {
    acked: Arc<AtomicBool>,
    latch: Arc<ChangeLatch>,
}

impl BlobChangeAck {
    pub fn new(latch: Arc<ChangeLatch>) -> Self {
        Self {
            acked: Arc::new(AtomicBool::new(false)),
            latch,
        }
    }

    /// Allow the blob to change; returns the update's completion
    pub fn acknowledge(&self) -> PendingDownload {
        if !self.acked.swap(true, Ordering::SeqCst) {
            self.latch.count_down();
        }
        self.latch.update.clone()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for BlobChangeAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobChangeAck")
            .field("acked", &self.is_acknowledged())
            .field("remaining", &self.latch.remaining())
            .finish()
    }
}

#[cfg(test)]
#[path = "pending_tests.rs"]
mod tests;
