// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Disk-backed localizer
//!
//! Blobs for a topology live under `<root>/<topology_id>/`, each next to a
//! `<file>.version` sidecar holding the version that was downloaded. Files
//! are written to a temporary name and renamed into place, so a worker
//! never sees a half-written blob.

use super::{
    BlobChangeAck, BlobChangeCallback, BlobChanging, BlobSource, ChangeLatch, DownloadResolver,
    Localizer, LocalizerError, PendingDownload,
};
use async_trait::async_trait;
use slotd_core::{BlobKey, LocalAssignment, Port, TopologyId};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

struct Reference {
    assignment: LocalAssignment,
    callback: BlobChangeCallback,
}

#[derive(Default)]
struct TopologyBlobs {
    references: BTreeMap<Port, Reference>,
    /// Latest download or update; shared by every requester
    download: Option<PendingDownload>,
    updating: bool,
    /// Set while clean up removes the directory; downloads start after it
    deleting: Option<PendingDownload>,
}

/// Localizer that caches blobs from a [`BlobSource`] on local disk
#[derive(Clone)]
pub struct DiskLocalizer<S> {
    source: S,
    root: PathBuf,
    topologies: Arc<Mutex<HashMap<TopologyId, TopologyBlobs>>>,
}

impl<S: BlobSource> DiskLocalizer<S> {
    pub fn new(source: S, root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            root: root.into(),
            topologies: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Directory holding a topology's blobs
    pub fn topology_dir(&self, topology_id: &TopologyId) -> PathBuf {
        self.root.join(&topology_id.0)
    }

    /// Ports currently referencing a topology
    pub fn references(&self, topology_id: &TopologyId) -> Vec<Port> {
        let topologies = self.topologies.lock().unwrap_or_else(|e| e.into_inner());
        topologies
            .get(topology_id)
            .map(|t| t.references.keys().copied().collect())
            .unwrap_or_default()
    }

    fn start_download(
        &self,
        topology_id: &TopologyId,
        keys: Vec<BlobKey>,
        after: Option<PendingDownload>,
    ) -> PendingDownload {
        let (resolver, pending) = PendingDownload::new();
        let source = self.source.clone();
        let dir = self.topology_dir(topology_id);
        let topology_id = topology_id.clone();
        tokio::spawn(async move {
            if let Some(deletion) = after {
                tracing::debug!(%topology_id, "download waits for clean up");
                let _ = deletion.wait().await;
            }
            let result = download_all(&source, &dir, &keys).await;
            match &result {
                Ok(()) => tracing::info!(%topology_id, blobs = keys.len(), "blobs localized"),
                Err(e) => tracing::warn!(%topology_id, error = %e, "blob download failed"),
            }
            resolver.resolve(result);
        });
        pending
    }

    fn start_update(&self, topology_id: &TopologyId, changed: Vec<BlobKey>) {
        let mut topologies = self.topologies.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = topologies.get_mut(topology_id) else {
            return;
        };
        if entry.updating || entry.references.is_empty() {
            return;
        }

        let (resolver, update) = PendingDownload::new();
        let latch = ChangeLatch::new(entry.references.len() * changed.len(), update.clone());
        let notices: Vec<(BlobChangeCallback, BlobChanging)> = entry
            .references
            .values()
            .flat_map(|reference| {
                changed.iter().map(|blob| {
                    (
                        reference.callback.clone(),
                        BlobChanging {
                            assignment: reference.assignment.clone(),
                            blob: blob.clone(),
                            ack: BlobChangeAck::new(Arc::clone(&latch)),
                        },
                    )
                })
            })
            .collect();
        entry.updating = true;
        entry.download = Some(update);
        drop(topologies);

        tracing::info!(%topology_id, blobs = changed.len(), notices = notices.len(), "blob update pending");

        let source = self.source.clone();
        let dir = self.topology_dir(topology_id);
        let topology_id = topology_id.clone();
        let topologies = Arc::clone(&self.topologies);
        tokio::spawn(async move {
            for (callback, notice) in notices {
                callback.notify(notice).await;
            }
            latch.wait_all_acknowledged().await;
            let result = download_all(&source, &dir, &changed).await;
            match &result {
                Ok(()) => tracing::info!(%topology_id, "blobs updated"),
                Err(e) => tracing::warn!(%topology_id, error = %e, "blob update failed"),
            }
            if let Some(entry) = topologies
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_mut(&topology_id)
            {
                entry.updating = false;
                if result.is_err() {
                    // Next request starts a fresh download
                    entry.download = None;
                }
            }
            resolver.resolve(result);
        });
    }
}

#[async_trait]
impl<S: BlobSource> Localizer for DiskLocalizer<S> {
    async fn request_download_topology_blobs(
        &self,
        assignment: &LocalAssignment,
        port: Port,
        callback: BlobChangeCallback,
    ) -> Result<PendingDownload, LocalizerError> {
        let topology_id = &assignment.topology_id;
        let mut topologies = self.topologies.lock().unwrap_or_else(|e| e.into_inner());
        let entry = topologies.entry(topology_id.clone()).or_default();
        entry.references.insert(
            port,
            Reference {
                assignment: assignment.clone(),
                callback,
            },
        );

        // A failed download is retried; anything else is shared
        if let Some(download) = &entry.download {
            if !matches!(download.result(), Some(Err(_))) {
                return Ok(download.clone());
            }
        }

        let after = entry.deleting.clone();
        let download = self.start_download(topology_id, BlobKey::all_for(topology_id), after);
        entry.download = Some(download.clone());
        Ok(download)
    }

    async fn release_slot_for(
        &self,
        assignment: &LocalAssignment,
        port: Port,
    ) -> Result<(), LocalizerError> {
        let mut topologies = self.topologies.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = topologies.get_mut(&assignment.topology_id) {
            if entry.references.remove(&port).is_some() {
                tracing::debug!(
                    topology_id = %assignment.topology_id,
                    port,
                    remaining = entry.references.len(),
                    "released blob references"
                );
            }
        }
        Ok(())
    }

    async fn recover_running_topology(
        &self,
        assignment: &LocalAssignment,
        port: Port,
        callback: BlobChangeCallback,
    ) -> Result<(), LocalizerError> {
        let dir = self.topology_dir(&assignment.topology_id);
        for key in BlobKey::all_for(&assignment.topology_id) {
            if !tokio::fs::try_exists(dir.join(key.kind.file_name())).await? {
                return Err(LocalizerError::KeyNotFound(key.to_string()));
            }
        }

        let mut topologies = self.topologies.lock().unwrap_or_else(|e| e.into_inner());
        let entry = topologies.entry(assignment.topology_id.clone()).or_default();
        if entry.deleting.is_some() {
            return Err(LocalizerError::Other(format!(
                "blobs for {} are being removed",
                assignment.topology_id
            )));
        }
        entry.references.insert(
            port,
            Reference {
                assignment: assignment.clone(),
                callback,
            },
        );
        if entry.download.is_none() {
            entry.download = Some(PendingDownload::ready(Ok(())));
        }
        Ok(())
    }

    /// Compare every referenced topology against the source and start an
    /// update for blobs whose remote version moved.
    ///
    /// Each referencing slot is sent one notice per changed blob. The new
    /// version is only written once all of them were acknowledged.
    async fn update_blobs(&self) -> Result<(), LocalizerError> {
        let candidates: Vec<TopologyId> = {
            let topologies = self.topologies.lock().unwrap_or_else(|e| e.into_inner());
            topologies
                .iter()
                .filter(|(_, t)| {
                    !t.updating
                        && !t.references.is_empty()
                        && matches!(t.download.as_ref().and_then(|d| d.result()), Some(Ok(())))
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for topology_id in candidates {
            let dir = self.topology_dir(&topology_id);
            let mut changed = Vec::new();
            for key in BlobKey::all_for(&topology_id) {
                let remote = self.source.version(&key).await?;
                if read_version(&dir, &key).await != Some(remote) {
                    changed.push(key);
                }
            }
            if changed.is_empty() {
                continue;
            }
            self.start_update(&topology_id, changed);
        }
        Ok(())
    }

    /// Delete the blobs of topologies no slot references. Returns how many
    /// topologies were removed.
    ///
    /// A request arriving while a directory is being removed gets a fresh
    /// download that starts once the removal is done.
    async fn cleanup_unused(&self) -> Result<usize, LocalizerError> {
        let unused: Vec<(TopologyId, DownloadResolver)> = {
            let mut topologies = self.topologies.lock().unwrap_or_else(|e| e.into_inner());
            topologies
                .iter_mut()
                .filter(|(_, t)| {
                    t.references.is_empty()
                        && !t.updating
                        && t.deleting.is_none()
                        && t.download.as_ref().map_or(true, |d| d.is_finished())
                })
                .map(|(id, t)| {
                    let (resolver, deleting) = PendingDownload::new();
                    t.deleting = Some(deleting);
                    t.download = None;
                    (id.clone(), resolver)
                })
                .collect()
        };

        let removed = unused.len();
        let mut failure = None;
        for (topology_id, resolver) in unused {
            let dir = self.topology_dir(&topology_id);
            let result = match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    tracing::info!(%topology_id, "removed unused blobs");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(LocalizerError::from(e)),
            };

            {
                let mut topologies = self.topologies.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = topologies.get_mut(&topology_id) {
                    entry.deleting = None;
                    if entry.references.is_empty() && entry.download.is_none() {
                        topologies.remove(&topology_id);
                    }
                }
            }

            if let Err(e) = &result {
                failure.get_or_insert_with(|| e.clone());
            }
            resolver.resolve(result);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}

fn version_path(dir: &Path, key: &BlobKey) -> PathBuf {
    dir.join(format!("{}.version", key.kind.file_name()))
}

async fn read_version(dir: &Path, key: &BlobKey) -> Option<u64> {
    let text = tokio::fs::read_to_string(version_path(dir, key)).await.ok()?;
    text.trim().parse().ok()
}

async fn download_all<S: BlobSource>(
    source: &S,
    dir: &Path,
    keys: &[BlobKey],
) -> Result<(), LocalizerError> {
    tokio::fs::create_dir_all(dir).await?;
    for key in keys {
        let remote = source.version(key).await?;
        let target = dir.join(key.kind.file_name());
        if read_version(dir, key).await == Some(remote) && tokio::fs::try_exists(&target).await? {
            continue;
        }

        let tmp = dir.join(format!(".{}.tmp", key.kind.file_name()));
        let version = source.fetch(key, &tmp).await?;
        tokio::fs::rename(&tmp, &target).await?;

        let version_tmp = dir.join(format!(".{}.version.tmp", key.kind.file_name()));
        tokio::fs::write(&version_tmp, version.to_string()).await?;
        tokio::fs::rename(&version_tmp, version_path(dir, key)).await?;
        tracing::debug!(blob = %key, version, "blob written");
    }
    Ok(())
}

#[cfg(test)]
#[path = "disk_tests.rs"]
mod tests;
