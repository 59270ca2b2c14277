// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake localizer for testing
#![cfg_attr(coverage_nightly, coverage(off))]

use super::{
    BlobChangeAck, BlobChangeCallback, BlobChanging, ChangeLatch, DownloadResolver, Localizer,
    LocalizerError, PendingDownload,
};
use async_trait::async_trait;
use slotd_core::{BlobKey, LocalAssignment, Port, TopologyId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Recorded localizer call
#[derive(Debug, Clone, PartialEq)]
pub enum LocalizerCall {
    RequestDownload { topology_id: TopologyId, port: Port },
    Release { topology_id: TopologyId, port: Port },
    Recover { topology_id: TopologyId, port: Port },
}

#[derive(Default)]
struct FakeLocalizerState {
    calls: Vec<LocalizerCall>,
    references: BTreeMap<(TopologyId, Port), (LocalAssignment, BlobChangeCallback)>,
    /// Results handed to the next requests, in order; empty means success
    scripted: VecDeque<Result<(), LocalizerError>>,
    hold: bool,
    held: Vec<DownloadResolver>,
    fail_recover: bool,
    update_checks: usize,
    cleanups: usize,
}

/// Fake localizer that completes downloads on demand
#[derive(Clone, Default)]
pub struct FakeLocalizer {
    inner: Arc<Mutex<FakeLocalizerState>>,
}

impl FakeLocalizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeLocalizerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get all recorded calls
    pub fn calls(&self) -> Vec<LocalizerCall> {
        self.state().calls.clone()
    }

    /// Calls releasing `topology_id` on `port`
    pub fn release_count(&self, topology_id: &str, port: Port) -> usize {
        let topology_id = TopologyId::from(topology_id);
        self.state()
            .calls
            .iter()
            .filter(|c| {
                matches!(c, LocalizerCall::Release { topology_id: t, port: p } if *t == topology_id && *p == port)
            })
            .count()
    }

    pub fn recover_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, LocalizerCall::Recover { .. }))
            .count()
    }

    /// Ports referencing `topology_id`
    pub fn references(&self, topology_id: &str) -> Vec<Port> {
        let topology_id = TopologyId::from(topology_id);
        self.state()
            .references
            .keys()
            .filter(|(t, _)| *t == topology_id)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Fail the next download with `error`
    pub fn fail_next_download(&self, error: LocalizerError) {
        self.state().scripted.push_back(Err(error));
    }

    /// Keep downloads running until [`FakeLocalizer::resolve_held`]
    pub fn hold_downloads(&self, hold: bool) {
        self.state().hold = hold;
    }

    /// Finish every held download with `result`
    pub fn resolve_held(&self, result: Result<(), LocalizerError>) {
        let held: Vec<DownloadResolver> = std::mem::take(&mut self.state().held);
        for resolver in held {
            resolver.resolve(result.clone());
        }
    }

    /// Times [`Localizer::update_blobs`] ran
    pub fn update_checks(&self) -> usize {
        self.state().update_checks
    }

    /// Times [`Localizer::cleanup_unused`] ran
    pub fn cleanups(&self) -> usize {
        self.state().cleanups
    }

    pub fn fail_recover(&self, fail: bool) {
        self.state().fail_recover = fail;
    }

    /// Announce that `blob` is about to change to every slot referencing its
    /// topology.
    ///
    /// The returned latch reaches zero once all of them acknowledged; the
    /// update then completes successfully.
    pub fn change_blob(&self, blob: BlobKey) -> Arc<ChangeLatch> {
        let targets: Vec<(LocalAssignment, BlobChangeCallback)> = self
            .state()
            .references
            .iter()
            .filter(|((t, _), _)| *t == blob.topology_id)
            .map(|(_, r)| r.clone())
            .collect();

        let (resolver, update) = PendingDownload::new();
        let latch = ChangeLatch::new(targets.len(), update);
        let notices: Vec<(BlobChangeCallback, BlobChanging)> = targets
            .into_iter()
            .map(|(assignment, callback)| {
                let notice = BlobChanging {
                    assignment,
                    blob: blob.clone(),
                    ack: BlobChangeAck::new(Arc::clone(&latch)),
                };
                (callback, notice)
            })
            .collect();

        let waiter = Arc::clone(&latch);
        tokio::spawn(async move {
            for (callback, notice) in notices {
                callback.notify(notice).await;
            }
            waiter.wait_all_acknowledged().await;
            resolver.resolve(Ok(()));
        });
        latch
    }
}

#[async_trait]
impl Localizer for FakeLocalizer {
    async fn request_download_topology_blobs(
        &self,
        assignment: &LocalAssignment,
        port: Port,
        callback: BlobChangeCallback,
    ) -> Result<PendingDownload, LocalizerError> {
        let mut state = self.state();
        state.calls.push(LocalizerCall::RequestDownload {
            topology_id: assignment.topology_id.clone(),
            port,
        });
        state.references.insert(
            (assignment.topology_id.clone(), port),
            (assignment.clone(), callback),
        );

        if let Some(result) = state.scripted.pop_front() {
            return Ok(PendingDownload::ready(result));
        }
        if state.hold {
            let (resolver, pending) = PendingDownload::new();
            state.held.push(resolver);
            return Ok(pending);
        }
        Ok(PendingDownload::ready(Ok(())))
    }

    async fn release_slot_for(
        &self,
        assignment: &LocalAssignment,
        port: Port,
    ) -> Result<(), LocalizerError> {
        let mut state = self.state();
        state.calls.push(LocalizerCall::Release {
            topology_id: assignment.topology_id.clone(),
            port,
        });
        state
            .references
            .remove(&(assignment.topology_id.clone(), port));
        Ok(())
    }

    async fn recover_running_topology(
        &self,
        assignment: &LocalAssignment,
        port: Port,
        callback: BlobChangeCallback,
    ) -> Result<(), LocalizerError> {
        let mut state = self.state();
        state.calls.push(LocalizerCall::Recover {
            topology_id: assignment.topology_id.clone(),
            port,
        });
        if state.fail_recover {
            return Err(LocalizerError::KeyNotFound(assignment.topology_id.0.clone()));
        }
        state.references.insert(
            (assignment.topology_id.clone(), port),
            (assignment.clone(), callback),
        );
        Ok(())
    }

    async fn update_blobs(&self) -> Result<(), LocalizerError> {
        self.state().update_checks += 1;
        Ok(())
    }

    async fn cleanup_unused(&self) -> Result<usize, LocalizerError> {
        self.state().cleanups += 1;
        Ok(0)
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
