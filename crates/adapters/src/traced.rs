// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Traced adapter wrappers for consistent observability

use crate::cluster::{ClusterState, ClusterStateError, NodeHeartbeat};
use crate::container::{
    Container, ContainerError, ContainerHandle, ContainerLauncher, ProcessMetrics,
};
use crate::localizer::{BlobChangeCallback, Localizer, LocalizerError, PendingDownload};
use async_trait::async_trait;
use slotd_core::{LocalAssignment, Port, ProfileRequest, TopoProfileAction, WorkerHeartbeat, WorkerId};
use slotd_storage::LocalState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Wrapper that adds tracing to any Localizer
#[derive(Clone)]
pub struct TracedLocalizer<L> {
    inner: L,
}

impl<L> TracedLocalizer<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: Localizer> Localizer for TracedLocalizer<L> {
    async fn request_download_topology_blobs(
        &self,
        assignment: &LocalAssignment,
        port: Port,
        callback: BlobChangeCallback,
    ) -> Result<PendingDownload, LocalizerError> {
        let span = tracing::info_span!(
            "localizer.request_download",
            topology_id = %assignment.topology_id,
            port
        );
        async {
            let start = Instant::now();
            let result = self
                .inner
                .request_download_topology_blobs(assignment, port, callback)
                .await;
            match &result {
                Ok(pending) => tracing::info!(
                    elapsed_ms = elapsed_ms(start),
                    ?pending,
                    "download requested"
                ),
                Err(e) => tracing::error!(
                    elapsed_ms = elapsed_ms(start),
                    error = %e,
                    "download request failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn release_slot_for(
        &self,
        assignment: &LocalAssignment,
        port: Port,
    ) -> Result<(), LocalizerError> {
        let span = tracing::info_span!(
            "localizer.release",
            topology_id = %assignment.topology_id,
            port
        );
        async {
            let result = self.inner.release_slot_for(assignment, port).await;
            match &result {
                Ok(()) => tracing::info!("released"),
                Err(e) => tracing::error!(error = %e, "release failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn recover_running_topology(
        &self,
        assignment: &LocalAssignment,
        port: Port,
        callback: BlobChangeCallback,
    ) -> Result<(), LocalizerError> {
        let span = tracing::info_span!(
            "localizer.recover",
            topology_id = %assignment.topology_id,
            port
        );
        async {
            let result = self
                .inner
                .recover_running_topology(assignment, port, callback)
                .await;
            match &result {
                Ok(()) => tracing::info!("references recovered"),
                Err(e) => tracing::error!(error = %e, "recovery failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn update_blobs(&self) -> Result<(), LocalizerError> {
        let start = Instant::now();
        let result = self.inner.update_blobs().await;
        match &result {
            Ok(()) => tracing::debug!(elapsed_ms = elapsed_ms(start), "blob update check"),
            Err(e) => tracing::warn!(error = %e, "blob update check failed"),
        }
        result
    }

    async fn cleanup_unused(&self) -> Result<usize, LocalizerError> {
        let result = self.inner.cleanup_unused().await;
        match &result {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "unused blobs cleaned up"),
            Err(e) => tracing::warn!(error = %e, "blob clean up failed"),
        }
        result
    }
}

/// Wrapper that adds tracing to any ContainerLauncher.
///
/// Containers it hands out are wrapped in [`TracedContainer`].
#[derive(Clone)]
pub struct TracedContainerLauncher<C> {
    inner: C,
}

impl<C> TracedContainerLauncher<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: ContainerLauncher> ContainerLauncher for TracedContainerLauncher<C> {
    async fn launch_container(
        &self,
        port: Port,
        assignment: &LocalAssignment,
        local_state: &LocalState,
    ) -> Result<ContainerHandle, ContainerError> {
        let span = tracing::info_span!(
            "container.launch",
            topology_id = %assignment.topology_id,
            port
        );
        async {
            let start = Instant::now();
            let result = self
                .inner
                .launch_container(port, assignment, local_state)
                .await;
            match result {
                Ok(container) => {
                    tracing::info!(
                        worker_id = %container.worker_id(),
                        elapsed_ms = elapsed_ms(start),
                        "worker launched"
                    );
                    Ok(TracedContainer::wrap(container))
                }
                Err(e) => {
                    tracing::error!(elapsed_ms = elapsed_ms(start), error = %e, "launch failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn recover_container(
        &self,
        port: Port,
        assignment: &LocalAssignment,
        local_state: &LocalState,
    ) -> Result<ContainerHandle, ContainerError> {
        let span = tracing::info_span!(
            "container.recover",
            topology_id = %assignment.topology_id,
            port
        );
        async {
            match self
                .inner
                .recover_container(port, assignment, local_state)
                .await
            {
                Ok(container) => {
                    tracing::info!(worker_id = %container.worker_id(), "worker re-attached");
                    Ok(TracedContainer::wrap(container))
                }
                // Expected after a clean shutdown or reboot
                Err(e) => {
                    tracing::warn!(error = %e, "worker not recoverable");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Wrapper that adds tracing to a container
#[derive(Debug)]
pub struct TracedContainer {
    inner: ContainerHandle,
}

impl TracedContainer {
    pub fn wrap(inner: ContainerHandle) -> ContainerHandle {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl Container for TracedContainer {
    fn worker_id(&self) -> &WorkerId {
        self.inner.worker_id()
    }

    fn port(&self) -> Port {
        self.inner.port()
    }

    async fn kill(&self) -> Result<(), ContainerError> {
        let result = self.inner.kill().await;
        match &result {
            Ok(()) => tracing::info!(worker_id = %self.worker_id(), "kill requested"),
            Err(e) => tracing::warn!(worker_id = %self.worker_id(), error = %e, "kill failed"),
        }
        result
    }

    async fn force_kill(&self) -> Result<(), ContainerError> {
        let result = self.inner.force_kill().await;
        match &result {
            Ok(()) => tracing::warn!(worker_id = %self.worker_id(), "force killed"),
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id(), error = %e, "force kill failed")
            }
        }
        result
    }

    async fn are_all_processes_dead(&self) -> Result<bool, ContainerError> {
        let result = self.inner.are_all_processes_dead().await;
        tracing::trace!(worker_id = %self.worker_id(), dead = ?result.as_ref().ok(), "checked");
        result
    }

    async fn did_main_process_exit(&self) -> Result<bool, ContainerError> {
        self.inner.did_main_process_exit().await
    }

    async fn is_memory_limit_violated(
        &self,
        assignment: &LocalAssignment,
    ) -> Result<bool, ContainerError> {
        self.inner.is_memory_limit_violated(assignment).await
    }

    async fn read_heartbeat(&self) -> Result<Option<WorkerHeartbeat>, ContainerError> {
        let result = self.inner.read_heartbeat().await;
        tracing::trace!(
            worker_id = %self.worker_id(),
            heartbeat_secs = ?result.as_ref().ok().and_then(|hb| hb.as_ref().map(|hb| hb.time_secs)),
            "heartbeat read"
        );
        result
    }

    async fn clean_up_for_restart(&self) -> Result<(), ContainerError> {
        let result = self.inner.clean_up_for_restart().await;
        if let Err(e) = &result {
            tracing::error!(worker_id = %self.worker_id(), error = %e, "restart clean up failed");
        }
        result
    }

    async fn relaunch(&self) -> Result<(), ContainerError> {
        let start = Instant::now();
        let result = self.inner.relaunch().await;
        match &result {
            Ok(()) => tracing::info!(
                worker_id = %self.worker_id(),
                elapsed_ms = elapsed_ms(start),
                "worker relaunched"
            ),
            Err(e) => tracing::error!(worker_id = %self.worker_id(), error = %e, "relaunch failed"),
        }
        result
    }

    async fn clean_up(&self) -> Result<(), ContainerError> {
        let result = self.inner.clean_up().await;
        match &result {
            Ok(()) => tracing::info!(worker_id = %self.worker_id(), "cleaned up"),
            Err(e) => tracing::error!(worker_id = %self.worker_id(), error = %e, "clean up failed"),
        }
        result
    }

    async fn run_profiling(&self, request: &ProfileRequest, stop: bool) -> bool {
        let ok = self.inner.run_profiling(request, stop).await;
        tracing::info!(
            worker_id = %self.worker_id(),
            action = %request.action,
            stop,
            ok,
            "profiling"
        );
        ok
    }

    async fn process_metrics(&self) -> Option<ProcessMetrics> {
        self.inner.process_metrics().await
    }
}

/// Wrapper that adds tracing to any ClusterState
#[derive(Clone)]
pub struct TracedClusterState<S> {
    inner: S,
}

impl<S> TracedClusterState<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: ClusterState> ClusterState for TracedClusterState<S> {
    async fn assignments_for(
        &self,
        node_id: &str,
    ) -> Result<BTreeMap<Port, LocalAssignment>, ClusterStateError> {
        let result = self.inner.assignments_for(node_id).await;
        match &result {
            Ok(assignments) => tracing::debug!(node_id, count = assignments.len(), "assignments read"),
            Err(e) => tracing::warn!(node_id, error = %e, "reading assignments failed"),
        }
        result
    }

    async fn profile_requests_for(
        &self,
        host: &str,
    ) -> Result<Vec<TopoProfileAction>, ClusterStateError> {
        let result = self.inner.profile_requests_for(host).await;
        if let Err(e) = &result {
            tracing::warn!(host, error = %e, "reading profile requests failed");
        }
        result
    }

    async fn delete_profile_request(
        &self,
        action: &TopoProfileAction,
    ) -> Result<(), ClusterStateError> {
        let result = self.inner.delete_profile_request(action).await;
        match &result {
            Ok(()) => tracing::info!(%action, "profile request done"),
            Err(e) => tracing::warn!(%action, error = %e, "deleting profile request failed"),
        }
        result
    }

    async fn heartbeat_node(&self, heartbeat: &NodeHeartbeat) -> Result<(), ClusterStateError> {
        let result = self.inner.heartbeat_node(heartbeat).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "node heartbeat failed");
        }
        result
    }
}

#[cfg(test)]
#[path = "traced_tests.rs"]
mod tests;
