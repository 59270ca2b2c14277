// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker containers: one OS worker process bound to a slot

mod process;

pub use process::{ProcessContainer, ProcessLauncher, ProcessLauncherConfig};

#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{ContainerCall, FakeContainer, FakeContainerLauncher};

use async_trait::async_trait;
use slotd_core::{LocalAssignment, Port, ProfileRequest, WorkerHeartbeat, WorkerId};
use slotd_storage::{LocalState, WalError};
use std::sync::Arc;
use thiserror::Error;

/// Errors from container operations
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("no recoverable worker: {0}")]
    NotRecoverable(String),
    #[error("signal failed: {0}")]
    Signal(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("local state error: {0}")]
    Storage(#[from] WalError),
}

/// Resource sample for one worker
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessMetrics {
    pub rss_mb: f64,
}

/// A running (or recently running) worker process.
///
/// Query methods never block on the worker; `kill` only requests shutdown.
#[async_trait]
pub trait Container: Send + Sync + std::fmt::Debug {
    fn worker_id(&self) -> &WorkerId;

    fn port(&self) -> Port;

    /// Ask the worker to shut down gracefully
    async fn kill(&self) -> Result<(), ContainerError>;

    /// Terminate immediately; safe to repeat
    async fn force_kill(&self) -> Result<(), ContainerError>;

    async fn are_all_processes_dead(&self) -> Result<bool, ContainerError>;

    async fn did_main_process_exit(&self) -> Result<bool, ContainerError>;

    async fn is_memory_limit_violated(
        &self,
        assignment: &LocalAssignment,
    ) -> Result<bool, ContainerError>;

    async fn read_heartbeat(&self) -> Result<Option<WorkerHeartbeat>, ContainerError>;

    /// Prepare a dead worker to be started again with the same identity
    async fn clean_up_for_restart(&self) -> Result<(), ContainerError>;

    /// Start the worker again in place after [`Container::clean_up_for_restart`]
    async fn relaunch(&self) -> Result<(), ContainerError>;

    /// Release everything tied to this container once its processes are dead
    async fn clean_up(&self) -> Result<(), ContainerError>;

    /// Best effort; `false` means try again later
    async fn run_profiling(&self, request: &ProfileRequest, stop: bool) -> bool;

    /// Sample resource usage, if the worker is still around
    async fn process_metrics(&self) -> Option<ProcessMetrics>;
}

pub type ContainerHandle = Arc<dyn Container>;

/// Creates containers for slots
#[async_trait]
pub trait ContainerLauncher: Clone + Send + Sync + 'static {
    async fn launch_container(
        &self,
        port: Port,
        assignment: &LocalAssignment,
        local_state: &LocalState,
    ) -> Result<ContainerHandle, ContainerError>;

    /// Re-attach to a worker that outlived the previous agent
    async fn recover_container(
        &self,
        port: Port,
        assignment: &LocalAssignment,
        local_state: &LocalState,
    ) -> Result<ContainerHandle, ContainerError>;
}
