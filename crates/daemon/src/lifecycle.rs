// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle management: startup, recovery, shutdown.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use fs2::FileExt;
use slotd_adapters::{
    DirBlobSource, DirClusterState, DiskLocalizer, ProcessLauncher, TracedClusterState,
    TracedContainerLauncher, TracedLocalizer,
};
use slotd_core::{SystemClock, UuidIdGen};
use slotd_engine::{AgentError, CountingMetrics, NodeAgent, SlotDeps, SlotFailure};
use slotd_storage::{LocalState, WalError};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

/// Node agent with concrete adapter types (wrapped with tracing)
pub type DaemonAgent = NodeAgent<
    TracedLocalizer<DiskLocalizer<DirBlobSource>>,
    TracedContainerLauncher<ProcessLauncher<UuidIdGen>>,
    TracedClusterState<DirClusterState>,
    SystemClock,
>;

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Failed to acquire lock: daemon already running?")]
    LockFailed(#[source] std::io::Error),

    #[error("Local state error: {0}")]
    Wal(#[from] WalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Daemon state during operation
pub struct Daemon {
    pub agent: DaemonAgent,
    lock_path: PathBuf,
    // NOTE(lifetime): Held to maintain exclusive file lock; released on drop
    #[allow(dead_code)]
    lock_file: File,
}

impl Daemon {
    /// Wait for a slot to fail fatally
    pub async fn next_failure(&mut self) -> Option<SlotFailure> {
        self.agent.next_failure().await
    }

    /// Stop the agent, then give up the lock
    pub async fn shutdown(self) -> Result<(), LifecycleError> {
        info!("Shutting down daemon...");
        let result = self.agent.shutdown().await;

        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!("Failed to remove lock file: {}", e);
        }

        result?;
        info!("Daemon shutdown complete");
        Ok(())
    }
}

/// Start the daemon
pub async fn startup(config: &Config) -> Result<Daemon, LifecycleError> {
    std::fs::create_dir_all(&config.state_dir)?;

    // Acquire lock file FIRST, so a second daemon never touches the state
    let lock_path = config.lock_path();
    let mut lock_file = File::create(&lock_path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(LifecycleError::LockFailed)?;
    writeln!(lock_file, "{}", std::process::id())?;

    match start_agent(config).await {
        Ok(agent) => {
            info!(
                node_id = %config.node_id,
                ports = ?config.ports,
                "Daemon started"
            );
            Ok(Daemon {
                agent,
                lock_path,
                lock_file,
            })
        }
        Err(e) => {
            // Clean up the lock we took before failing
            let _ = std::fs::remove_file(&lock_path);
            Err(e)
        }
    }
}

/// Open persisted state, wire up the adapters and start the slots.
///
/// Workers left running by a previous daemon are re-attached here.
async fn start_agent(config: &Config) -> Result<DaemonAgent, LifecycleError> {
    std::fs::create_dir_all(config.blob_dir())?;
    std::fs::create_dir_all(config.workers_dir())?;

    let local_state = LocalState::open(&config.local_state_path())?;
    let persisted = local_state.assignments();
    info!(
        "Loaded local state: {} assignments, {} workers",
        persisted.len(),
        local_state.workers().len()
    );

    // Set up adapters (wrapped with tracing for observability)
    let localizer = TracedLocalizer::new(DiskLocalizer::new(
        DirBlobSource::new(config.blob_source_dir.clone()),
        config.blob_dir(),
    ));
    let launcher =
        TracedContainerLauncher::new(ProcessLauncher::new(config.launcher_config(), UuidIdGen));
    let cluster_state =
        TracedClusterState::new(DirClusterState::new(config.cluster_state_dir.clone()));

    let deps = SlotDeps {
        localizer,
        launcher,
        cluster_state,
        local_state,
        metrics: Arc::new(CountingMetrics::new()),
        clock: SystemClock,
    };
    Ok(NodeAgent::start(config.agent_config(), deps).await?)
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
