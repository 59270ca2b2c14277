// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake containers for testing
#![cfg_attr(coverage_nightly, coverage(off))]

use super::{Container, ContainerError, ContainerHandle, ContainerLauncher, ProcessMetrics};
use async_trait::async_trait;
use slotd_core::{LocalAssignment, Port, ProfileRequest, WorkerHeartbeat, WorkerId};
use slotd_storage::LocalState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Recorded container call
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerCall {
    Kill,
    ForceKill,
    CleanUpForRestart,
    Relaunch,
    CleanUp,
    RunProfiling { request: ProfileRequest, stop: bool },
}

#[derive(Debug)]
struct FakeContainerState {
    calls: Vec<ContainerCall>,
    alive: bool,
    /// Ignores graceful kill; only force kill works
    stubborn: bool,
    /// Survives even force kill
    unkillable: bool,
    main_exited: bool,
    memory_violated: bool,
    heartbeat: Option<WorkerHeartbeat>,
    profiling_succeeds: bool,
    rss_mb: Option<f64>,
}

/// In-memory worker whose health tests control directly
#[derive(Debug, Clone)]
pub struct FakeContainer {
    port: Port,
    worker_id: WorkerId,
    state: Arc<Mutex<FakeContainerState>>,
}

impl FakeContainer {
    pub fn new(port: Port, worker_id: impl Into<String>) -> Self {
        Self {
            port,
            worker_id: WorkerId(worker_id.into()),
            state: Arc::new(Mutex::new(FakeContainerState {
                calls: Vec::new(),
                alive: true,
                stubborn: false,
                unkillable: false,
                main_exited: false,
                memory_violated: false,
                heartbeat: None,
                profiling_succeeds: true,
                rss_mb: Some(256.0),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeContainerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get all recorded calls
    pub fn calls(&self) -> Vec<ContainerCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, call: &ContainerCall) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }

    pub fn profiling_calls(&self) -> Vec<(ProfileRequest, bool)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                ContainerCall::RunProfiling { request, stop } => Some((request.clone(), *stop)),
                _ => None,
            })
            .collect()
    }

    pub fn set_heartbeat(&self, heartbeat: Option<WorkerHeartbeat>) {
        self.state().heartbeat = heartbeat;
    }

    pub fn set_main_exited(&self, exited: bool) {
        self.state().main_exited = exited;
    }

    pub fn set_memory_violated(&self, violated: bool) {
        self.state().memory_violated = violated;
    }

    /// Graceful kill is ignored; force kill still works
    pub fn set_stubborn(&self, stubborn: bool) {
        self.state().stubborn = stubborn;
    }

    /// No kill works
    pub fn set_unkillable(&self, unkillable: bool) {
        self.state().unkillable = unkillable;
    }

    pub fn set_profiling_succeeds(&self, succeeds: bool) {
        self.state().profiling_succeeds = succeeds;
    }

    pub fn is_alive(&self) -> bool {
        self.state().alive
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn port(&self) -> Port {
        self.port
    }

    async fn kill(&self) -> Result<(), ContainerError> {
        let mut state = self.state();
        state.calls.push(ContainerCall::Kill);
        if !state.stubborn && !state.unkillable {
            state.alive = false;
        }
        Ok(())
    }

    async fn force_kill(&self) -> Result<(), ContainerError> {
        let mut state = self.state();
        state.calls.push(ContainerCall::ForceKill);
        if !state.unkillable {
            state.alive = false;
        }
        Ok(())
    }

    async fn are_all_processes_dead(&self) -> Result<bool, ContainerError> {
        Ok(!self.state().alive)
    }

    async fn did_main_process_exit(&self) -> Result<bool, ContainerError> {
        let state = self.state();
        Ok(state.main_exited || !state.alive)
    }

    async fn is_memory_limit_violated(
        &self,
        _assignment: &LocalAssignment,
    ) -> Result<bool, ContainerError> {
        Ok(self.state().memory_violated)
    }

    async fn read_heartbeat(&self) -> Result<Option<WorkerHeartbeat>, ContainerError> {
        Ok(self.state().heartbeat.clone())
    }

    async fn clean_up_for_restart(&self) -> Result<(), ContainerError> {
        let mut state = self.state();
        state.calls.push(ContainerCall::CleanUpForRestart);
        state.heartbeat = None;
        Ok(())
    }

    async fn relaunch(&self) -> Result<(), ContainerError> {
        let mut state = self.state();
        state.calls.push(ContainerCall::Relaunch);
        state.alive = true;
        state.main_exited = false;
        state.memory_violated = false;
        Ok(())
    }

    async fn clean_up(&self) -> Result<(), ContainerError> {
        self.state().calls.push(ContainerCall::CleanUp);
        Ok(())
    }

    async fn run_profiling(&self, request: &ProfileRequest, stop: bool) -> bool {
        let mut state = self.state();
        state.calls.push(ContainerCall::RunProfiling {
            request: request.clone(),
            stop,
        });
        state.profiling_succeeds
    }

    async fn process_metrics(&self) -> Option<ProcessMetrics> {
        let state = self.state();
        if !state.alive {
            return None;
        }
        state.rss_mb.map(|rss_mb| ProcessMetrics { rss_mb })
    }
}

#[derive(Default)]
struct FakeLauncherState {
    launched: Vec<(Port, LocalAssignment, FakeContainer)>,
    recoverable: HashMap<Port, FakeContainer>,
    recovered: Vec<Port>,
    fail_launches: usize,
    next_id: u64,
}

/// Launcher handing out [`FakeContainer`]s
#[derive(Clone, Default)]
pub struct FakeContainerLauncher {
    inner: Arc<Mutex<FakeLauncherState>>,
}

impl FakeContainerLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeLauncherState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Containers launched so far, oldest first
    pub fn launched(&self) -> Vec<(Port, LocalAssignment, FakeContainer)> {
        self.state().launched.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.state().launched.len()
    }

    /// Most recently launched container
    pub fn last(&self) -> Option<FakeContainer> {
        self.state().launched.last().map(|(_, _, c)| c.clone())
    }

    /// Fail the next `count` launches
    pub fn fail_launches(&self, count: usize) {
        self.state().fail_launches = count;
    }

    /// Make a live worker available to `recover_container` on `port`
    pub fn add_recoverable(&self, container: FakeContainer) {
        self.state().recoverable.insert(container.port(), container);
    }

    pub fn recovered(&self) -> Vec<Port> {
        self.state().recovered.clone()
    }
}

#[async_trait]
impl ContainerLauncher for FakeContainerLauncher {
    async fn launch_container(
        &self,
        port: Port,
        assignment: &LocalAssignment,
        local_state: &LocalState,
    ) -> Result<ContainerHandle, ContainerError> {
        let container = {
            let mut state = self.state();
            if state.fail_launches > 0 {
                state.fail_launches -= 1;
                return Err(ContainerError::LaunchFailed("injected failure".to_string()));
            }
            state.next_id += 1;
            let container = FakeContainer::new(port, format!("worker-{}", state.next_id));
            state
                .launched
                .push((port, assignment.clone(), container.clone()));
            container
        };
        local_state.register_worker(container.worker_id(), port)?;
        Ok(Arc::new(container))
    }

    async fn recover_container(
        &self,
        port: Port,
        _assignment: &LocalAssignment,
        _local_state: &LocalState,
    ) -> Result<ContainerHandle, ContainerError> {
        let mut state = self.state();
        state.recovered.push(port);
        match state.recoverable.get(&port) {
            Some(container) => Ok(Arc::new(container.clone())),
            None => Err(ContainerError::NotRecoverable(format!("port {}", port))),
        }
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
