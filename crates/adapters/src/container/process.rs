// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Containers backed by local OS processes
//!
//! Each worker runs in its own process group so that signals reach every
//! process it forked. A worker gets a private directory under
//! `workers_dir/<worker_id>/` holding its pid file, log and heartbeat.
//!
//! Workers should replace `heartbeat.json` atomically (write a temp file in
//! the same directory, then rename). A heartbeat that does not parse is
//! assumed to be caught mid-write, and the last good one is reported.

use super::{Container, ContainerError, ContainerHandle, ContainerLauncher, ProcessMetrics};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use slotd_core::{
    IdGen, LocalAssignment, Port, ProfileAction, ProfileRequest, WorkerHeartbeat, WorkerId,
};
use slotd_storage::LocalState;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};

const PID_FILE: &str = "worker.pid";
const HEARTBEAT_FILE: &str = "heartbeat.json";
const LOG_FILE: &str = "worker.log";

/// How worker processes are started
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    pub host: String,
    pub workers_dir: PathBuf,
    /// Root of the localized blobs; a topology's blobs are in `<blob_dir>/<topology_id>`
    pub blob_dir: PathBuf,
    /// Worker argv. Supports `{topology_id}`, `{port}`, `{worker_id}`,
    /// `{worker_dir}` and `{blob_dir}` placeholders.
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Profiler argv. Supports `{pid}`, `{action}` and `{worker_dir}`.
    pub profiler_command: Option<Vec<String>>,
    pub enforce_memory_limit: bool,
}

/// Launches [`ProcessContainer`]s
#[derive(Clone)]
pub struct ProcessLauncher<I> {
    config: Arc<ProcessLauncherConfig>,
    ids: I,
}

impl<I: IdGen> ProcessLauncher<I> {
    pub fn new(config: ProcessLauncherConfig, ids: I) -> Self {
        Self {
            config: Arc::new(config),
            ids,
        }
    }
}

#[async_trait]
impl<I: IdGen> ContainerLauncher for ProcessLauncher<I> {
    async fn launch_container(
        &self,
        port: Port,
        assignment: &LocalAssignment,
        local_state: &LocalState,
    ) -> Result<ContainerHandle, ContainerError> {
        let worker_id = self.ids.next();
        let container = ProcessContainer::new(
            Arc::clone(&self.config),
            port,
            worker_id,
            assignment.clone(),
            local_state.clone(),
        );
        tokio::fs::create_dir_all(&container.worker_dir).await?;
        container.spawn().await?;
        local_state.register_worker(&container.worker_id, port)?;
        Ok(Arc::new(container))
    }

    async fn recover_container(
        &self,
        port: Port,
        assignment: &LocalAssignment,
        local_state: &LocalState,
    ) -> Result<ContainerHandle, ContainerError> {
        let worker_id = local_state.worker_for_port(port).ok_or_else(|| {
            ContainerError::NotRecoverable(format!("no worker registered for port {}", port))
        })?;
        let container = ProcessContainer::new(
            Arc::clone(&self.config),
            port,
            worker_id,
            assignment.clone(),
            local_state.clone(),
        );

        let pid = container.read_pid_file().await.ok_or_else(|| {
            ContainerError::NotRecoverable(format!("no pid file for {}", container.worker_id))
        })?;
        if !is_alive(pid) {
            return Err(ContainerError::NotRecoverable(format!(
                "worker {} (pid {}) is not running",
                container.worker_id, pid
            )));
        }
        container.set_pid(Some(pid));
        Ok(Arc::new(container))
    }
}

/// A worker process group
pub struct ProcessContainer {
    config: Arc<ProcessLauncherConfig>,
    port: Port,
    worker_id: WorkerId,
    assignment: LocalAssignment,
    worker_dir: PathBuf,
    local_state: LocalState,
    /// Present when this agent spawned the worker
    child: Mutex<Option<Child>>,
    pid: Mutex<Option<i32>>,
    /// Last heartbeat that parsed, reported while the file is mid-write
    last_heartbeat: Mutex<Option<WorkerHeartbeat>>,
}

impl std::fmt::Debug for ProcessContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContainer")
            .field("port", &self.port)
            .field("worker_id", &self.worker_id)
            .field("topology_id", &self.assignment.topology_id)
            .field("pid", &self.pid())
            .finish()
    }
}

impl ProcessContainer {
    fn new(
        config: Arc<ProcessLauncherConfig>,
        port: Port,
        worker_id: WorkerId,
        assignment: LocalAssignment,
        local_state: LocalState,
    ) -> Self {
        let worker_dir = config.workers_dir.join(&worker_id.0);
        Self {
            config,
            port,
            worker_id,
            assignment,
            worker_dir,
            local_state,
            child: Mutex::new(None),
            pid: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
        }
    }

    pub fn worker_dir(&self) -> &Path {
        &self.worker_dir
    }

    fn pid(&self) -> Option<i32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_pid(&self, pid: Option<i32>) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    fn topology_blob_dir(&self) -> PathBuf {
        self.config.blob_dir.join(&self.assignment.topology_id.0)
    }

    fn substitute(&self, arg: &str) -> String {
        arg.replace("{topology_id}", &self.assignment.topology_id.0)
            .replace("{port}", &self.port.to_string())
            .replace("{worker_id}", &self.worker_id.0)
            .replace("{worker_dir}", &self.worker_dir.display().to_string())
            .replace("{blob_dir}", &self.topology_blob_dir().display().to_string())
    }

    async fn spawn(&self) -> Result<(), ContainerError> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(ContainerError::LaunchFailed(
                "worker command is empty".to_string(),
            ));
        };

        let log = std::fs::File::create(self.worker_dir.join(LOG_FILE))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(self.substitute(program));
        cmd.args(args.iter().map(|a| self.substitute(a)))
            .current_dir(&self.worker_dir)
            .envs(self.config.env.iter().map(|(k, v)| (k, v)))
            .env("SLOTD_HOST", &self.config.host)
            .env("SLOTD_TOPOLOGY_ID", &self.assignment.topology_id.0)
            .env("SLOTD_PORT", self.port.to_string())
            .env("SLOTD_WORKER_ID", &self.worker_id.0)
            .env("SLOTD_WORKER_DIR", &self.worker_dir)
            .env("SLOTD_BLOB_DIR", self.topology_blob_dir())
            .env("SLOTD_HEARTBEAT_FILE", self.worker_dir.join(HEARTBEAT_FILE))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ContainerError::LaunchFailed(format!("{}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| ContainerError::LaunchFailed("worker exited at spawn".to_string()))?
            as i32;

        tokio::fs::write(self.worker_dir.join(PID_FILE), pid.to_string()).await?;
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        self.set_pid(Some(pid));
        tracing::info!(
            port = self.port,
            worker_id = %self.worker_id,
            pid,
            "worker process started"
        );
        Ok(())
    }

    async fn read_pid_file(&self) -> Option<i32> {
        let text = tokio::fs::read_to_string(self.worker_dir.join(PID_FILE))
            .await
            .ok()?;
        text.trim().parse().ok()
    }

    /// Reap our own child if it exited; returns true when it has
    fn reap(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => {
                tracing::debug!(worker_id = %self.worker_id, %status, "worker exited");
                true
            }
            Some(Ok(None)) => false,
            Some(Err(e)) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "wait failed");
                false
            }
            None => false,
        }
    }

    fn signal_group(&self, sig: Signal) -> Result<(), ContainerError> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        match signal::killpg(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ContainerError::Signal(format!("{} to {}: {}", sig, pid, e))),
        }
    }

    fn rss_mb(&self) -> Option<f64> {
        let pid = self.pid()?;
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
        parse_vm_rss_kb(&status).map(|kb| kb as f64 / 1024.0)
    }

    fn profiler_args(&self, request: &ProfileRequest, stop: bool) -> Option<Vec<String>> {
        let command = self.config.profiler_command.as_ref()?;
        let pid = self.pid()?.to_string();
        let action = if stop { "stop" } else { request.action.as_str() };
        Some(
            command
                .iter()
                .map(|a| {
                    a.replace("{pid}", &pid)
                        .replace("{action}", action)
                        .replace("{worker_dir}", &self.worker_dir.display().to_string())
                })
                .collect(),
        )
    }
}

fn is_alive(pid: i32) -> bool {
    !matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

fn group_alive(pid: i32) -> bool {
    !matches!(signal::killpg(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Resident set size in kB from the contents of `/proc/<pid>/status`
pub(crate) fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[async_trait]
impl Container for ProcessContainer {
    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn port(&self) -> Port {
        self.port
    }

    async fn kill(&self) -> Result<(), ContainerError> {
        tracing::info!(worker_id = %self.worker_id, "sending SIGTERM");
        self.signal_group(Signal::SIGTERM)
    }

    async fn force_kill(&self) -> Result<(), ContainerError> {
        tracing::info!(worker_id = %self.worker_id, "sending SIGKILL");
        self.signal_group(Signal::SIGKILL)
    }

    async fn are_all_processes_dead(&self) -> Result<bool, ContainerError> {
        self.reap();
        Ok(match self.pid() {
            Some(pid) => !group_alive(pid),
            None => true,
        })
    }

    async fn did_main_process_exit(&self) -> Result<bool, ContainerError> {
        if self.reap() {
            return Ok(true);
        }
        let has_child = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        if has_child {
            return Ok(false);
        }
        Ok(match self.pid() {
            Some(pid) => !is_alive(pid),
            None => true,
        })
    }

    async fn is_memory_limit_violated(
        &self,
        assignment: &LocalAssignment,
    ) -> Result<bool, ContainerError> {
        if !self.config.enforce_memory_limit {
            return Ok(false);
        }
        let (Some(limit), Some(used)) = (assignment.memory_limit_mb(), self.rss_mb()) else {
            return Ok(false);
        };
        if used > limit {
            tracing::warn!(
                worker_id = %self.worker_id,
                used_mb = used,
                limit_mb = limit,
                "worker over memory limit"
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn read_heartbeat(&self) -> Result<Option<WorkerHeartbeat>, ContainerError> {
        let path = self.worker_dir.join(HEARTBEAT_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut last = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match serde_json::from_slice::<WorkerHeartbeat>(&bytes) {
            Ok(hb) => {
                *last = Some(hb.clone());
                Ok(Some(hb))
            }
            Err(e) => {
                tracing::debug!(worker_id = %self.worker_id, error = %e, "unreadable heartbeat");
                Ok(last.clone())
            }
        }
    }

    async fn clean_up_for_restart(&self) -> Result<(), ContainerError> {
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_pid(None);
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        for name in [HEARTBEAT_FILE, PID_FILE] {
            match tokio::fs::remove_file(self.worker_dir.join(name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn relaunch(&self) -> Result<(), ContainerError> {
        tokio::fs::create_dir_all(&self.worker_dir).await?;
        self.spawn().await
    }

    async fn clean_up(&self) -> Result<(), ContainerError> {
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_pid(None);
        match tokio::fs::remove_dir_all(&self.worker_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.local_state.remove_worker(&self.worker_id)?;
        Ok(())
    }

    async fn run_profiling(&self, request: &ProfileRequest, stop: bool) -> bool {
        if request.action == ProfileAction::RestartWorker {
            // The slot notices the exit and relaunches
            return match self.signal_group(Signal::SIGKILL) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, error = %e, "restart failed");
                    false
                }
            };
        }

        let Some(argv) = self.profiler_args(request, stop) else {
            tracing::warn!(
                worker_id = %self.worker_id,
                action = %request.action,
                "no profiler configured or worker not running"
            );
            return false;
        };
        let Some((program, args)) = argv.split_first() else {
            return false;
        };
        match Command::new(program)
            .args(args)
            .current_dir(&self.worker_dir)
            .status()
            .await
        {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::warn!(worker_id = %self.worker_id, %status, "profiler failed");
                false
            }
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "profiler did not start");
                false
            }
        }
    }

    async fn process_metrics(&self) -> Option<ProcessMetrics> {
        self.rss_mb().map(|rss_mb| ProcessMetrics { rss_mb })
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
