// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot state: the per-iteration dynamic state and the fixed static state

use crate::error::SlotError;
use crate::metrics::SlotMetrics;
use slotd_adapters::{BlobChangeCallback, BlobChanging, ContainerHandle, PendingDownload};
use slotd_core::{LocalAssignment, Port, TopoProfileAction};
use slotd_storage::LocalState;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// States of the slot state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    Empty,
    WaitingForBlobLocalization,
    WaitingForBlobUpdate,
    WaitingForWorkerStart,
    Running,
    Kill,
    KillAndRelaunch,
    KillBlobUpdate,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Empty => "empty",
            MachineState::WaitingForBlobLocalization => "waiting-for-blob-localization",
            MachineState::WaitingForBlobUpdate => "waiting-for-blob-update",
            MachineState::WaitingForWorkerStart => "waiting-for-worker-start",
            MachineState::Running => "running",
            MachineState::Kill => "kill",
            MachineState::KillAndRelaunch => "kill-and-relaunch",
            MachineState::KillBlobUpdate => "kill-blob-update",
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing constants for one slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotConfig {
    /// Oldest heartbeat a running worker may have
    pub heartbeat_timeout: Duration,
    /// How long a launched worker has to send its first heartbeat
    pub first_heartbeat_timeout: Duration,
    pub kill_sleep: Duration,
    pub monitor_frequency: Duration,
    /// Bound on waits and idle sleeps in the non-running states
    pub poll_granularity: Duration,
    pub download_retry: Duration,
    /// A worker still alive this long after being killed is fatal
    pub kill_ceiling: Duration,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            first_heartbeat_timeout: Duration::from_secs(120),
            kill_sleep: Duration::from_secs(1),
            monitor_frequency: Duration::from_secs(3),
            poll_granularity: Duration::from_secs(1),
            download_retry: Duration::from_secs(3),
            kill_ceiling: Duration::from_secs(120),
        }
    }
}

/// An assignment whose blobs are being localized before launch
#[derive(Debug, Clone)]
pub struct PendingLocalization {
    pub assignment: LocalAssignment,
    pub download: PendingDownload,
}

/// Everything that changes between iterations of a slot.
///
/// Values are replaced rather than mutated: each `with_*` consumes the
/// state and returns the next one.
#[derive(Debug, Clone)]
pub struct DynamicState {
    state: MachineState,
    new_assignment: Option<LocalAssignment>,
    current_assignment: Option<LocalAssignment>,
    container: Option<ContainerHandle>,
    pending_localization: Option<PendingLocalization>,
    start_time: Instant,
    profile_actions: HashSet<TopoProfileAction>,
    pending_stop_profile_actions: HashSet<TopoProfileAction>,
    changing_blobs: Vec<BlobChanging>,
    pending_changing_blobs: Vec<PendingDownload>,
    pending_changing_blobs_assignment: Option<LocalAssignment>,
}

impl DynamicState {
    /// A slot with nothing assigned
    pub fn empty(now: Instant) -> Self {
        Self {
            state: MachineState::Empty,
            new_assignment: None,
            current_assignment: None,
            container: None,
            pending_localization: None,
            start_time: now,
            profile_actions: HashSet::new(),
            pending_stop_profile_actions: HashSet::new(),
            changing_blobs: Vec::new(),
            pending_changing_blobs: Vec::new(),
            pending_changing_blobs_assignment: None,
        }
    }

    /// A slot re-attached to a worker that was already running
    pub fn running(assignment: LocalAssignment, container: ContainerHandle, now: Instant) -> Self {
        Self {
            state: MachineState::Running,
            new_assignment: Some(assignment.clone()),
            current_assignment: Some(assignment),
            container: Some(container),
            ..Self::empty(now)
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn new_assignment(&self) -> Option<&LocalAssignment> {
        self.new_assignment.as_ref()
    }

    pub fn current_assignment(&self) -> Option<&LocalAssignment> {
        self.current_assignment.as_ref()
    }

    pub fn container(&self) -> Option<&ContainerHandle> {
        self.container.as_ref()
    }

    pub fn pending_localization(&self) -> Option<&PendingLocalization> {
        self.pending_localization.as_ref()
    }

    /// When the current state was entered
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    pub fn profile_actions(&self) -> &HashSet<TopoProfileAction> {
        &self.profile_actions
    }

    /// Timed actions started on the worker and waiting for their stop time
    pub fn pending_stop_profile_actions(&self) -> &HashSet<TopoProfileAction> {
        &self.pending_stop_profile_actions
    }

    pub fn changing_blobs(&self) -> &[BlobChanging] {
        &self.changing_blobs
    }

    pub fn pending_changing_blobs(&self) -> &[PendingDownload] {
        &self.pending_changing_blobs
    }

    pub fn pending_changing_blobs_assignment(&self) -> Option<&LocalAssignment> {
        self.pending_changing_blobs_assignment.as_ref()
    }

    /// Move to `state`, restarting the time-in-state clock
    pub fn with_state(mut self, state: MachineState, now: Instant) -> Self {
        self.state = state;
        self.start_time = now;
        self
    }

    pub fn with_new_assignment(mut self, assignment: Option<LocalAssignment>) -> Self {
        self.new_assignment = assignment;
        self
    }

    /// Set or clear the running container together with its assignment
    pub fn with_current_assignment(
        mut self,
        current: Option<(ContainerHandle, LocalAssignment)>,
    ) -> Self {
        match current {
            Some((container, assignment)) => {
                self.container = Some(container);
                self.current_assignment = Some(assignment);
            }
            None => {
                self.container = None;
                self.current_assignment = None;
            }
        }
        self
    }

    /// Replace the recorded assignment of the running container with an
    /// equivalent one
    pub fn with_updated_current_assignment(mut self, assignment: LocalAssignment) -> Self {
        if self.container.is_some() {
            self.current_assignment = Some(assignment);
        }
        self
    }

    pub fn with_pending_localization(
        mut self,
        pending: Option<(LocalAssignment, PendingDownload)>,
    ) -> Self {
        self.pending_localization =
            pending.map(|(assignment, download)| PendingLocalization {
                assignment,
                download,
            });
        self
    }

    pub fn with_profile_actions(
        mut self,
        actions: HashSet<TopoProfileAction>,
        pending_stop: HashSet<TopoProfileAction>,
    ) -> Self {
        self.profile_actions = actions;
        self.pending_stop_profile_actions = pending_stop;
        self
    }

    pub fn with_changing_blobs(mut self, changing: Vec<BlobChanging>) -> Self {
        self.changing_blobs = changing;
        self
    }

    pub fn with_pending_changing_blobs(
        mut self,
        pending: Vec<PendingDownload>,
        assignment: Option<LocalAssignment>,
    ) -> Self {
        self.pending_changing_blobs = pending;
        self.pending_changing_blobs_assignment = assignment;
        self
    }

    /// Check the structural invariants; a violation means a logic bug
    pub fn validate(&self) -> Result<(), SlotError> {
        if self.container.is_none() != self.current_assignment.is_none() {
            return Err(SlotError::InvariantViolation(format!(
                "{}: container present = {} but current assignment present = {}",
                self.state,
                self.container.is_some(),
                self.current_assignment.is_some()
            )));
        }
        if self.pending_changing_blobs.is_empty()
            != self.pending_changing_blobs_assignment.is_none()
        {
            return Err(SlotError::InvariantViolation(format!(
                "{}: {} pending blob updates but owner assignment present = {}",
                self.state,
                self.pending_changing_blobs.len(),
                self.pending_changing_blobs_assignment.is_some()
            )));
        }
        Ok(())
    }
}

/// Collaborators and settings fixed for the lifetime of a slot
pub struct StaticState<L, C, S, K> {
    pub port: Port,
    pub host: String,
    pub localizer: L,
    pub launcher: C,
    pub cluster_state: S,
    pub local_state: LocalState,
    pub metrics: Arc<dyn SlotMetrics>,
    pub clock: K,
    pub config: SlotConfig,
    /// Handed to the localizer so blob changes reach this slot's queue
    pub changing_callback: BlobChangeCallback,
    /// Flips to `true` when the slot is being closed
    pub closed: watch::Receiver<bool>,
}

impl<L, C, S, K> StaticState<L, C, S, K> {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.closed.has_changed().is_err()
    }

    /// Sleep for `duration`, returning early if the slot is closed
    pub async fn sleep(&self, duration: Duration) {
        let mut closed = self.closed.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = closed.wait_for(|closed| *closed) => {}
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
