// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slots: one supervised worker per port
//!
//! A [`Slot`] owns a control loop task that repeatedly steps the state
//! machine. The agent talks to it only through atomically published values:
//! the desired assignment and the outstanding profile actions go in, the
//! latest [`DynamicState`] comes out.

mod state;
mod step;

pub use state::{DynamicState, MachineState, PendingLocalization, SlotConfig, StaticState};
pub use step::step;

use crate::error::SlotError;
use crate::metrics::SlotMetrics;
use slotd_adapters::{BlobChangeCallback, BlobChanging, ClusterState, ContainerLauncher, Localizer};
use slotd_core::{Clock, LocalAssignment, Port, TopoProfileAction};
use slotd_storage::LocalState;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Capacity of the per-slot blob-change queue
const BLOB_QUEUE_CAPACITY: usize = 64;

/// Collaborators shared by every slot on a node
#[derive(Clone)]
pub struct SlotDeps<L, C, S, K> {
    pub localizer: L,
    pub launcher: C,
    pub cluster_state: S,
    pub local_state: LocalState,
    pub metrics: Arc<dyn SlotMetrics>,
    pub clock: K,
}

/// A slot loop that stopped on a fatal error
#[derive(Debug)]
pub struct SlotFailure {
    pub port: Port,
    pub error: SlotError,
}

/// Handle to a running slot
pub struct Slot {
    port: Port,
    new_assignment: watch::Sender<Option<LocalAssignment>>,
    profiling: Arc<watch::Sender<HashSet<TopoProfileAction>>>,
    published: watch::Receiver<DynamicState>,
    close: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Slot {
    /// Recover whatever the previous agent left on `port` and start the
    /// control loop.
    ///
    /// Fatal errors from the loop are reported on `failures`.
    pub async fn start<L, C, S, K>(
        port: Port,
        host: impl Into<String>,
        config: SlotConfig,
        deps: SlotDeps<L, C, S, K>,
        failures: mpsc::Sender<SlotFailure>,
    ) -> Result<Slot, SlotError>
    where
        L: Localizer,
        C: ContainerLauncher,
        S: ClusterState,
        K: Clock,
    {
        let (changing_callback, notices) = BlobChangeCallback::channel(BLOB_QUEUE_CAPACITY);
        let (close, closed) = watch::channel(false);
        let ss = StaticState {
            port,
            host: host.into(),
            localizer: deps.localizer,
            launcher: deps.launcher,
            cluster_state: deps.cluster_state,
            local_state: deps.local_state,
            metrics: deps.metrics,
            clock: deps.clock,
            config,
            changing_callback,
            closed,
        };

        let initial = recover(&ss).await?;
        tracing::info!(port, state = %initial.state(), "slot starting");

        let (new_assignment, assignment_rx) = watch::channel(initial.new_assignment().cloned());
        let profiling = Arc::new(watch::channel(HashSet::new()).0);
        let (publisher, published) = watch::channel(initial.clone());

        let control = SlotLoop {
            ss,
            assignment: assignment_rx,
            profiling: Arc::clone(&profiling),
            notices,
            publisher,
            failures,
        };
        let task = tokio::spawn(
            control
                .run(initial)
                .instrument(tracing::info_span!("slot", port)),
        );

        Ok(Slot {
            port,
            new_assignment,
            profiling,
            published,
            close,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> Port {
        self.port
    }

    /// Publish the desired assignment; `None` means run nothing.
    ///
    /// The loop picks it up on its next iteration.
    pub fn set_new_assignment(&self, assignment: Option<LocalAssignment>) {
        self.new_assignment.send_replace(assignment);
    }

    /// Add profile actions to the outstanding set
    pub fn add_profiler_actions(&self, actions: impl IntoIterator<Item = TopoProfileAction>) {
        let actions: Vec<TopoProfileAction> = actions.into_iter().collect();
        if actions.is_empty() {
            return;
        }
        self.profiling.send_modify(|set| set.extend(actions));
    }

    /// Profile actions not yet completed
    pub fn profiler_actions(&self) -> HashSet<TopoProfileAction> {
        self.profiling.borrow().clone()
    }

    /// Latest state published by the loop
    pub fn state(&self) -> DynamicState {
        self.published.borrow().clone()
    }

    pub fn machine_state(&self) -> MachineState {
        self.published.borrow().state()
    }

    /// Watch published states
    pub fn subscribe(&self) -> watch::Receiver<DynamicState> {
        self.published.clone()
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// The worker itself is left alone.
    pub async fn close(&self) {
        self.close.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(port = self.port, error = %e, "slot task ended abnormally");
            }
        }
    }
}

/// Initial state from the persisted assignment, re-attaching to a worker
/// that outlived the previous agent
async fn recover<L, C, S, K>(ss: &StaticState<L, C, S, K>) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: ClusterState,
    K: Clock,
{
    let now = ss.clock.now();
    let Some(assignment) = ss.local_state.assignment(ss.port) else {
        return Ok(DynamicState::empty(now));
    };

    match ss
        .launcher
        .recover_container(ss.port, &assignment, &ss.local_state)
        .await
    {
        Ok(container) => {
            if let Err(e) = ss
                .localizer
                .recover_running_topology(&assignment, ss.port, ss.changing_callback.clone())
                .await
            {
                tracing::warn!(
                    port = ss.port,
                    topology_id = %assignment.topology_id,
                    error = %e,
                    "could not recover blob references"
                );
            }
            tracing::info!(
                port = ss.port,
                topology_id = %assignment.topology_id,
                worker_id = %container.worker_id(),
                "recovered running worker"
            );
            Ok(DynamicState::running(assignment, container, now))
        }
        Err(e) => {
            tracing::info!(
                port = ss.port,
                topology_id = %assignment.topology_id,
                error = %e,
                "dropping persisted assignment"
            );
            ss.local_state.set_assignment(ss.port, None)?;
            Ok(DynamicState::empty(now))
        }
    }
}

struct SlotLoop<L, C, S, K> {
    ss: StaticState<L, C, S, K>,
    assignment: watch::Receiver<Option<LocalAssignment>>,
    profiling: Arc<watch::Sender<HashSet<TopoProfileAction>>>,
    notices: mpsc::Receiver<BlobChanging>,
    publisher: watch::Sender<DynamicState>,
    failures: mpsc::Sender<SlotFailure>,
}

impl<L, C, S, K> SlotLoop<L, C, S, K>
where
    L: Localizer,
    C: ContainerLauncher,
    S: ClusterState,
    K: Clock,
{
    async fn run(mut self, mut ds: DynamicState) {
        let port = self.ss.port;
        while !self.ss.is_closed() {
            let original: HashSet<TopoProfileAction> = self.profiling.borrow().clone();
            let mut changing = ds.changing_blobs().to_vec();
            while let Ok(notice) = self.notices.try_recv() {
                changing.push(notice);
            }
            let pending_stop = ds.pending_stop_profile_actions().clone();
            let input = ds
                .with_new_assignment(self.assignment.borrow().clone())
                .with_profile_actions(original.clone(), pending_stop)
                .with_changing_blobs(changing);
            let from = input.state();
            let previous = input.current_assignment().cloned();

            let next = match step(input, &self.ss).await {
                Ok(next) => next,
                Err(error) => {
                    self.fail(error).await;
                    return;
                }
            };

            if next.state() != from {
                tracing::info!(port, from = %from, to = %next.state(), "slot transition");
            }

            if next.current_assignment() != previous.as_ref() {
                if let Err(e) = self
                    .ss
                    .local_state
                    .set_assignment(port, next.current_assignment())
                {
                    self.fail(e.into()).await;
                    return;
                }
            }

            self.finish_profile_actions(&original, &next).await;
            self.publisher.send_replace(next.clone());
            ds = next;
        }

        // Nothing will acknowledge these once the loop is gone
        for notice in ds.changing_blobs() {
            notice.ack.acknowledge();
        }
        tracing::info!(port, state = %ds.state(), "slot stopped");
    }

    /// Delete actions the step completed or dropped from the cluster state
    /// and from the outstanding set
    async fn finish_profile_actions(
        &self,
        original: &HashSet<TopoProfileAction>,
        next: &DynamicState,
    ) {
        let removed: Vec<TopoProfileAction> = original
            .iter()
            .filter(|action| {
                !next.profile_actions().contains(*action)
                    && !next.pending_stop_profile_actions().contains(*action)
            })
            .cloned()
            .collect();
        if removed.is_empty() {
            return;
        }

        for action in &removed {
            if let Err(e) = self.ss.cluster_state.delete_profile_request(action).await {
                tracing::warn!(port = self.ss.port, %action, error = %e, "deleting profile request failed");
            }
        }
        self.profiling.send_modify(|set| {
            for action in &removed {
                set.remove(action);
            }
        });
    }

    async fn fail(&self, error: SlotError) {
        tracing::error!(port = self.ss.port, error = %error, "slot failed");
        let failure = SlotFailure {
            port: self.ss.port,
            error,
        };
        if self.failures.send(failure).await.is_err() {
            tracing::warn!(port = self.ss.port, "nobody is listening for slot failures");
        }
    }
}

#[cfg(test)]
#[path = "slot_tests.rs"]
mod tests;
