// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node agent: owns the slots of one node and feeds them from the cluster
//! state

use crate::error::AgentError;
use crate::metrics::SlotMetrics;
use crate::slot::{DynamicState, Slot, SlotConfig, SlotDeps, SlotFailure};
use slotd_adapters::{
    ClusterState, Container, ContainerHandle, ContainerLauncher, Localizer, NodeHeartbeat,
};
use slotd_core::{Clock, LocalAssignment, Port, TopoProfileAction};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How often a draining shutdown re-checks a force-killed worker
const DEATH_POLL: Duration = Duration::from_millis(100);

/// Node identity, slot ports and periodic task timings
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub node_id: String,
    pub host: String,
    pub ports: Vec<Port>,
    pub slot: SlotConfig,
    pub assignment_sync: Duration,
    pub node_heartbeat: Duration,
    pub blob_update_check: Duration,
    pub blob_cleanup: Duration,
    /// Grace period between the shutdown kill and force kill
    pub shutdown_sleep: Duration,
    /// How long to wait for a force-killed worker to die
    pub force_kill_wait: Duration,
    /// Kill workers on shutdown instead of leaving them for the next agent
    pub drain_on_shutdown: bool,
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, ports: Vec<Port>) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            ports,
            slot: SlotConfig::default(),
            assignment_sync: Duration::from_secs(10),
            node_heartbeat: Duration::from_secs(5),
            blob_update_check: Duration::from_secs(30),
            blob_cleanup: Duration::from_secs(60),
            shutdown_sleep: Duration::from_secs(1),
            force_kill_wait: Duration::from_secs(5),
            drain_on_shutdown: true,
        }
    }
}

/// Supervises every slot on the node
pub struct NodeAgent<L, C, S, K> {
    config: AgentConfig,
    deps: SlotDeps<L, C, S, K>,
    slots: Arc<BTreeMap<Port, Slot>>,
    failures: mpsc::Receiver<SlotFailure>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<L, C, S, K> NodeAgent<L, C, S, K>
where
    L: Localizer,
    C: ContainerLauncher,
    S: ClusterState,
    K: Clock,
{
    /// Start one slot per configured port, recovering persisted workers,
    /// and launch the periodic tasks
    pub async fn start(
        config: AgentConfig,
        deps: SlotDeps<L, C, S, K>,
    ) -> Result<Self, AgentError> {
        let configured: HashSet<Port> = config.ports.iter().copied().collect();
        for port in deps.local_state.assignments().keys() {
            if !configured.contains(port) {
                tracing::warn!(port, "persisted assignment for a port that is not configured");
            }
        }

        let (failures_tx, failures) = mpsc::channel(config.ports.len().max(1));
        let mut slots = BTreeMap::new();
        for &port in &config.ports {
            let slot = Slot::start(
                port,
                config.host.clone(),
                config.slot.clone(),
                deps.clone(),
                failures_tx.clone(),
            )
            .await
            .map_err(|source| AgentError::Slot { port, source })?;
            slots.insert(port, slot);
        }
        drop(failures_tx);

        let mut agent = Self {
            config,
            deps,
            slots: Arc::new(slots),
            failures,
            shutdown: watch::channel(false).0,
            tasks: Vec::new(),
        };
        agent.spawn_periodic_tasks();
        tracing::info!(
            node_id = %agent.config.node_id,
            slots = agent.slots.len(),
            "node agent started"
        );
        Ok(agent)
    }

    fn spawn_periodic_tasks(&mut self) {
        let started = self.deps.clock.now();
        let periods = &self.config;

        let sync = {
            let (cluster, config, slots) = (
                self.deps.cluster_state.clone(),
                self.config.clone(),
                Arc::clone(&self.slots),
            );
            spawn_periodic(
                "assignment-sync",
                periods.assignment_sync,
                self.shutdown.subscribe(),
                move || {
                    let (cluster, config, slots) =
                        (cluster.clone(), config.clone(), Arc::clone(&slots));
                    async move {
                        if let Err(e) = sync_assignments(&cluster, &config, &slots).await {
                            tracing::warn!(error = %e, "assignment sync failed");
                        }
                    }
                },
            )
        };

        let heartbeat = {
            let (cluster, clock, metrics, config, slots) = (
                self.deps.cluster_state.clone(),
                self.deps.clock.clone(),
                Arc::clone(&self.deps.metrics),
                self.config.clone(),
                Arc::clone(&self.slots),
            );
            spawn_periodic(
                "node-heartbeat",
                periods.node_heartbeat,
                self.shutdown.subscribe(),
                move || {
                    let (cluster, clock, metrics, config, slots) = (
                        cluster.clone(),
                        clock.clone(),
                        Arc::clone(&metrics),
                        config.clone(),
                        Arc::clone(&slots),
                    );
                    async move {
                        let sent = heartbeat_node(
                            &cluster,
                            &clock,
                            started,
                            metrics.as_ref(),
                            &config,
                            &slots,
                        )
                        .await;
                        if let Err(e) = sent {
                            tracing::warn!(error = %e, "node heartbeat failed");
                        }
                    }
                },
            )
        };

        let localizer = self.deps.localizer.clone();
        let update = spawn_periodic(
            "blob-update",
            periods.blob_update_check,
            self.shutdown.subscribe(),
            move || {
                let localizer = localizer.clone();
                async move {
                    if let Err(e) = localizer.update_blobs().await {
                        tracing::warn!(error = %e, "blob update check failed");
                    }
                }
            },
        );

        let localizer = self.deps.localizer.clone();
        let cleanup = spawn_periodic(
            "blob-cleanup",
            periods.blob_cleanup,
            self.shutdown.subscribe(),
            move || {
                let localizer = localizer.clone();
                async move {
                    if let Err(e) = localizer.cleanup_unused().await {
                        tracing::warn!(error = %e, "blob clean up failed");
                    }
                }
            },
        );

        self.tasks.extend([sync, heartbeat, update, cleanup]);
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn slot(&self, port: Port) -> Result<&Slot, AgentError> {
        self.slots.get(&port).ok_or(AgentError::UnknownPort(port))
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    pub fn metrics(&self) -> &Arc<dyn SlotMetrics> {
        &self.deps.metrics
    }

    /// Read the cluster state once and publish it to the slots
    pub async fn sync_once(&self) -> Result<(), AgentError> {
        sync_assignments(&self.deps.cluster_state, &self.config, &self.slots).await
    }

    /// Wait for a slot to fail fatally; `None` once every slot loop is gone
    pub async fn next_failure(&mut self) -> Option<SlotFailure> {
        self.failures.recv().await
    }

    /// Stop the periodic tasks and every slot loop, then drain workers if
    /// configured to
    pub async fn shutdown(self) -> Result<(), AgentError> {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "periodic task ended abnormally");
            }
        }
        for slot in self.slots.values() {
            slot.close().await;
        }

        if !self.config.drain_on_shutdown {
            tracing::info!("leaving workers running for the next agent");
            return Ok(());
        }

        let states: Vec<(Port, DynamicState)> = self
            .slots
            .values()
            .map(|slot| (slot.port(), slot.state()))
            .collect();
        drain(&self.config, &self.deps, &states).await
    }
}

/// Run `tick` every `period` until shutdown is signalled
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = interval.tick() => tick().await,
            }
        }
        tracing::debug!(task = name, "periodic task stopped");
    })
}

/// Publish the node's assignment snapshot and profile requests to the slots
async fn sync_assignments<S: ClusterState>(
    cluster: &S,
    config: &AgentConfig,
    slots: &BTreeMap<Port, Slot>,
) -> Result<(), AgentError> {
    let assignments = cluster.assignments_for(&config.node_id).await?;
    for port in assignments.keys() {
        if !slots.contains_key(port) {
            tracing::warn!(port, "ignoring assignment for a port that is not configured");
        }
    }
    for (port, slot) in slots {
        slot.set_new_assignment(assignments.get(port).cloned());
    }

    let mut by_port: BTreeMap<Port, Vec<TopoProfileAction>> = BTreeMap::new();
    for action in cluster.profile_requests_for(&config.host).await? {
        if slots.contains_key(&action.request.port) {
            by_port.entry(action.request.port).or_default().push(action);
        } else {
            tracing::debug!(%action, "ignoring profile request for an unknown port");
        }
    }
    for (port, actions) in by_port {
        if let Some(slot) = slots.get(&port) {
            slot.add_profiler_actions(actions);
        }
    }
    Ok(())
}

async fn heartbeat_node<S: ClusterState, K: Clock>(
    cluster: &S,
    clock: &K,
    started: Instant,
    metrics: &dyn SlotMetrics,
    config: &AgentConfig,
    slots: &BTreeMap<Port, Slot>,
) -> Result<(), AgentError> {
    let used_ports: Vec<Port> = slots
        .values()
        .filter(|slot| slot.state().container().is_some())
        .map(Slot::port)
        .collect();
    let heartbeat = NodeHeartbeat {
        node_id: config.node_id.clone(),
        host: config.host.clone(),
        time_secs: clock.epoch_millis() / 1000,
        uptime_secs: clock.now().saturating_duration_since(started).as_secs(),
        ports: config.ports.clone(),
        used_ports,
    };
    cluster.heartbeat_node(&heartbeat).await?;

    let snapshot = metrics.snapshot();
    tracing::info!(
        used = heartbeat.used_ports.len(),
        launched = snapshot.launched,
        relaunched = snapshot.relaunched,
        killed = snapshot.total_killed(),
        force_kills = snapshot.force_kills,
        start_timeouts = snapshot.start_timeouts,
        "node heartbeat"
    );
    Ok(())
}

/// Kill every worker, release its blobs and forget its assignment
async fn drain<L: Localizer, C, S, K>(
    config: &AgentConfig,
    deps: &SlotDeps<L, C, S, K>,
    states: &[(Port, DynamicState)],
) -> Result<(), AgentError> {
    let mut killed = false;
    for (port, ds) in states {
        if let Some(container) = ds.container() {
            if let Err(e) = container.kill().await {
                tracing::warn!(port, error = %e, "shutdown kill failed");
            }
            killed = true;
        }
    }
    if killed {
        tokio::time::sleep(config.shutdown_sleep).await;
    }

    for (port, ds) in states {
        if let Some(container) = ds.container() {
            stop_container(*port, container, config.force_kill_wait).await;
        }

        let mut released: Vec<&LocalAssignment> = Vec::new();
        let held = [
            ds.current_assignment(),
            ds.pending_localization().map(|p| &p.assignment),
            ds.pending_changing_blobs_assignment(),
        ];
        for assignment in held.into_iter().flatten() {
            if released.contains(&assignment) {
                continue;
            }
            if let Err(e) = deps.localizer.release_slot_for(assignment, *port).await {
                tracing::warn!(port, error = %e, "releasing blob references failed");
            }
            released.push(assignment);
        }

        for notice in ds.changing_blobs() {
            notice.ack.acknowledge();
        }
        deps.local_state.set_assignment(*port, None)?;
    }

    tracing::info!(slots = states.len(), "workers drained");
    Ok(())
}

/// Force kill a worker that ignored the shutdown kill, wait a bounded time
/// for it to die, then clean it up
async fn stop_container(port: Port, container: &ContainerHandle, wait: Duration) {
    if !matches!(container.are_all_processes_dead().await, Ok(true)) {
        if let Err(e) = container.force_kill().await {
            tracing::warn!(port, error = %e, "shutdown force kill failed");
        }
        let died = tokio::time::timeout(wait, wait_for_death(container.as_ref())).await;
        if died.is_err() {
            tracing::warn!(
                port,
                worker_id = %container.worker_id(),
                "worker still alive after force kill"
            );
        }
    }
    if let Err(e) = container.clean_up().await {
        tracing::warn!(port, error = %e, "shutdown clean up failed");
    }
}

async fn wait_for_death(container: &dyn Container) {
    while !matches!(container.are_all_processes_dead().await, Ok(true)) {
        tokio::time::sleep(DEATH_POLL).await;
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
