// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::metrics::CountingMetrics;
use crate::slot::MachineState;
use slotd_adapters::{
    ContainerCall, FakeClusterState, FakeContainer, FakeContainerLauncher, FakeLocalizer,
};
use slotd_core::{ExecutorInfo, FakeClock, ProfileAction, ProfileRequest, WorkerHeartbeat};
use slotd_storage::LocalState;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

const NODE: &str = "node-a";

type TestAgent = NodeAgent<FakeLocalizer, FakeContainerLauncher, FakeClusterState, FakeClock>;

struct Fixture {
    deps: SlotDeps<FakeLocalizer, FakeContainerLauncher, FakeClusterState, FakeClock>,
    localizer: FakeLocalizer,
    launcher: FakeContainerLauncher,
    cluster: FakeClusterState,
    clock: FakeClock,
    local_state: LocalState,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let local_state = LocalState::open(&dir.path().join("local.wal")).unwrap();
    let localizer = FakeLocalizer::new();
    let launcher = FakeContainerLauncher::new();
    let cluster = FakeClusterState::new();
    let clock = FakeClock::new();
    let deps = SlotDeps {
        localizer: localizer.clone(),
        launcher: launcher.clone(),
        cluster_state: cluster.clone(),
        local_state: local_state.clone(),
        metrics: Arc::new(CountingMetrics::new()),
        clock: clock.clone(),
    };
    Fixture {
        deps,
        localizer,
        launcher,
        cluster,
        clock,
        local_state,
        _dir: dir,
    }
}

fn topo() -> LocalAssignment {
    LocalAssignment::new("topo-1", "alice", vec![ExecutorInfo::new(1, 8)])
}

fn config(ports: Vec<Port>) -> AgentConfig {
    AgentConfig::new(NODE, NODE, ports)
}

fn heap_dump(port: Port) -> TopoProfileAction {
    TopoProfileAction {
        topology_id: "topo-1".into(),
        request: ProfileRequest {
            host: NODE.to_string(),
            port,
            action: ProfileAction::HeapDump,
            stop_at_millis: 0,
        },
    }
}

impl Fixture {
    async fn start(&self, config: AgentConfig) -> TestAgent {
        NodeAgent::start(config, self.deps.clone()).await.unwrap()
    }

    /// A worker left running by a previous agent, still assigned in the
    /// cluster state
    fn leave_running_worker(&self, port: Port) -> FakeContainer {
        self.local_state.set_assignment(port, Some(&topo())).unwrap();
        self.cluster.set_assignment(NODE, port, Some(topo()));
        let container = FakeContainer::new(port, format!("w-{port}"));
        container.set_heartbeat(Some(WorkerHeartbeat {
            time_secs: self.clock.epoch_secs(),
            topology_id: "topo-1".into(),
            executors: vec![ExecutorInfo::new(1, 8)],
            port,
        }));
        self.launcher.add_recoverable(container.clone());
        container
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn config_defaults() {
    let config = config(vec![6700]);
    assert_eq!(config.assignment_sync, Duration::from_secs(10));
    assert_eq!(config.node_heartbeat, Duration::from_secs(5));
    assert_eq!(config.force_kill_wait, Duration::from_secs(5));
    assert!(config.drain_on_shutdown);
    assert_eq!(config.slot, SlotConfig::default());
}

#[tokio::test(start_paused = true)]
async fn sync_launches_assigned_ports_and_empties_the_rest() {
    let f = fixture();
    let stale = f.leave_running_worker(6701);
    f.cluster.set_assignment(NODE, 6701, None);
    f.cluster.set_assignment(NODE, 6700, Some(topo()));

    let agent = f.start(config(vec![6700, 6701])).await;
    agent.sync_once().await.unwrap();

    eventually("launch on 6700", || f.launcher.launch_count() == 1).await;
    let assigned = agent.slot(6700).unwrap();
    eventually("worker start", || {
        assigned.machine_state() == MachineState::WaitingForWorkerStart
    })
    .await;

    let unassigned = agent.slot(6701).unwrap();
    eventually("6701 empty", || {
        unassigned.machine_state() == MachineState::Empty
    })
    .await;
    assert_eq!(stale.count(&ContainerCall::Kill), 1);
    assert!(f.local_state.assignment(6701).is_none());

    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn assignment_for_unconfigured_port_is_ignored() {
    let f = fixture();
    f.cluster.set_assignment(NODE, 6800, Some(topo()));

    let agent = f.start(config(vec![6700])).await;
    agent.sync_once().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(f.launcher.launch_count(), 0);
    assert_eq!(agent.slot(6700).unwrap().machine_state(), MachineState::Empty);
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn profile_requests_reach_their_slot() {
    let f = fixture();
    let container = f.leave_running_worker(6700);
    let dump = heap_dump(6700);
    let elsewhere = heap_dump(6800);
    f.cluster.add_profile_request(dump.clone());
    f.cluster.add_profile_request(elsewhere);

    let agent = f.start(config(vec![6700])).await;
    agent.sync_once().await.unwrap();

    eventually("profile action deleted", || !f.cluster.deleted().is_empty()).await;
    assert_eq!(f.cluster.deleted(), vec![dump.clone()]);
    assert_eq!(container.profiling_calls(), vec![(dump.request, false)]);
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sync_reports_unavailable_cluster_state() {
    let f = fixture();
    let agent = f.start(config(vec![6700])).await;
    f.cluster.set_unavailable(true);

    let result = agent.sync_once().await;

    assert!(matches!(result, Err(AgentError::ClusterState(_))));
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_reports_used_ports() {
    let f = fixture();
    f.leave_running_worker(6700);

    let agent = f.start(config(vec![6700, 6701])).await;
    eventually("node heartbeat", || !f.cluster.heartbeats().is_empty()).await;

    let heartbeat = &f.cluster.heartbeats()[0];
    assert_eq!(heartbeat.node_id, NODE);
    assert_eq!(heartbeat.ports, vec![6700, 6701]);
    assert_eq!(heartbeat.used_ports, vec![6700]);
    assert_eq!(heartbeat.time_secs, f.clock.epoch_secs());
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn blob_maintenance_runs_periodically() {
    let f = fixture();
    let agent = f.start(config(vec![6700])).await;

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(f.localizer.update_checks() >= 2);
    assert!(f.localizer.cleanups() >= 2);
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn periodic_task_stops_when_signalled() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let (stop, stop_rx) = watch::channel(false);
    let counter = Arc::clone(&ticks);
    let task = spawn_periodic("counter", Duration::from_secs(1), stop_rx, move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    tokio::time::sleep(Duration::from_millis(2500)).await;
    stop.send_replace(true);
    task.await.unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn unknown_port_is_rejected() {
    let f = fixture();
    let agent = f.start(config(vec![6700])).await;

    assert!(matches!(agent.slot(9999), Err(AgentError::UnknownPort(9999))));
    assert_eq!(agent.slots().count(), 1);
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn draining_shutdown_kills_and_forgets_workers() {
    let f = fixture();
    let container = f.leave_running_worker(6700);
    let agent = f.start(config(vec![6700])).await;

    agent.shutdown().await.unwrap();

    assert!(!container.is_alive());
    assert_eq!(container.count(&ContainerCall::Kill), 1);
    assert_eq!(container.count(&ContainerCall::ForceKill), 0);
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert_eq!(f.localizer.release_count("topo-1", 6700), 1);
    assert!(f.local_state.assignment(6700).is_none());
}

#[tokio::test(start_paused = true)]
async fn draining_shutdown_force_kills_stubborn_workers() {
    let f = fixture();
    let container = f.leave_running_worker(6700);
    container.set_stubborn(true);
    let agent = f.start(config(vec![6700])).await;

    agent.shutdown().await.unwrap();

    assert!(!container.is_alive());
    assert_eq!(container.count(&ContainerCall::ForceKill), 1);
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
}

#[tokio::test(start_paused = true)]
async fn unkillable_worker_does_not_block_shutdown() {
    let f = fixture();
    let container = f.leave_running_worker(6700);
    container.set_unkillable(true);
    let agent = f.start(config(vec![6700])).await;

    agent.shutdown().await.unwrap();

    assert!(container.is_alive());
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert!(f.local_state.assignment(6700).is_none());
}

#[tokio::test(start_paused = true)]
async fn shutdown_without_drain_leaves_workers() {
    let f = fixture();
    let container = f.leave_running_worker(6700);
    let mut config = config(vec![6700]);
    config.drain_on_shutdown = false;
    let agent = f.start(config).await;

    agent.shutdown().await.unwrap();

    assert!(container.is_alive());
    assert!(container.calls().is_empty());
    assert_eq!(f.local_state.assignment(6700), Some(topo()));
    assert_eq!(f.localizer.release_count("topo-1", 6700), 0);
}

#[tokio::test(start_paused = true)]
async fn fatal_slot_failure_is_surfaced() {
    let f = fixture();
    let container = f.leave_running_worker(6700);
    container.set_unkillable(true);
    container.set_heartbeat(None);
    let mut agent = f.start(config(vec![6700])).await;

    let slot = agent.slot(6700).unwrap();
    eventually("relaunch kill", || {
        slot.machine_state() == MachineState::KillAndRelaunch
    })
    .await;
    f.clock.advance(Duration::from_secs(121));

    let failure = agent.next_failure().await.unwrap();
    assert_eq!(failure.port, 6700);
    assert!(failure.error.is_fatal());
}
