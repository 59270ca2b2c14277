// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::metrics::{CountingMetrics, SlotMetrics};
use crate::slot::state::SlotConfig;
use slotd_adapters::{
    BlobChangeAck, BlobChangeCallback, BlobChanging, ChangeLatch, ContainerCall, FakeClusterState,
    FakeContainer, FakeContainerLauncher, FakeLocalizer, LocalizerCall, LocalizerError,
    PendingDownload,
};
use slotd_core::{
    BlobKey, BlobKind, ExecutorInfo, FakeClock, ProfileAction, ProfileRequest, WorkerHeartbeat,
    WorkerResources,
};
use slotd_storage::LocalState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

const PORT: u16 = 6700;

type TestStatic = StaticState<FakeLocalizer, FakeContainerLauncher, FakeClusterState, FakeClock>;

struct Harness {
    localizer: FakeLocalizer,
    launcher: FakeContainerLauncher,
    clock: FakeClock,
    metrics: Arc<CountingMetrics>,
    ss: TestStatic,
    notices: mpsc::Receiver<BlobChanging>,
    _close: watch::Sender<bool>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let local_state = LocalState::open(&dir.path().join("local.wal")).unwrap();
    let (changing_callback, notices) = BlobChangeCallback::channel(16);
    let (close, closed) = watch::channel(false);
    let localizer = FakeLocalizer::new();
    let launcher = FakeContainerLauncher::new();
    let clock = FakeClock::new();
    let metrics = Arc::new(CountingMetrics::new());

    let ss = StaticState {
        port: PORT,
        host: "node-a".to_string(),
        localizer: localizer.clone(),
        launcher: launcher.clone(),
        cluster_state: FakeClusterState::new(),
        local_state,
        metrics: metrics.clone(),
        clock: clock.clone(),
        config: SlotConfig::default(),
        changing_callback,
        closed,
    };

    Harness {
        localizer,
        launcher,
        clock,
        metrics,
        ss,
        notices,
        _close: close,
        _dir: dir,
    }
}

fn topo(id: &str) -> LocalAssignment {
    LocalAssignment::new(id, "alice", vec![ExecutorInfo::new(1, 4), ExecutorInfo::new(5, 8)])
}

impl Harness {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    async fn step(&self, ds: DynamicState) -> DynamicState {
        step(ds, &self.ss).await.unwrap()
    }

    fn heartbeat(&self) -> WorkerHeartbeat {
        WorkerHeartbeat {
            time_secs: self.clock.epoch_secs(),
            topology_id: "topo-1".into(),
            executors: vec![],
            port: PORT,
        }
    }

    /// A slot running `assignment` on a healthy fake worker
    async fn running(&self, assignment: LocalAssignment) -> (DynamicState, FakeContainer) {
        let container = FakeContainer::new(PORT, "w-1");
        container.set_heartbeat(Some(self.heartbeat()));
        self.localizer
            .recover_running_topology(&assignment, PORT, self.ss.changing_callback.clone())
            .await
            .unwrap();
        let ds = DynamicState::running(assignment, Arc::new(container.clone()), self.now());
        (ds, container)
    }

    /// A notice for `assignment` whose acknowledgement is observable
    fn notice(&self, assignment: &LocalAssignment) -> (BlobChanging, Arc<ChangeLatch>) {
        let latch = ChangeLatch::new(1, PendingDownload::ready(Ok(())));
        let notice = BlobChanging {
            assignment: assignment.clone(),
            blob: BlobKey::new(assignment.topology_id.clone(), BlobKind::Code),
            ack: BlobChangeAck::new(Arc::clone(&latch)),
        };
        (notice, latch)
    }
}

fn with_profiles(ds: DynamicState, actions: &[TopoProfileAction]) -> DynamicState {
    let pending = ds.pending_stop_profile_actions().clone();
    ds.with_profile_actions(actions.iter().cloned().collect(), pending)
}

fn profile(topology: &str, action: ProfileAction, stop_at_millis: u64) -> TopoProfileAction {
    TopoProfileAction {
        topology_id: topology.into(),
        request: ProfileRequest {
            host: "node-a".to_string(),
            port: PORT,
            action,
            stop_at_millis,
        },
    }
}

// Empty

#[tokio::test(start_paused = true)]
async fn empty_without_assignment_stays_empty() {
    let h = harness();
    let ds = h.step(DynamicState::empty(h.now())).await;

    assert_eq!(ds.state(), MachineState::Empty);
    assert!(h.localizer.calls().is_empty());
    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_requests_blobs_for_new_assignment() {
    let h = harness();
    let ds = DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1")));
    let ds = h.step(ds).await;

    assert_eq!(ds.state(), MachineState::WaitingForBlobLocalization);
    assert_eq!(
        ds.pending_localization().map(|p| p.assignment.clone()),
        Some(topo("topo-1"))
    );
    assert_eq!(
        h.localizer.calls(),
        vec![LocalizerCall::RequestDownload {
            topology_id: "topo-1".into(),
            port: PORT
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn empty_drops_profile_actions_and_notices() {
    let h = harness();
    let (notice, latch) = h.notice(&topo("topo-1"));
    let ds = with_profiles(
        DynamicState::empty(h.now()).with_changing_blobs(vec![notice]),
        &[profile("topo-1", ProfileAction::HeapDump, 0)],
    );
    let ds = h.step(ds).await;

    assert_eq!(ds.state(), MachineState::Empty);
    assert!(ds.profile_actions().is_empty());
    assert!(ds.changing_blobs().is_empty());
    assert_eq!(latch.remaining(), 0);
}

// Localization and launch

#[tokio::test(start_paused = true)]
async fn assigned_slot_reaches_running() {
    let h = harness();
    let ds = DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1")));

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForBlobLocalization);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);
    assert_eq!(ds.current_assignment(), Some(&topo("topo-1")));
    assert!(ds.pending_localization().is_none());
    assert_eq!(h.launcher.launch_count(), 1);

    // No heartbeat yet
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);

    h.launcher.last().unwrap().set_heartbeat(Some(h.heartbeat()));
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::Running);
    assert_eq!(ds.current_assignment(), Some(&topo("topo-1")));
    assert_eq!(h.metrics.snapshot().launched, 1);
}

#[tokio::test(start_paused = true)]
async fn download_still_running_keeps_waiting() {
    let h = harness();
    h.localizer.hold_downloads(true);
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForBlobLocalization);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[yare::parameterized(
    unauthorized = { LocalizerError::Unauthorized("topo-1".into()) },
    key_not_found = { LocalizerError::KeyNotFound("topo-1-code".into()) },
    other = { LocalizerError::Other("remote store down".into()) },
)]
#[test_macro(tokio::test(start_paused = true))]
async fn download_failure_releases_and_goes_empty(error: LocalizerError) {
    let h = harness();
    h.localizer.fail_next_download(error);
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::Empty);
    assert!(ds.pending_localization().is_none());
    assert_eq!(h.localizer.release_count("topo-1", PORT), 1);
    assert_eq!(h.launcher.launch_count(), 0);

    // Still assigned, so the next step asks again
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForBlobLocalization);
}

#[tokio::test(start_paused = true)]
async fn launch_failure_releases_and_goes_empty() {
    let h = harness();
    h.launcher.fail_launches(1);
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::Empty);
    assert!(ds.container().is_none());
    assert_eq!(h.localizer.release_count("topo-1", PORT), 1);
    assert_eq!(h.metrics.snapshot().launched, 0);
}

#[tokio::test(start_paused = true)]
async fn reassignment_during_download_releases_stale_blobs() {
    let h = harness();
    h.localizer.hold_downloads(true);
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;

    let ds = ds.with_new_assignment(Some(topo("topo-2")));
    h.localizer.resolve_held(Ok(()));
    let ds = h.step(ds).await;

    assert_eq!(ds.state(), MachineState::WaitingForBlobLocalization);
    assert_eq!(
        ds.pending_localization().map(|p| p.assignment.topology_id.clone()),
        Some("topo-2".into())
    );
    assert_eq!(h.localizer.release_count("topo-1", PORT), 1);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn blob_change_during_download_waits_for_update() {
    let mut h = harness();
    h.localizer.hold_downloads(true);
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;

    let latch = h
        .localizer
        .change_blob(BlobKey::new("topo-1".into(), BlobKind::Conf));
    let notice = h.notices.recv().await.unwrap();
    h.localizer.resolve_held(Ok(()));

    let ds = h.step(ds.with_changing_blobs(vec![notice])).await;
    assert_eq!(ds.state(), MachineState::WaitingForBlobUpdate);
    assert_eq!(latch.remaining(), 0);
    assert!(ds.pending_localization().is_none());
    assert_eq!(ds.pending_changing_blobs_assignment(), Some(&topo("topo-1")));

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);
    assert!(ds.pending_changing_blobs().is_empty());
    assert_eq!(h.launcher.launch_count(), 1);
}

// Worker start

#[tokio::test(start_paused = true)]
async fn worker_start_times_out() {
    let h = harness();
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);

    h.clock.advance(Duration::from_secs(121));
    let ds = h.step(ds).await;

    assert_eq!(ds.state(), MachineState::KillAndRelaunch);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.start_timeouts, 1);
    assert_eq!(snapshot.killed_for(KillReason::HeartbeatTimeout), 1);
    assert_eq!(h.launcher.last().unwrap().count(&ContainerCall::Kill), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_first_heartbeat_does_not_count_as_started() {
    let h = harness();
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;
    let ds = h.step(ds).await;

    h.launcher.last().unwrap().set_heartbeat(Some(h.heartbeat()));
    h.clock.advance(Duration::from_secs(31));
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);
}

#[tokio::test(start_paused = true)]
async fn reassignment_while_starting_kills() {
    let h = harness();
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;
    let ds = h.step(ds).await;

    let ds = h.step(ds.with_new_assignment(Some(topo("topo-2")))).await;
    assert_eq!(ds.state(), MachineState::Kill);
    assert_eq!(
        ds.pending_localization().map(|p| p.assignment.topology_id.clone()),
        Some("topo-2".into())
    );
}

#[tokio::test(start_paused = true)]
async fn worker_exiting_before_first_heartbeat_relaunches() {
    let h = harness();
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);

    h.launcher.last().unwrap().set_main_exited(true);
    let ds = h.step(ds).await;

    assert_eq!(ds.state(), MachineState::KillAndRelaunch);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.killed_for(KillReason::ProcessExit), 1);
    assert_eq!(snapshot.start_timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn blob_change_while_starting_kills_for_update() {
    let h = harness();
    let ds = h
        .step(DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1"))))
        .await;
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);
    let (notice, latch) = h.notice(&topo("topo-1"));

    let ds = h.step(ds.with_changing_blobs(vec![notice])).await;

    assert_eq!(ds.state(), MachineState::KillBlobUpdate);
    assert_eq!(h.metrics.snapshot().killed_for(KillReason::BlobChanged), 1);
    assert_eq!(h.launcher.last().unwrap().count(&ContainerCall::Kill), 1);
    assert_eq!(latch.remaining(), 1);
}

// Running

#[tokio::test(start_paused = true)]
async fn healthy_worker_stays_running() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let ds = h.step(ds).await;

    assert_eq!(ds.state(), MachineState::Running);
    assert!(container.calls().is_empty());
    assert_eq!(h.metrics.snapshot().memory_mb.get(&PORT), Some(&256.0));
}

#[tokio::test(start_paused = true)]
async fn equivalent_assignments_never_restart() {
    let h = harness();
    let (mut ds, container) = h.running(topo("topo-1")).await;

    let reordered = LocalAssignment::new(
        "topo-1",
        "alice",
        vec![ExecutorInfo::new(5, 8), ExecutorInfo::new(1, 4)],
    );
    for _ in 0..5 {
        container.set_heartbeat(Some(h.heartbeat()));
        ds = h.step(ds.with_new_assignment(Some(reordered.clone()))).await;
        ds = h.step(ds.with_new_assignment(Some(topo("topo-1")))).await;
    }

    assert_eq!(ds.state(), MachineState::Running);
    assert!(container.calls().is_empty());
    assert_eq!(h.metrics.snapshot().total_killed(), 0);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn owner_change_updates_in_place() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let renamed = LocalAssignment::new(
        "topo-1",
        "bob",
        vec![ExecutorInfo::new(1, 4), ExecutorInfo::new(5, 8)],
    );

    let ds = h.step(ds.with_new_assignment(Some(renamed.clone()))).await;

    assert_eq!(ds.state(), MachineState::Running);
    assert_eq!(ds.current_assignment(), Some(&renamed));
    assert!(container.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resource_change_is_a_reassignment() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let resized = topo("topo-1").with_resources(WorkerResources {
        mem_on_heap_mb: 1024.0,
        mem_off_heap_mb: 0.0,
        cpu: 100.0,
    });

    let ds = h.step(ds.with_new_assignment(Some(resized))).await;
    assert_eq!(ds.state(), MachineState::Kill);
    assert_eq!(container.count(&ContainerCall::Kill), 1);
}

#[tokio::test(start_paused = true)]
async fn reassignment_kills_once_and_releases_once() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let mut ds = ds.with_new_assignment(Some(topo("topo-2")));

    for _ in 0..10 {
        ds = h.step(ds).await;
        if matches!(
            ds.state(),
            MachineState::WaitingForBlobLocalization | MachineState::WaitingForWorkerStart
        ) {
            break;
        }
    }

    assert!(matches!(
        ds.state(),
        MachineState::WaitingForBlobLocalization | MachineState::WaitingForWorkerStart
    ));
    assert_eq!(container.count(&ContainerCall::Kill), 1);
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert_eq!(h.localizer.release_count("topo-1", PORT), 1);
    assert_eq!(h.metrics.snapshot().killed_for(KillReason::AssignmentChanged), 1);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);
    assert_eq!(ds.current_assignment(), Some(&topo("topo-2")));
}

#[tokio::test(start_paused = true)]
async fn unassigned_worker_is_killed_and_slot_empties() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;

    let ds = h.step(ds.with_new_assignment(None)).await;
    assert_eq!(ds.state(), MachineState::Kill);
    assert!(ds.pending_localization().is_none());

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::Empty);
    assert!(ds.container().is_none());
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert_eq!(h.localizer.release_count("topo-1", PORT), 1);
}

#[tokio::test(start_paused = true)]
async fn stubborn_worker_is_force_killed() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    container.set_stubborn(true);

    let ds = h.step(ds.with_new_assignment(None)).await;
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::Kill);
    assert_eq!(container.count(&ContainerCall::ForceKill), 1);
    assert_eq!(h.metrics.snapshot().force_kills, 1);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::Empty);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_relaunches() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    h.clock.advance(Duration::from_secs(31));

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::KillAndRelaunch);
    assert_eq!(h.metrics.snapshot().killed_for(KillReason::HeartbeatTimeout), 1);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);
    assert_eq!(
        container.calls(),
        vec![
            ContainerCall::Kill,
            ContainerCall::CleanUpForRestart,
            ContainerCall::Relaunch
        ]
    );
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.relaunched, 1);
    assert_eq!(snapshot.killed_for(KillReason::HeartbeatTimeout), 1);
    assert_eq!(h.localizer.release_count("topo-1", PORT), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_heartbeat_relaunches() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    container.set_heartbeat(None);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::KillAndRelaunch);
    assert_eq!(h.metrics.snapshot().killed_for(KillReason::HeartbeatMissing), 1);
}

#[tokio::test(start_paused = true)]
async fn main_process_exit_relaunches() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    container.set_main_exited(true);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::KillAndRelaunch);
    assert_eq!(h.metrics.snapshot().killed_for(KillReason::ProcessExit), 1);
}

#[tokio::test(start_paused = true)]
async fn memory_violation_relaunches() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    container.set_memory_violated(true);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::KillAndRelaunch);
    assert_eq!(h.metrics.snapshot().killed_for(KillReason::MemoryViolation), 1);
}

#[tokio::test(start_paused = true)]
async fn reassignment_after_internal_kill_localizes_new_assignment() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    container.set_main_exited(true);
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::KillAndRelaunch);

    let ds = h.step(ds.with_new_assignment(Some(topo("topo-2")))).await;
    assert_eq!(ds.state(), MachineState::WaitingForBlobLocalization);
    assert!(ds.container().is_none());
    assert_eq!(container.count(&ContainerCall::Relaunch), 0);
    assert_eq!(h.localizer.release_count("topo-1", PORT), 1);
}

#[tokio::test(start_paused = true)]
async fn worker_that_never_dies_is_fatal() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    container.set_unkillable(true);
    container.set_heartbeat(None);

    let mut ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::KillAndRelaunch);

    for _ in 0..3 {
        h.clock.advance(Duration::from_secs(30));
        ds = h.step(ds).await;
        assert_eq!(ds.state(), MachineState::KillAndRelaunch);
    }

    h.clock.advance(Duration::from_secs(31));
    let err = step(ds, &h.ss).await.unwrap_err();
    assert!(err.is_fatal(), "{err}");
    assert!(matches!(err, SlotError::Fatal(_)));
    assert_eq!(container.count(&ContainerCall::ForceKill), 3);
}

// Blob updates

#[tokio::test(start_paused = true)]
async fn blob_change_kills_for_update_and_relaunches_after() {
    let mut h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;

    let latch = h
        .localizer
        .change_blob(BlobKey::new("topo-1".into(), BlobKind::Code));
    let notice = h.notices.recv().await.unwrap();

    let ds = h.step(ds.with_changing_blobs(vec![notice])).await;
    assert_eq!(ds.state(), MachineState::KillBlobUpdate);
    assert_eq!(h.metrics.snapshot().killed_for(KillReason::BlobChanged), 1);
    // Not acknowledged until the worker is gone
    assert_eq!(latch.remaining(), 1);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForBlobUpdate);
    assert!(ds.container().is_none());
    assert!(ds.current_assignment().is_none());
    assert_eq!(ds.pending_changing_blobs_assignment(), Some(&topo("topo-1")));
    assert_eq!(latch.remaining(), 0);
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert_eq!(h.localizer.release_count("topo-1", PORT), 0);

    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForWorkerStart);
    assert_eq!(ds.current_assignment(), Some(&topo("topo-1")));
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn reassignment_during_blob_update_kill_localizes_new_assignment() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let (notice, _latch) = h.notice(&topo("topo-1"));
    let ds = h.step(ds.with_changing_blobs(vec![notice])).await;
    assert_eq!(ds.state(), MachineState::KillBlobUpdate);

    let ds = h.step(ds.with_new_assignment(Some(topo("topo-2")))).await;

    assert_eq!(ds.state(), MachineState::WaitingForBlobLocalization);
    assert!(ds.container().is_none());
    assert!(ds.current_assignment().is_none());
    assert_eq!(
        ds.pending_localization().map(|p| p.assignment.topology_id.clone()),
        Some("topo-2".into())
    );
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert_eq!(h.localizer.release_count("topo-1", PORT), 1);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_that_never_dies_for_blob_update_is_fatal() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    container.set_unkillable(true);
    let (notice, _latch) = h.notice(&topo("topo-1"));

    let mut ds = h.step(ds.with_changing_blobs(vec![notice])).await;
    assert_eq!(ds.state(), MachineState::KillBlobUpdate);

    for _ in 0..3 {
        h.clock.advance(Duration::from_secs(30));
        ds = h.step(ds).await;
        assert_eq!(ds.state(), MachineState::KillBlobUpdate);
    }

    h.clock.advance(Duration::from_secs(31));
    let err = step(ds, &h.ss).await.unwrap_err();
    assert!(matches!(err, SlotError::Fatal(_)), "{err}");
    assert_eq!(container.count(&ContainerCall::ForceKill), 3);
}

#[tokio::test(start_paused = true)]
async fn reassignment_while_waiting_for_update_releases_blobs() {
    let mut h = harness();
    let (ds, _) = h.running(topo("topo-1")).await;
    h.localizer
        .change_blob(BlobKey::new("topo-1".into(), BlobKind::Code));
    let notice = h.notices.recv().await.unwrap();
    let ds = h.step(ds.with_changing_blobs(vec![notice])).await;
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::WaitingForBlobUpdate);

    let ds = h.step(ds.with_new_assignment(Some(topo("topo-2")))).await;
    assert_eq!(ds.state(), MachineState::WaitingForBlobLocalization);
    assert!(ds.pending_changing_blobs().is_empty());
    assert!(ds.pending_changing_blobs_assignment().is_none());
    assert_eq!(h.localizer.release_count("topo-1", PORT), 1);
}

#[tokio::test(start_paused = true)]
async fn notices_for_other_topologies_are_acknowledged() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let (notice, latch) = h.notice(&topo("topo-9"));

    let ds = h.step(ds.with_changing_blobs(vec![notice])).await;

    assert_eq!(ds.state(), MachineState::Running);
    assert!(ds.changing_blobs().is_empty());
    assert_eq!(latch.remaining(), 0);
    assert!(container.calls().is_empty());
}

// Profiling

#[tokio::test(start_paused = true)]
async fn one_shot_profile_action_completes() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let dump = profile("topo-1", ProfileAction::HeapDump, 0);

    let ds = h.step(with_profiles(ds, &[dump.clone()])).await;

    assert!(ds.profile_actions().is_empty());
    assert!(ds.pending_stop_profile_actions().is_empty());
    assert_eq!(container.profiling_calls(), vec![(dump.request, false)]);
}

#[tokio::test(start_paused = true)]
async fn failed_profile_action_is_retried() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    container.set_profiling_succeeds(false);
    let dump = profile("topo-1", ProfileAction::StackDump, 0);

    let ds = h.step(with_profiles(ds, &[dump.clone()])).await;
    assert!(ds.profile_actions().contains(&dump));

    container.set_profiling_succeeds(true);
    container.set_heartbeat(Some(h.heartbeat()));
    let ds = h.step(ds).await;
    assert!(ds.profile_actions().is_empty());
    assert_eq!(container.profiling_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn timed_profiler_starts_then_stops() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let stop_at = h.clock.epoch_millis() + 10_000;
    let start = profile("topo-1", ProfileAction::StartProfiler, stop_at);

    let ds = h.step(with_profiles(ds, &[start.clone()])).await;
    assert!(ds.pending_stop_profile_actions().contains(&start));
    assert!(ds.profile_actions().contains(&start));

    // Before the stop time nothing more happens
    container.set_heartbeat(Some(h.heartbeat()));
    let ds = h.step(ds).await;
    assert_eq!(container.profiling_calls().len(), 1);

    h.clock.advance(Duration::from_secs(11));
    container.set_heartbeat(Some(h.heartbeat()));
    let ds = h.step(ds).await;
    assert!(ds.profile_actions().is_empty());
    assert!(ds.pending_stop_profile_actions().is_empty());
    assert_eq!(
        container.profiling_calls(),
        vec![(start.request.clone(), false), (start.request, true)]
    );
}

#[tokio::test(start_paused = true)]
async fn expired_and_foreign_profile_actions_are_dropped() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let expired = profile("topo-1", ProfileAction::StartProfiler, 1);
    let foreign = profile("topo-2", ProfileAction::HeapDump, 0);

    let ds = h.step(with_profiles(ds, &[expired, foreign])).await;

    assert!(ds.profile_actions().is_empty());
    assert!(container.profiling_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn relaunch_restarts_running_profilers() {
    let h = harness();
    let (ds, container) = h.running(topo("topo-1")).await;
    let start = profile(
        "topo-1",
        ProfileAction::StartProfiler,
        h.clock.epoch_millis() + 60_000,
    );
    let ds = h.step(with_profiles(ds, &[start.clone()])).await;
    assert!(ds.pending_stop_profile_actions().contains(&start));

    container.set_main_exited(true);
    let ds = h.step(ds).await;
    assert_eq!(ds.state(), MachineState::KillAndRelaunch);
    assert!(ds.profile_actions().contains(&start));
    assert!(ds.pending_stop_profile_actions().is_empty());
}

// Invariants

#[tokio::test(start_paused = true)]
async fn running_without_container_is_fatal() {
    let h = harness();
    let ds = DynamicState::empty(h.now()).with_state(MachineState::Running, h.now());

    let err = step(ds, &h.ss).await.unwrap_err();
    assert!(matches!(err, SlotError::InvariantViolation(_)));
}

#[tokio::test(start_paused = true)]
async fn every_visited_state_keeps_invariants() {
    let mut h = harness();
    let mut ds = DynamicState::empty(h.now()).with_new_assignment(Some(topo("topo-1")));

    for i in 0..40 {
        if let Some(container) = h.launcher.last() {
            container.set_heartbeat(Some(h.heartbeat()));
        }
        match i {
            10 => ds = ds.with_new_assignment(Some(topo("topo-2"))),
            20 => {
                h.localizer
                    .change_blob(BlobKey::new("topo-2".into(), BlobKind::Topology));
                let notice = h.notices.recv().await.unwrap();
                ds = ds.with_changing_blobs(vec![notice]);
            }
            30 => ds = ds.with_new_assignment(None),
            _ => {}
        }
        ds = h.step(ds).await;
        ds.validate().unwrap();
        assert_eq!(ds.container().is_none(), ds.current_assignment().is_none());
        assert_eq!(
            ds.pending_changing_blobs().is_empty(),
            ds.pending_changing_blobs_assignment().is_none()
        );
    }
    assert_eq!(ds.state(), MachineState::Empty);
}
