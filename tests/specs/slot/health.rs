//! Worker health monitoring

use crate::prelude::*;

#[tokio::test(start_paused = true)]
async fn stale_heartbeat_relaunches_worker() {
    let node = Node::new();
    let (agent, container) = node.running().await;

    node.clock.advance(Duration::from_secs(31));
    eventually("relaunch", || {
        container.count(&ContainerCall::Relaunch) == 1
    })
    .await;
    assert_eq!(
        node.metrics.snapshot().killed_for(KillReason::HeartbeatTimeout),
        1
    );

    container.set_heartbeat(Some(node.heartbeat()));
    let slot = agent.slot(PORT).unwrap();
    eventually("running again", || {
        slot.machine_state() == MachineState::Running
    })
    .await;

    let snapshot = node.metrics.snapshot();
    assert_eq!(snapshot.killed_for(KillReason::HeartbeatTimeout), 1);
    assert_eq!(snapshot.relaunched, 1);
    assert_eq!(node.launcher.launch_count(), 1);
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exited_worker_is_relaunched_in_place() {
    let node = Node::new();
    let (agent, container) = node.running().await;

    container.set_main_exited(true);
    eventually("relaunch", || {
        container.count(&ContainerCall::Relaunch) == 1
    })
    .await;

    assert_eq!(
        node.metrics.snapshot().killed_for(KillReason::ProcessExit),
        1
    );
    assert_eq!(node.localizer.release_count("topo-1", PORT), 0);
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn worker_that_never_starts_is_relaunched() {
    let node = Node::new();
    node.assign(Some(topo()));
    let agent = node.start().await;
    eventually("launch", || node.launcher.launch_count() == 1).await;
    let container = node.launcher.last().unwrap();

    node.clock.advance(Duration::from_secs(121));
    eventually("relaunch", || {
        container.count(&ContainerCall::Relaunch) == 1
    })
    .await;

    assert_eq!(node.metrics.snapshot().start_timeouts, 1);
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn worker_that_will_not_die_is_fatal_once() {
    let node = Node::new();
    let (mut agent, container) = node.running().await;
    container.set_unkillable(true);
    container.set_heartbeat(None);

    let slot = agent.slot(PORT).unwrap();
    eventually("relaunch kill", || {
        slot.machine_state() == MachineState::KillAndRelaunch
    })
    .await;
    node.clock.advance(Duration::from_secs(121));

    let failure = agent.next_failure().await.unwrap();
    assert_eq!(failure.port, PORT);
    assert!(failure.error.is_fatal());
    assert!(agent.next_failure().await.is_none());
}
