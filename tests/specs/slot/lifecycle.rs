//! Assignment-driven slot transitions

use crate::prelude::*;

#[tokio::test(start_paused = true)]
async fn assigned_slot_reaches_running() {
    let node = Node::new();
    let (agent, _container) = node.running().await;

    let slot = agent.slot(PORT).unwrap();
    assert_eq!(slot.state().current_assignment(), Some(&topo()));
    assert_eq!(node.local_state.assignment(PORT), Some(topo()));
    assert_eq!(node.metrics.snapshot().launched, 1);
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reassignment_kills_once_and_releases_once() {
    let node = Node::new();
    let (agent, old) = node.running().await;
    let other = LocalAssignment::new("topo-2", "bob", vec![ExecutorInfo::new(1, 2)]);

    node.assign(Some(other.clone()));
    agent.sync_once().await.unwrap();

    let slot = agent.slot(PORT).unwrap();
    eventually("new worker", || {
        slot.state().current_assignment() == Some(&other)
    })
    .await;
    assert!(matches!(
        slot.machine_state(),
        MachineState::WaitingForWorkerStart | MachineState::Running
    ));
    assert_eq!(old.count(&ContainerCall::Kill), 1);
    assert_eq!(node.localizer.release_count("topo-1", PORT), 1);
    assert_eq!(node.launcher.launch_count(), 2);
    assert_eq!(node.local_state.assignment(PORT), Some(other));
    assert_eq!(
        node.metrics.snapshot().killed_for(KillReason::AssignmentChanged),
        1
    );
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn equivalent_assignments_never_restart() {
    let node = Node::new();
    let (agent, container) = node.running().await;
    let mut reordered = topo();
    reordered.executors.reverse();

    for assignment in [reordered, topo()].into_iter().cycle().take(6) {
        node.assign(Some(assignment));
        agent.sync_once().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    assert!(container.calls().is_empty());
    assert_eq!(node.launcher.launch_count(), 1);
    assert_eq!(
        agent.slot(PORT).unwrap().machine_state(),
        MachineState::Running
    );
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unassigned_slot_stops_its_worker() {
    let node = Node::new();
    let (agent, container) = node.running().await;

    node.assign(None);
    agent.sync_once().await.unwrap();

    let slot = agent.slot(PORT).unwrap();
    eventually("empty", || slot.machine_state() == MachineState::Empty).await;
    assert!(!container.is_alive());
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert!(node.local_state.assignment(PORT).is_none());
    assert!(node.localizer.references("topo-1").is_empty());
    agent.shutdown().await.unwrap();
}
