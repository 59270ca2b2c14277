//! Agent restarts

use crate::prelude::*;

fn without_drain(node: &Node) -> AgentConfig {
    let mut config = node.config();
    config.drain_on_shutdown = false;
    config
}

#[tokio::test(start_paused = true)]
async fn restarted_agent_reattaches_to_running_worker() {
    let node = Node::new();
    node.assign(Some(topo()));
    let agent = node.start_with(without_drain(&node)).await;
    eventually("launch", || node.launcher.launch_count() == 1).await;
    let container = node.launcher.last().unwrap();
    container.set_heartbeat(Some(node.heartbeat()));
    let slot = agent.slot(PORT).unwrap();
    eventually("running", || slot.machine_state() == MachineState::Running).await;
    agent.shutdown().await.unwrap();

    node.launcher.add_recoverable(container.clone());
    let agent = node.start().await;

    let slot = agent.slot(PORT).unwrap();
    assert_eq!(slot.machine_state(), MachineState::Running);
    assert_eq!(slot.state().current_assignment(), Some(&topo()));
    assert_eq!(node.localizer.recover_count(), 1);
    assert_eq!(node.launcher.recovered(), vec![PORT]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(node.launcher.launch_count(), 1);
    assert!(container.calls().is_empty());
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn worker_lost_across_restart_is_launched_again() {
    let node = Node::new();
    node.local_state.set_assignment(PORT, Some(&topo())).unwrap();
    node.assign(Some(topo()));

    let agent = node.start().await;

    assert_eq!(node.localizer.recover_count(), 0);
    eventually("fresh launch", || node.launcher.launch_count() == 1).await;
    assert_eq!(node.launcher.launched()[0].1, topo());
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn recovered_worker_no_longer_assigned_is_stopped() {
    let node = Node::new();
    node.local_state.set_assignment(PORT, Some(&topo())).unwrap();
    let container = FakeContainer::new(PORT, "w-old");
    container.set_heartbeat(Some(node.heartbeat()));
    node.launcher.add_recoverable(container.clone());

    let agent = node.start().await;

    let slot = agent.slot(PORT).unwrap();
    eventually("empty", || slot.machine_state() == MachineState::Empty).await;
    assert_eq!(container.count(&ContainerCall::Kill), 1);
    assert!(node.local_state.assignment(PORT).is_none());
    agent.shutdown().await.unwrap();
}
