//! Agent shutdown

use crate::prelude::*;

#[tokio::test(start_paused = true)]
async fn draining_shutdown_leaves_a_clean_node() {
    let node = Node::new();
    let (agent, container) = node.running().await;

    agent.shutdown().await.unwrap();

    assert!(!container.is_alive());
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert!(node.localizer.references("topo-1").is_empty());
    assert!(node.local_state.assignment(PORT).is_none());
}

#[tokio::test(start_paused = true)]
async fn draining_shutdown_releases_an_in_flight_download() {
    let node = Node::new();
    node.localizer.hold_downloads(true);
    node.assign(Some(topo()));
    let agent = node.start().await;
    let slot = agent.slot(PORT).unwrap();
    eventually("downloading", || {
        slot.machine_state() == MachineState::WaitingForBlobLocalization
    })
    .await;

    agent.shutdown().await.unwrap();

    assert_eq!(node.launcher.launch_count(), 0);
    assert_eq!(node.localizer.release_count("topo-1", PORT), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_without_drain_keeps_workers_for_the_next_agent() {
    let node = Node::new();
    node.assign(Some(topo()));
    let mut config = node.config();
    config.drain_on_shutdown = false;
    let agent = node.start_with(config).await;
    eventually("launch", || node.launcher.launch_count() == 1).await;
    let container = node.launcher.last().unwrap();

    agent.shutdown().await.unwrap();

    assert!(container.is_alive());
    assert!(container.calls().is_empty());
    assert_eq!(node.local_state.assignment(PORT), Some(topo()));
}
