//! Blob updates under a running worker

use crate::prelude::*;

#[tokio::test(start_paused = true)]
async fn blob_change_restarts_worker_on_new_blobs() {
    let node = Node::new();
    let (agent, container) = node.running().await;

    let latch = node
        .localizer
        .change_blob(BlobKey::new("topo-1".into(), BlobKind::Code));
    eventually("worker restarted", || node.launcher.launch_count() == 2).await;

    assert_eq!(latch.remaining(), 0);
    assert_eq!(container.count(&ContainerCall::Kill), 1);
    assert_eq!(container.count(&ContainerCall::CleanUp), 1);
    assert_eq!(
        node.metrics.snapshot().killed_for(KillReason::BlobChanged),
        1
    );
    // The slot keeps its blob references across the update
    assert_eq!(node.localizer.release_count("topo-1", PORT), 0);
    assert_eq!(
        agent.slot(PORT).unwrap().state().current_assignment(),
        Some(&topo())
    );
    agent.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn blob_change_for_unrelated_topology_leaves_worker_alone() {
    let node = Node::new();
    let (agent, container) = node.running().await;

    let latch = node
        .localizer
        .change_blob(BlobKey::new("topo-9".into(), BlobKind::Conf));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(latch.remaining(), 0);
    assert!(container.calls().is_empty());
    agent.shutdown().await.unwrap();
}
