//! Shared fixtures for the behavioral specs

pub use slotd_adapters::{
    ContainerCall, FakeClusterState, FakeContainer, FakeContainerLauncher, FakeLocalizer,
};
pub use slotd_core::{
    BlobKey, BlobKind, ExecutorInfo, FakeClock, LocalAssignment, Port, WorkerHeartbeat,
};
pub use slotd_engine::{
    AgentConfig, CountingMetrics, KillReason, MachineState, NodeAgent, SlotDeps, SlotMetrics,
};
pub use slotd_storage::LocalState;
pub use std::sync::Arc;
pub use std::time::Duration;

use tempfile::TempDir;

pub const NODE: &str = "node-a";
pub const PORT: Port = 6700;

pub type TestAgent = NodeAgent<FakeLocalizer, FakeContainerLauncher, FakeClusterState, FakeClock>;

/// One simulated node: the cluster's view of it plus everything its agent
/// talks to
pub struct Node {
    pub cluster: FakeClusterState,
    pub localizer: FakeLocalizer,
    pub launcher: FakeContainerLauncher,
    pub clock: FakeClock,
    pub metrics: Arc<CountingMetrics>,
    pub local_state: LocalState,
    _dir: TempDir,
}

impl Node {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let local_state = LocalState::open(&dir.path().join("local-state.wal")).unwrap();
        Self {
            cluster: FakeClusterState::new(),
            localizer: FakeLocalizer::new(),
            launcher: FakeContainerLauncher::new(),
            clock: FakeClock::new(),
            metrics: Arc::new(CountingMetrics::new()),
            local_state,
            _dir: dir,
        }
    }

    pub fn config(&self) -> AgentConfig {
        AgentConfig::new(NODE, NODE, vec![PORT])
    }

    pub async fn start(&self) -> TestAgent {
        self.start_with(self.config()).await
    }

    pub async fn start_with(&self, config: AgentConfig) -> TestAgent {
        let metrics: Arc<dyn SlotMetrics> = self.metrics.clone();
        let deps = SlotDeps {
            localizer: self.localizer.clone(),
            launcher: self.launcher.clone(),
            cluster_state: self.cluster.clone(),
            local_state: self.local_state.clone(),
            metrics,
            clock: self.clock.clone(),
        };
        NodeAgent::start(config, deps).await.unwrap()
    }

    pub fn assign(&self, assignment: Option<LocalAssignment>) {
        self.cluster.set_assignment(NODE, PORT, assignment);
    }

    /// A heartbeat written now by a worker of `topo-1`
    pub fn heartbeat(&self) -> WorkerHeartbeat {
        WorkerHeartbeat {
            time_secs: self.clock.epoch_secs(),
            topology_id: "topo-1".into(),
            executors: topo().executors,
            port: PORT,
        }
    }

    /// Start an agent and bring the assigned topology to `Running`
    pub async fn running(&self) -> (TestAgent, FakeContainer) {
        self.assign(Some(topo()));
        let agent = self.start().await;
        eventually("launch", || self.launcher.launch_count() == 1).await;
        let container = self.launcher.last().unwrap();
        container.set_heartbeat(Some(self.heartbeat()));
        let slot = agent.slot(PORT).unwrap();
        eventually("running", || slot.machine_state() == MachineState::Running).await;
        (agent, container)
    }
}

pub fn topo() -> LocalAssignment {
    LocalAssignment::new(
        "topo-1",
        "alice",
        vec![ExecutorInfo::new(1, 4), ExecutorInfo::new(5, 8)],
    )
}

/// Poll `condition` on paused time, failing after 20 simulated seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}
