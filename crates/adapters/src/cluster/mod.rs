// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster state: what the coordinator publishes for this node

mod dir;

pub use dir::DirClusterState;

#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeClusterState;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slotd_core::{LocalAssignment, Port, TopoProfileAction};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterStateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cluster state unavailable: {0}")]
    Unavailable(String),
}

/// Liveness record the node publishes on every heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub host: String,
    pub time_secs: u64,
    pub uptime_secs: u64,
    /// All configured slot ports
    pub ports: Vec<Port>,
    /// Ports currently running a worker
    pub used_ports: Vec<Port>,
}

/// Client for the cluster-wide coordination store
#[async_trait]
pub trait ClusterState: Clone + Send + Sync + 'static {
    /// Assignment snapshot for a node, keyed by port
    async fn assignments_for(
        &self,
        node_id: &str,
    ) -> Result<BTreeMap<Port, LocalAssignment>, ClusterStateError>;

    /// Outstanding profiling requests addressed to a host
    async fn profile_requests_for(
        &self,
        host: &str,
    ) -> Result<Vec<TopoProfileAction>, ClusterStateError>;

    async fn delete_profile_request(
        &self,
        action: &TopoProfileAction,
    ) -> Result<(), ClusterStateError>;

    async fn heartbeat_node(&self, heartbeat: &NodeHeartbeat) -> Result<(), ClusterStateError>;
}
