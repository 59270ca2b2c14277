// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake cluster state for testing
#![cfg_attr(coverage_nightly, coverage(off))]

use super::{ClusterState, ClusterStateError, NodeHeartbeat};
use async_trait::async_trait;
use slotd_core::{LocalAssignment, Port, TopoProfileAction};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeClusterInner {
    assignments: BTreeMap<String, BTreeMap<Port, LocalAssignment>>,
    profiles: Vec<TopoProfileAction>,
    deleted: Vec<TopoProfileAction>,
    heartbeats: Vec<NodeHeartbeat>,
    unavailable: bool,
}

/// In-memory cluster state
#[derive(Clone, Default)]
pub struct FakeClusterState {
    inner: Arc<Mutex<FakeClusterInner>>,
}

impl FakeClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, FakeClusterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_assignment(&self, node_id: &str, port: Port, assignment: Option<LocalAssignment>) {
        let mut inner = self.inner();
        let node = inner.assignments.entry(node_id.to_string()).or_default();
        match assignment {
            Some(assignment) => {
                node.insert(port, assignment);
            }
            None => {
                node.remove(&port);
            }
        }
    }

    pub fn add_profile_request(&self, action: TopoProfileAction) {
        self.inner().profiles.push(action);
    }

    /// Requests deleted through [`ClusterState::delete_profile_request`]
    pub fn deleted(&self) -> Vec<TopoProfileAction> {
        self.inner().deleted.clone()
    }

    pub fn heartbeats(&self) -> Vec<NodeHeartbeat> {
        self.inner().heartbeats.clone()
    }

    /// Make every call fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner().unavailable = unavailable;
    }

    fn check(&self) -> Result<(), ClusterStateError> {
        if self.inner().unavailable {
            return Err(ClusterStateError::Unavailable("injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterState for FakeClusterState {
    async fn assignments_for(
        &self,
        node_id: &str,
    ) -> Result<BTreeMap<Port, LocalAssignment>, ClusterStateError> {
        self.check()?;
        Ok(self
            .inner()
            .assignments
            .get(node_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn profile_requests_for(
        &self,
        host: &str,
    ) -> Result<Vec<TopoProfileAction>, ClusterStateError> {
        self.check()?;
        Ok(self
            .inner()
            .profiles
            .iter()
            .filter(|a| a.request.host == host)
            .cloned()
            .collect())
    }

    async fn delete_profile_request(
        &self,
        action: &TopoProfileAction,
    ) -> Result<(), ClusterStateError> {
        self.check()?;
        let mut inner = self.inner();
        inner.profiles.retain(|a| a != action);
        inner.deleted.push(action.clone());
        Ok(())
    }

    async fn heartbeat_node(&self, heartbeat: &NodeHeartbeat) -> Result<(), ClusterStateError> {
        self.check()?;
        self.inner().heartbeats.push(heartbeat.clone());
        Ok(())
    }
}
