// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Directory-backed cluster state
//!
//! Layout under the root:
//! - `assignments/<node_id>.json`: map of port to assignment
//! - `profiles/<host>.json`: list of profiling requests
//! - `heartbeats/<node_id>.json`: the node's latest heartbeat

use super::{ClusterState, ClusterStateError, NodeHeartbeat};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slotd_core::{LocalAssignment, Port, TopoProfileAction};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct DirClusterState {
    root: PathBuf,
    /// Serializes read-modify-write of profile files
    write_lock: Arc<Mutex<()>>,
}

impl DirClusterState {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn assignments_path(&self, node_id: &str) -> PathBuf {
        self.root.join("assignments").join(format!("{}.json", node_id))
    }

    fn profiles_path(&self, host: &str) -> PathBuf {
        self.root.join("profiles").join(format!("{}.json", host))
    }

    fn heartbeat_path(&self, node_id: &str) -> PathBuf {
        self.root.join("heartbeats").join(format!("{}.json", node_id))
    }
}

async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ClusterStateError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write via a temp file and rename so readers never see a partial file
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ClusterStateError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ClusterState for DirClusterState {
    async fn assignments_for(
        &self,
        node_id: &str,
    ) -> Result<BTreeMap<Port, LocalAssignment>, ClusterStateError> {
        read_json(&self.assignments_path(node_id)).await
    }

    async fn profile_requests_for(
        &self,
        host: &str,
    ) -> Result<Vec<TopoProfileAction>, ClusterStateError> {
        read_json(&self.profiles_path(host)).await
    }

    async fn delete_profile_request(
        &self,
        action: &TopoProfileAction,
    ) -> Result<(), ClusterStateError> {
        let _guard = self.write_lock.lock().await;
        let path = self.profiles_path(&action.request.host);
        let mut requests: Vec<TopoProfileAction> = read_json(&path).await?;
        let before = requests.len();
        requests.retain(|r| r != action);
        if requests.len() != before {
            write_json(&path, &requests).await?;
        }
        Ok(())
    }

    async fn heartbeat_node(&self, heartbeat: &NodeHeartbeat) -> Result<(), ClusterStateError> {
        write_json(&self.heartbeat_path(&heartbeat.node_id), heartbeat).await
    }
}

#[cfg(test)]
#[path = "dir_tests.rs"]
mod tests;
