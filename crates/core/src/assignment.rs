// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local assignments: what the coordinator wants running in one slot
//!
//! Slots compare assignments by *equivalence* (topology, executor set,
//! resources) rather than by full equality, so that cosmetic changes such
//! as a new owner never restart a worker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a topology (a deployed stream-processing job)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyId(pub String);

impl std::fmt::Display for TopologyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TopologyId {
    fn from(s: String) -> Self {
        TopologyId(s)
    }
}

impl From<&str> for TopologyId {
    fn from(s: &str) -> Self {
        TopologyId(s.to_string())
    }
}

/// A contiguous, inclusive range of task ids run by one executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub task_start: u32,
    pub task_end: u32,
}

impl ExecutorInfo {
    pub fn new(task_start: u32, task_end: u32) -> Self {
        Self {
            task_start,
            task_end,
        }
    }
}

impl std::fmt::Display for ExecutorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.task_start, self.task_end)
    }
}

/// Resource limits granted to a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    #[serde(default)]
    pub mem_on_heap_mb: f64,
    #[serde(default)]
    pub mem_off_heap_mb: f64,
    /// CPU share in percent of one core
    #[serde(default)]
    pub cpu: f64,
}

impl WorkerResources {
    pub fn total_memory_mb(&self) -> f64 {
        self.mem_on_heap_mb + self.mem_off_heap_mb
    }
}

/// The desired state of one slot, as decided by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAssignment {
    pub topology_id: TopologyId,
    pub owner: String,
    pub executors: Vec<ExecutorInfo>,
    #[serde(default)]
    pub resources: Option<WorkerResources>,
}

impl LocalAssignment {
    pub fn new(
        topology_id: impl Into<TopologyId>,
        owner: impl Into<String>,
        executors: Vec<ExecutorInfo>,
    ) -> Self {
        Self {
            topology_id: topology_id.into(),
            owner: owner.into(),
            executors,
            resources: None,
        }
    }

    pub fn with_resources(mut self, resources: WorkerResources) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Executors as an order-insensitive set
    pub fn executor_set(&self) -> BTreeSet<ExecutorInfo> {
        self.executors.iter().copied().collect()
    }

    /// Same topology, same executors and same resources.
    pub fn is_equivalent(&self, other: &LocalAssignment) -> bool {
        self.topology_id == other.topology_id
            && self.resources == other.resources
            && self.executor_set() == other.executor_set()
    }

    pub fn is_same_topology(&self, other: &LocalAssignment) -> bool {
        self.topology_id == other.topology_id
    }

    /// Memory limit in MB, if resources were granted
    pub fn memory_limit_mb(&self) -> Option<f64> {
        self.resources
            .map(|r| r.total_memory_mb())
            .filter(|mb| *mb > 0.0)
    }
}

/// Equivalence over optional assignments; two absent assignments are equivalent.
pub fn equivalent(a: Option<&LocalAssignment>, b: Option<&LocalAssignment>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.is_equivalent(b),
        _ => false,
    }
}

/// True when both assignments exist and run the same topology
pub fn same_topology(a: Option<&LocalAssignment>, b: Option<&LocalAssignment>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is_same_topology(b),
        _ => false,
    }
}

#[cfg(test)]
#[path = "assignment_tests.rs"]
mod tests;
