// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state from WAL replay

use serde::{Deserialize, Serialize};
use slotd_core::{LocalAssignment, Port, WorkerId};
use std::collections::BTreeMap;

/// A single durable change to local state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    AssignmentSet {
        port: Port,
        assignment: LocalAssignment,
    },
    AssignmentCleared {
        port: Port,
    },
    WorkerRegistered {
        worker_id: WorkerId,
        port: Port,
    },
    WorkerRemoved {
        worker_id: WorkerId,
    },
}

/// Local state built from WAL operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterializedState {
    /// Assignment each slot was last confirmed running
    pub assignments: BTreeMap<Port, LocalAssignment>,
    /// Worker processes launched by this node and the port each one serves
    pub workers: BTreeMap<WorkerId, Port>,
}

impl MaterializedState {
    /// Apply an operation to update the state
    pub fn apply(&mut self, op: &Operation) {
        match op {
            Operation::AssignmentSet { port, assignment } => {
                self.assignments.insert(*port, assignment.clone());
            }

            Operation::AssignmentCleared { port } => {
                self.assignments.remove(port);
            }

            Operation::WorkerRegistered { worker_id, port } => {
                // One worker per port: a new registration replaces the old one
                self.workers.retain(|_, p| p != port);
                self.workers.insert(worker_id.clone(), *port);
            }

            Operation::WorkerRemoved { worker_id } => {
                self.workers.remove(worker_id);
            }
        }
    }

    /// Worker registered for a port, if any
    pub fn worker_for_port(&self, port: Port) -> Option<&WorkerId> {
        self.workers
            .iter()
            .find(|(_, p)| **p == port)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
