// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node-local persisted state shared by every slot
//!
//! All slots on a node write through one [`LocalState`]; a single mutex
//! serializes the WAL append with the in-memory update so readers never see
//! a change that is not yet durable.

use crate::state::{MaterializedState, Operation};
use crate::wal::{Wal, WalError};
use slotd_core::{LocalAssignment, Port, WorkerId};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Entries written before the log is folded into a snapshot
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

struct Inner {
    wal: Wal,
    state: MaterializedState,
    compact_threshold: u64,
}

impl Inner {
    fn write(&mut self, op: Operation) -> Result<(), WalError> {
        self.wal.append(&op)?;
        self.state.apply(&op);
        if self.wal.sequence() >= self.compact_threshold {
            self.wal.compact(&self.state)?;
        }
        Ok(())
    }
}

/// Shared handle to the persisted port -> assignment and worker -> port maps
#[derive(Clone)]
pub struct LocalState {
    inner: Arc<Mutex<Inner>>,
}

impl LocalState {
    /// Open the state stored at `path`, replaying any existing log
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let state = Wal::load(path)?;
        let wal = Wal::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                wal,
                state,
                compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            })),
        })
    }

    pub fn with_compact_threshold(self, threshold: u64) -> Self {
        self.lock().compact_threshold = threshold.max(1);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of all persisted assignments
    pub fn assignments(&self) -> BTreeMap<Port, LocalAssignment> {
        self.lock().state.assignments.clone()
    }

    pub fn assignment(&self, port: Port) -> Option<LocalAssignment> {
        self.lock().state.assignments.get(&port).cloned()
    }

    /// Record the assignment a slot is running, or clear it with `None`.
    ///
    /// Writes nothing when the stored value already matches.
    pub fn set_assignment(
        &self,
        port: Port,
        assignment: Option<&LocalAssignment>,
    ) -> Result<(), WalError> {
        let mut inner = self.lock();
        let current = inner.state.assignments.get(&port);
        if current == assignment {
            return Ok(());
        }
        let op = match assignment {
            Some(assignment) => Operation::AssignmentSet {
                port,
                assignment: assignment.clone(),
            },
            None => Operation::AssignmentCleared { port },
        };
        inner.write(op)
    }

    pub fn register_worker(&self, worker_id: &WorkerId, port: Port) -> Result<(), WalError> {
        self.lock().write(Operation::WorkerRegistered {
            worker_id: worker_id.clone(),
            port,
        })
    }

    pub fn remove_worker(&self, worker_id: &WorkerId) -> Result<(), WalError> {
        let mut inner = self.lock();
        if !inner.state.workers.contains_key(worker_id) {
            return Ok(());
        }
        inner.write(Operation::WorkerRemoved {
            worker_id: worker_id.clone(),
        })
    }

    pub fn worker_for_port(&self, port: Port) -> Option<WorkerId> {
        self.lock().state.worker_for_port(port).cloned()
    }

    /// Snapshot of all registered workers
    pub fn workers(&self) -> BTreeMap<WorkerId, Port> {
        self.lock().state.workers.clone()
    }
}

#[cfg(test)]
#[path = "local_state_tests.rs"]
mod tests;
