// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Profiling requests addressed to a worker

use crate::assignment::TopologyId;
use serde::{Deserialize, Serialize};

/// What the profiler should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileAction {
    /// Start profiling and keep it running until the request's stop time
    StartProfiler,
    DumpProfile,
    HeapDump,
    StackDump,
    RestartWorker,
}

impl ProfileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileAction::StartProfiler => "start",
            ProfileAction::DumpProfile => "dump",
            ProfileAction::HeapDump => "heap-dump",
            ProfileAction::StackDump => "stack-dump",
            ProfileAction::RestartWorker => "restart",
        }
    }

    /// Whether the action stays active until an explicit stop
    pub fn is_timed(&self) -> bool {
        matches!(self, ProfileAction::StartProfiler)
    }
}

impl std::fmt::Display for ProfileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single profiling request for a worker on `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub host: String,
    pub port: u16,
    pub action: ProfileAction,
    /// For timed actions, the wall-clock millis at which to stop
    #[serde(default)]
    pub stop_at_millis: u64,
}

/// A profiling request scoped to the topology it was issued for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopoProfileAction {
    pub topology_id: TopologyId,
    pub request: ProfileRequest,
}

impl TopoProfileAction {
    pub fn is_time_to_stop(&self, now_millis: u64) -> bool {
        now_millis > self.request.stop_at_millis
    }
}

impl std::fmt::Display for TopoProfileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} on {}:{}",
            self.request.action, self.topology_id, self.request.host, self.request.port
        )
    }
}
