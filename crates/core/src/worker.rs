// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker heartbeats

use crate::assignment::{ExecutorInfo, TopologyId};
use serde::{Deserialize, Serialize};

/// Liveness record a worker writes about itself.
///
/// Workers stamp the record with wall-clock seconds, so staleness is
/// measured against [`crate::Clock::epoch_millis`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub time_secs: u64,
    pub topology_id: TopologyId,
    #[serde(default)]
    pub executors: Vec<ExecutorInfo>,
    pub port: u16,
}

impl WorkerHeartbeat {
    /// Age of the heartbeat at `now_millis`; heartbeats from the future are age zero
    pub fn age_millis(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.time_secs.saturating_mul(1000))
    }

    pub fn is_fresh(&self, now_millis: u64, timeout_millis: u64) -> bool {
        self.age_millis(now_millis) <= timeout_millis
    }
}
