// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot metrics sink

use slotd_core::Port;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Why a slot killed its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KillReason {
    AssignmentChanged,
    BlobChanged,
    ProcessExit,
    MemoryViolation,
    HeartbeatTimeout,
    HeartbeatMissing,
}

impl KillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillReason::AssignmentChanged => "assignment-changed",
            KillReason::BlobChanged => "blob-changed",
            KillReason::ProcessExit => "process-exit",
            KillReason::MemoryViolation => "memory-violation",
            KillReason::HeartbeatTimeout => "heartbeat-timeout",
            KillReason::HeartbeatMissing => "heartbeat-missing",
        }
    }

    /// Internal failures restart the same assignment in place
    pub fn relaunches(&self) -> bool {
        !matches!(self, KillReason::AssignmentChanged | KillReason::BlobChanged)
    }
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters every slot reports into
pub trait SlotMetrics: Send + Sync {
    fn worker_launched(&self, port: Port);

    fn worker_relaunched(&self, port: Port);

    fn worker_killed(&self, port: Port, reason: KillReason);

    fn force_kill(&self, port: Port);

    /// A launched worker never sent its first heartbeat
    fn worker_start_timed_out(&self, port: Port);

    fn worker_memory(&self, port: Port, rss_mb: f64);

    fn snapshot(&self) -> MetricsSnapshot;
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub launched: u64,
    pub relaunched: u64,
    pub killed: BTreeMap<KillReason, u64>,
    pub force_kills: u64,
    pub start_timeouts: u64,
    /// Last resident memory sample per port
    pub memory_mb: BTreeMap<Port, f64>,
}

impl MetricsSnapshot {
    pub fn killed_for(&self, reason: KillReason) -> u64 {
        self.killed.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_killed(&self) -> u64 {
        self.killed.values().sum()
    }
}

/// In-process [`SlotMetrics`] backed by atomic counters
#[derive(Default)]
pub struct CountingMetrics {
    launched: AtomicU64,
    relaunched: AtomicU64,
    force_kills: AtomicU64,
    start_timeouts: AtomicU64,
    killed: Mutex<BTreeMap<KillReason, u64>>,
    memory_mb: Mutex<BTreeMap<Port, f64>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SlotMetrics for CountingMetrics {
    fn worker_launched(&self, _port: Port) {
        self.launched.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_relaunched(&self, _port: Port) {
        self.relaunched.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_killed(&self, _port: Port, reason: KillReason) {
        let mut killed = self.killed.lock().unwrap_or_else(|e| e.into_inner());
        *killed.entry(reason).or_insert(0) += 1;
    }

    fn force_kill(&self, _port: Port) {
        self.force_kills.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_start_timed_out(&self, _port: Port) {
        self.start_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_memory(&self, port: Port, rss_mb: f64) {
        self.memory_mb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port, rss_mb);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            launched: self.launched.load(Ordering::Relaxed),
            relaunched: self.relaunched.load(Ordering::Relaxed),
            killed: self.killed.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            force_kills: self.force_kills.load(Ordering::Relaxed),
            start_timeouts: self.start_timeouts.load(Ordering::Relaxed),
            memory_mb: self
                .memory_mb
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
