// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clock abstraction for testable time handling
//!
//! Slots measure time-in-state with the monotonic [`Clock::now`] and compare
//! worker heartbeats, which are written by other processes, against
//! [`Clock::epoch_millis`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A clock that provides the current time
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the unix epoch
    fn epoch_millis(&self) -> u64;
}

/// Real system clock
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Clone, Copy)]
struct FakeTime {
    instant: Instant,
    epoch_millis: u64,
}

/// Fake clock for testing with controllable time
///
/// Both the monotonic and the wall-clock readings move together when the
/// clock is advanced.
#[derive(Clone)]
pub struct FakeClock {
    current: Arc<Mutex<FakeTime>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(FakeTime {
                instant: Instant::now(),
                epoch_millis: 1_700_000_000_000,
            })),
        }
    }

    /// Advance the clock by the given duration
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.instant += duration;
        current.epoch_millis += duration.as_millis() as u64;
    }

    /// Wall-clock seconds since the unix epoch, as workers report them
    pub fn epoch_secs(&self) -> u64 {
        self.epoch_millis() / 1000
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).instant
    }

    fn epoch_millis(&self) -> u64 {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .epoch_millis
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
