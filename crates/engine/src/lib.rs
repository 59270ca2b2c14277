// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
// Enable coverage(off) attribute for excluding test infrastructure
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Slot supervision engine: the per-port worker state machine and the node
//! agent that drives it

mod agent;
mod error;
mod metrics;
pub mod slot;

pub use agent::{AgentConfig, NodeAgent};
pub use error::{AgentError, SlotError};
pub use metrics::{CountingMetrics, KillReason, MetricsSnapshot, SlotMetrics};
pub use slot::{
    step, DynamicState, MachineState, PendingLocalization, Slot, SlotConfig, SlotDeps,
    SlotFailure, StaticState,
};
