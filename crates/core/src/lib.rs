// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! slotd-core: shared data types for the slot supervisor
//!
//! This crate provides:
//! - Assignments and their equivalence rules
//! - Worker heartbeats, profiling requests and blob naming
//! - Clock and id abstractions so time and identity are testable

pub mod assignment;
pub mod blob;
pub mod clock;
pub mod id;
pub mod profile;
pub mod worker;

pub use assignment::{
    equivalent, same_topology, ExecutorInfo, LocalAssignment, TopologyId, WorkerResources,
};
pub use blob::{BlobKey, BlobKind};
pub use clock::{Clock, FakeClock, SystemClock};
pub use id::{IdGen, SequentialIdGen, UuidIdGen, WorkerId};
pub use profile::{ProfileAction, ProfileRequest, TopoProfileAction};
pub use worker::WorkerHeartbeat;

/// A slot is identified by the port it reserves on the node
pub type Port = u16;
