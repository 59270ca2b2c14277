// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Durable node-local state used for crash recovery
//!
//! Every change is appended to a write-ahead log as one JSON line, and the
//! log is replayed into a [`MaterializedState`] on startup.

mod local_state;
mod state;
mod wal;

pub use local_state::LocalState;
pub use state::{MaterializedState, Operation};
pub use wal::{Wal, WalError};
