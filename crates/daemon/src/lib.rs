// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! slotd daemon: configuration and lifecycle for the node agent

pub mod config;
pub mod lifecycle;

pub use config::{Config, ConfigError};
pub use lifecycle::{startup, Daemon, DaemonAgent, LifecycleError};

/// Process exit code when a slot fails fatally
pub const FATAL_EXIT_CODE: i32 = 20;
