// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for slots and the node agent

use slotd_adapters::{ClusterStateError, ContainerError, LocalizerError};
use slotd_core::Port;
use slotd_storage::WalError;
use thiserror::Error;

/// Errors raised while stepping a slot.
///
/// Container and localizer failures are retried by the slot loop; the rest
/// stop the slot.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("{0}")]
    Fatal(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("local state error: {0}")]
    Storage(#[from] WalError),
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
    #[error("localizer error: {0}")]
    Localizer(#[from] LocalizerError),
}

impl SlotError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SlotError::Fatal(_)
                | SlotError::InvariantViolation(_)
                | SlotError::Storage(_)
                | SlotError::Container(ContainerError::Storage(_))
        )
    }
}

/// Errors from the node agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("slot {port} failed to start: {source}")]
    Slot {
        port: Port,
        #[source]
        source: SlotError,
    },
    #[error("local state error: {0}")]
    Storage(#[from] WalError),
    #[error("cluster state error: {0}")]
    ClusterState(#[from] ClusterStateError),
    #[error("localizer error: {0}")]
    Localizer(#[from] LocalizerError),
    #[error("no slot for port {0}")]
    UnknownPort(Port),
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
