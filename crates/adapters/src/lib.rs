// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
// Enable coverage(off) attribute for excluding test infrastructure
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Adapters for the collaborators a slot talks to: worker containers, the
//! blob localizer and the cluster state store

pub mod cluster;
pub mod container;
pub mod localizer;
pub mod traced;

pub use cluster::{ClusterState, ClusterStateError, DirClusterState, NodeHeartbeat};
pub use container::{
    Container, ContainerError, ContainerHandle, ContainerLauncher, ProcessContainer,
    ProcessLauncher, ProcessLauncherConfig, ProcessMetrics,
};
pub use localizer::{
    BlobChangeAck, BlobChangeCallback, BlobChanging, BlobSource, ChangeLatch, DirBlobSource,
    DiskLocalizer, DownloadResolver, Localizer, LocalizerError, PendingDownload,
};
pub use traced::{TracedClusterState, TracedContainer, TracedContainerLauncher, TracedLocalizer};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
pub use cluster::FakeClusterState;
#[cfg(any(test, feature = "test-support"))]
pub use container::{ContainerCall, FakeContainer, FakeContainerLauncher};
#[cfg(any(test, feature = "test-support"))]
pub use localizer::{FakeLocalizer, LocalizerCall};
