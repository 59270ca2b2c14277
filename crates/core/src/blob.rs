// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Blob naming
//!
//! Every topology ships three blobs: its code bundle, its serialized
//! configuration and its serialized topology graph.

use crate::assignment::TopologyId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Code,
    Conf,
    Topology,
}

impl BlobKind {
    pub const ALL: [BlobKind; 3] = [BlobKind::Code, BlobKind::Conf, BlobKind::Topology];

    pub fn file_name(&self) -> &'static str {
        match self {
            BlobKind::Code => "code.bin",
            BlobKind::Conf => "conf.json",
            BlobKind::Topology => "topology.bin",
        }
    }
}

impl std::fmt::Display for BlobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobKind::Code => f.write_str("code"),
            BlobKind::Conf => f.write_str("conf"),
            BlobKind::Topology => f.write_str("topology"),
        }
    }
}

/// Key of one blob in the remote blob store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey {
    pub topology_id: TopologyId,
    pub kind: BlobKind,
}

impl BlobKey {
    pub fn new(topology_id: TopologyId, kind: BlobKind) -> Self {
        Self { topology_id, kind }
    }

    /// The three blobs a topology needs
    pub fn all_for(topology_id: &TopologyId) -> Vec<BlobKey> {
        BlobKind::ALL
            .iter()
            .map(|kind| BlobKey::new(topology_id.clone(), *kind))
            .collect()
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topology_id, self.kind)
    }
}
