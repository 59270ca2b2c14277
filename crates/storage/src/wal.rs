// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Write-ahead log for durable storage
//!
//! The log lives at `<path>` and an optional compacted snapshot at
//! `<path>.snapshot`. Loading reads the snapshot first and replays the log
//! on top of it; all operations are idempotent, so a crash between writing
//! the snapshot and truncating the log is harmless.

use crate::state::{MaterializedState, Operation};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur in WAL operations
#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write-ahead log for durable operation storage
pub struct Wal {
    path: PathBuf,
    file: File,
    sequence: u64,
}

impl Wal {
    /// Open or create a WAL at the given path
    pub fn open(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;

        // Count existing entries to set sequence number
        let reader = BufReader::new(File::open(path)?);
        let sequence = reader.lines().count() as u64;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            sequence,
        })
    }

    /// Append an operation to the log
    pub fn append(&mut self, op: &Operation) -> Result<u64, WalError> {
        self.sequence += 1;
        let entry = WalEntry {
            seq: self.sequence,
            op: op.clone(),
        };
        let line = serde_json::to_string(&entry)?;
        writeln!(self.file, "{}", line)?;
        self.file.sync_all()?;
        Ok(self.sequence)
    }

    /// Number of entries in the log since the last compaction
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Replay all operations from the log
    ///
    /// A torn final line (crash mid-append) is skipped; corruption anywhere
    /// else is an error.
    pub fn replay(path: &Path) -> Result<Vec<Operation>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
        let last = lines.len().saturating_sub(1);
        let mut ops = Vec::new();

        for (i, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(line) {
                Ok(entry) => ops.push(entry.op),
                Err(e) if i == last => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping torn WAL entry");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ops)
    }

    /// Load the snapshot (if any) and replay the log on top of it
    pub fn load(path: &Path) -> Result<MaterializedState, WalError> {
        let mut state = match fs::read_to_string(snapshot_path(path)) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => MaterializedState::default(),
            Err(e) => return Err(e.into()),
        };
        for op in Wal::replay(path)? {
            state.apply(&op);
        }
        Ok(state)
    }

    /// Write `state` as the new snapshot and truncate the log
    pub fn compact(&mut self, state: &MaterializedState) -> Result<(), WalError> {
        let snapshot = snapshot_path(&self.path);
        let tmp = snapshot.with_extension("snapshot.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(state)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &snapshot)?;

        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.sequence = 0;
        Ok(())
    }
}

fn snapshot_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".snapshot");
    PathBuf::from(name)
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct WalEntry {
    seq: u64,
    op: Operation,
}

#[cfg(test)]
#[path = "wal_tests.rs"]
mod tests;
