// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Optional on-disk checkpointing.
//!
//! The core is in-memory-authoritative; this hook is strictly opt-in. On
//! boot, a fresh checkpoint (saved within the last 60 seconds) is replayed
//! into Inventory, Quota, and the job registry before the HTTP listener
//! opens. The default writer never persists anything.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::allocator::Allocation;
use crate::inventory::Node;
use crate::scheduler::Job;

/// A window beyond which a checkpoint is considered stale and is not
/// replayed on boot.
pub const FRESHNESS_WINDOW_SECS: i64 = 60;

/// A full snapshot of in-memory state, suitable for replay on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDocument {
    /// All known nodes, with their accelerators.
    pub nodes: Vec<Node>,
    /// Every job in the registry, regardless of state.
    pub jobs: Vec<Job>,
    /// Every live allocation.
    pub allocations: Vec<Allocation>,
    /// When this document was produced.
    pub saved_at: DateTime<Utc>,
}

impl CheckpointDocument {
    /// Whether this document is fresh enough to replay, relative to `now`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.saved_at).num_seconds() <= FRESHNESS_WINDOW_SECS
    }
}

/// Persists and restores [`CheckpointDocument`]s.
pub trait CheckpointWriter: Send + Sync {
    /// Persist `doc`, overwriting any previous checkpoint.
    fn save(&self, doc: &CheckpointDocument) -> io::Result<()>;

    /// Load the most recent checkpoint, if one exists.
    fn load(&self) -> io::Result<Option<CheckpointDocument>>;
}

/// Never persists, never restores. The default writer.
#[derive(Debug, Default)]
pub struct NullCheckpointWriter;

impl CheckpointWriter for NullCheckpointWriter {
    fn save(&self, _doc: &CheckpointDocument) -> io::Result<()> {
        Ok(())
    }

    fn load(&self) -> io::Result<Option<CheckpointDocument>> {
        Ok(None)
    }
}

/// Serializes the checkpoint as JSON to a file on disk.
#[derive(Debug, Clone)]
pub struct FileCheckpointWriter {
    path: PathBuf,
}

impl FileCheckpointWriter {
    /// Build a writer backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this writer reads from and writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointWriter for FileCheckpointWriter {
    fn save(&self, doc: &CheckpointDocument) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, bytes)
    }

    fn load(&self) -> io::Result<Option<CheckpointDocument>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_doc(saved_at: DateTime<Utc>) -> CheckpointDocument {
        CheckpointDocument {
            nodes: Vec::new(),
            jobs: Vec::new(),
            allocations: Vec::new(),
            saved_at,
        }
    }

    #[test]
    fn null_writer_round_trips_to_none() {
        let writer = NullCheckpointWriter;
        writer.save(&empty_doc(Utc::now())).unwrap();
        assert!(writer.load().unwrap().is_none());
    }

    #[test]
    fn file_writer_round_trips() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("openlora-checkpoint-test-{}.json", std::process::id()));
        let writer = FileCheckpointWriter::new(&path);

        let doc = empty_doc(Utc::now());
        writer.save(&doc).unwrap();
        let loaded = writer.load().unwrap().expect("checkpoint should exist");
        assert_eq!(loaded.nodes.len(), doc.nodes.len());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn freshness_window_is_sixty_seconds() {
        let now = Utc::now();
        let fresh = empty_doc(now - chrono::Duration::seconds(30));
        let stale = empty_doc(now - chrono::Duration::seconds(90));
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
    }
}
