//! Ordered, lossless store of one document's CRDT update blobs.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                UpdateLog                   │
//! │                                            │
//! │  content ◄── update ◄── update ◄── update  │
//! │  (base)      v+1        v+2        v+3     │
//! └────────────────────────────────────────────┘
//! ```
//!
//! Blobs are never inspected. Replaying `content` followed by `updates`
//! in order through the external merge library reproduces the document;
//! reordering corrupts it, so the log only ever appends.
//!
//! Snapshot wire format: `CRS1` magic + bincode `SnapshotState`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compaction::Compactor;
use crate::error::StoreError;

/// Leading bytes of every snapshot produced by [`UpdateLog::snapshot`].
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"CRS1";

/// Serializable form of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub content: Vec<u8>,
    pub updates: Vec<Vec<u8>>,
    pub version: u64,
}

impl SnapshotState {
    /// Encode with the magic prefix.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut out = Vec::with_capacity(SNAPSHOT_MAGIC.len() + body.len());
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a snapshot; the whole input must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let body = bytes
            .strip_prefix(SNAPSHOT_MAGIC.as_slice())
            .ok_or_else(|| StoreError::Deserialization("missing snapshot magic".into()))?;
        let (state, read): (SnapshotState, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        if read != body.len() {
            return Err(StoreError::Deserialization(format!(
                "{} trailing bytes after snapshot",
                body.len() - read
            )));
        }
        Ok(state)
    }
}

/// How a call to [`UpdateLog::load`] interpreted its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Parsed as a snapshot produced by this crate
    Snapshot,
    /// Not a recognizable snapshot; bytes kept as raw base content
    RawContent,
}

/// One document's accumulated updates.
#[derive(Debug, Default, Clone)]
pub struct UpdateLog {
    content: Arc<Vec<u8>>,
    updates: Vec<Arc<Vec<u8>>>,
    version: u64,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current state with a persisted blob.
    ///
    /// Never fails: bytes that do not parse as a snapshot become the raw base
    /// content and the version falls back to `stored_version`.
    pub fn load(&mut self, snapshot: &[u8], stored_version: u64) -> LoadOutcome {
        match SnapshotState::decode(snapshot) {
            Ok(state) => {
                self.content = Arc::new(state.content);
                self.updates = state.updates.into_iter().map(Arc::new).collect();
                self.version = state.version;
                LoadOutcome::Snapshot
            }
            Err(_) => {
                self.content = Arc::new(snapshot.to_vec());
                self.updates.clear();
                self.version = stored_version;
                LoadOutcome::RawContent
            }
        }
    }

    /// Append an update blob and bump the version.
    ///
    /// Returns the shared blob so callers can relay it without copying.
    pub fn apply_update(&mut self, blob: Vec<u8>) -> Arc<Vec<u8>> {
        let blob = Arc::new(blob);
        self.updates.push(blob.clone());
        self.version += 1;
        blob
    }

    /// Encode the full state for persistence.
    pub fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        SnapshotState {
            content: self.content.as_ref().clone(),
            updates: self.updates.iter().map(|u| u.as_ref().clone()).collect(),
            version: self.version,
        }
        .encode()
    }

    pub fn is_dirty_since(&self, last_saved_version: u64) -> bool {
        self.version > last_saved_version
    }

    /// Everything a late joiner needs, in replay order.
    pub fn replay_frames(&self) -> Vec<Arc<Vec<u8>>> {
        let mut frames = Vec::with_capacity(self.updates.len() + 1);
        if !self.content.is_empty() {
            frames.push(self.content.clone());
        }
        frames.extend(self.updates.iter().cloned());
        frames
    }

    /// Fold base content and updates into one blob via the compactor.
    ///
    /// Returns `false` (and leaves the log untouched) when there is nothing
    /// to compact or the compactor cannot merge the blobs.
    pub fn compact(&mut self, compactor: &dyn Compactor) -> bool {
        if self.updates.is_empty() {
            return false;
        }
        let mut blobs: Vec<&[u8]> = Vec::with_capacity(self.updates.len() + 1);
        if !self.content.is_empty() {
            blobs.push(self.content.as_slice());
        }
        blobs.extend(self.updates.iter().map(|u| u.as_slice()));

        match compactor.compact(&blobs) {
            Some(merged) => {
                self.content = Arc::new(merged);
                self.updates.clear();
                true
            }
            None => false,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of stored update blobs (not counting base content).
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.content.is_empty()
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn updates(&self) -> impl Iterator<Item = &[u8]> {
        self.updates.iter().map(|u| u.as_slice())
    }

    pub fn total_bytes(&self) -> usize {
        self.content.len() + self.updates.iter().map(|u| u.len()).sum::<usize>()
    }
}
