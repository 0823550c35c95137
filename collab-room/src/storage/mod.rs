//! Snapshot persistence seam.
//!
//! ```text
//! ┌─────────────┐  save_snapshot   ┌───────────────┐
//! │ Room        │ ───────────────► │ SnapshotStore │
//! │ (event loop)│  blocking pool   │               │
//! └──────┬──────┘                  └──────┬────────┘
//!        │ on start                        │
//!        ▼                                 ▼
//!  load_latest_snapshot          MemoryStore │ RocksStore
//! ```
//!
//! Stores are synchronous; the room always calls them through
//! `tokio::task::spawn_blocking` with a timeout. Each save creates a new
//! snapshot version (`max + 1` per document).

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};

use uuid::Uuid;

use crate::error::StoreError;

/// A persisted snapshot and the version the store assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub bytes: Vec<u8>,
    pub version: u64,
}

/// Persistence collaborator for room snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot of a document, `None` for a document never saved.
    fn load_latest_snapshot(&self, doc_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError>;

    /// Store a new snapshot and return its version.
    fn save_snapshot(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<u64, StoreError>;
}
