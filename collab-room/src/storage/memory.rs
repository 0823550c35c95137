//! In-memory snapshot history, used by tests and storage-less deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use super::{SnapshotStore, StoredSnapshot};
use crate::error::StoreError;

/// Keeps every saved snapshot per document.
#[derive(Debug, Default)]
pub struct MemoryStore {
    history: Mutex<HashMap<Uuid, Vec<Vec<u8>>>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    save_delay_ms: AtomicU64,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn history(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<Vec<u8>>>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pre-populate a document as if it had been saved before.
    pub fn insert(&self, doc_id: Uuid, snapshot: Vec<u8>) -> u64 {
        let mut history = self.history();
        let versions = history.entry(doc_id).or_default();
        versions.push(snapshot);
        versions.len() as u64
    }

    /// Make every following save fail with [`StoreError::Unavailable`].
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Release);
    }

    /// Make every following load fail with [`StoreError::Unavailable`].
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Release);
    }

    /// Block each save for `delay` before storing it.
    pub fn set_save_delay(&self, delay: Duration) {
        self.save_delay_ms.store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Number of successful saves across all documents.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Acquire)
    }

    /// Number of snapshots stored for one document.
    pub fn snapshot_count(&self, doc_id: Uuid) -> usize {
        self.history().get(&doc_id).map_or(0, |v| v.len())
    }

    pub fn latest(&self, doc_id: Uuid) -> Option<Vec<u8>> {
        self.history().get(&doc_id).and_then(|v| v.last().cloned())
    }
}

impl SnapshotStore for MemoryStore {
    fn load_latest_snapshot(&self, doc_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError> {
        if self.fail_loads.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("load disabled".into()));
        }
        Ok(self.history().get(&doc_id).and_then(|versions| {
            versions.last().map(|bytes| StoredSnapshot {
                bytes: bytes.clone(),
                version: versions.len() as u64,
            })
        }))
    }

    fn save_snapshot(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<u64, StoreError> {
        let delay = self.save_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_saves.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("save disabled".into()));
        }
        let version = self.insert(doc_id, snapshot.to_vec());
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(version)
    }
}
