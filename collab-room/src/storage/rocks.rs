//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — LZ4-compressed snapshots keyed by `<doc_id:16><version:8 BE>`
//! - `metadata`  — bincode [`SnapshotMetadata`] keyed by `<doc_id:16>`
//!
//! Big-endian versions keep a document's snapshots contiguous and ordered,
//! so history scans are plain prefix iterations.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SnapshotStore, StoredSnapshot};
use crate::error::StoreError;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every save (default: true, saves are infrequent)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Snapshots kept per document after each save (0 = keep all)
    pub retain_snapshots: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
            retain_snapshots: 20,
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            retain_snapshots: 0,
            ..Self::new(path)
        }
    }
}

/// Per-document bookkeeping stored next to the snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub doc_id: Uuid,
    /// Version of the newest snapshot
    pub latest_version: u64,
    /// Uncompressed size of the newest snapshot
    pub snapshot_size: u64,
    /// Compressed size of the newest snapshot
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            latest_version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable snapshot history backed by RocksDB.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the read-modify-write of version assignment
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore").field("path", &self.config.path).finish()
    }
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are already LZ4 frames
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(SnapshotMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load one specific snapshot version.
    pub fn load_snapshot(&self, doc_id: Uuid, version: u64) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, snapshot_key(doc_id, version))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    /// Every document that has at least one snapshot.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.as_ref()) {
                doc_ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(doc_ids)
    }

    /// Stored snapshot versions of a document, oldest first.
    pub fn list_snapshots(&self, doc_id: Uuid) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .snapshot_keys(doc_id)?
            .into_iter()
            .map(|(version, _)| version)
            .collect())
    }

    /// Delete all but the newest `keep` snapshots of a document.
    ///
    /// `keep` is raised to 1 so the latest snapshot always survives. Returns
    /// the number of snapshots deleted.
    pub fn prune_snapshots(&self, doc_id: Uuid, keep: usize) -> Result<usize, StoreError> {
        let _guard = self.lock();
        self.prune_locked(doc_id, keep)
    }

    /// Caller holds `write_lock`.
    fn prune_locked(&self, doc_id: Uuid, keep: usize) -> Result<usize, StoreError> {
        let keep = keep.max(1);
        let keys = self.snapshot_keys(doc_id)?;
        if keys.len() <= keep {
            return Ok(0);
        }

        let cf = self.cf(CF_SNAPSHOTS)?;
        let stale = keys.len() - keep;
        let mut batch = WriteBatch::default();
        for (_, key) in keys.iter().take(stale) {
            batch.delete_cf(cf, key);
        }
        self.db.write(batch)?;
        log::debug!("Pruned {} snapshots of document {}", stale, doc_id);
        Ok(stale)
    }

    /// Remove a document's snapshots and metadata.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let _guard = self.lock();
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for (_, key) in self.snapshot_keys(doc_id)? {
            batch.delete_cf(cf_snapshots, key);
        }
        batch.delete_cf(cf_meta, doc_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn snapshot_keys(&self, doc_id: Uuid) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let start = snapshot_key(doc_id, 0);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let mut version = [0u8; 8];
            version.copy_from_slice(&key[16..24]);
            keys.push((u64::from_be_bytes(version), key.to_vec()));
        }
        Ok(keys)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStore for RocksStore {
    fn load_latest_snapshot(&self, doc_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError> {
        // A save with retention may prune the version named by the metadata.
        let _guard = self.lock();
        let Some(meta) = self.load_metadata(doc_id)? else {
            return Ok(None);
        };
        let bytes = self.load_snapshot(doc_id, meta.latest_version)?;
        Ok(Some(StoredSnapshot {
            bytes,
            version: meta.latest_version,
        }))
    }

    fn save_snapshot(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<u64, StoreError> {
        let _guard = self.lock();
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| SnapshotMetadata::new(doc_id));
        meta.latest_version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, snapshot_key(doc_id, meta.latest_version), &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        if self.config.retain_snapshots > 0 {
            self.prune_locked(doc_id, self.config.retain_snapshots)?;
        }
        Ok(meta.latest_version)
    }
}

/// `doc_id (16 bytes) + version (8 bytes big-endian)`.
fn snapshot_key(doc_id: Uuid, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_missing_document_is_none() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load_latest_snapshot(Uuid::new_v4()).unwrap(), None);
        assert!(matches!(
            store.load_snapshot(Uuid::new_v4(), 1),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_save_assigns_increasing_versions() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        assert_eq!(store.save_snapshot(doc, b"first").unwrap(), 1);
        assert_eq!(store.save_snapshot(doc, b"second").unwrap(), 2);

        let latest = store.load_latest_snapshot(doc).unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.bytes, b"second");
        assert_eq!(store.load_snapshot(doc, 1).unwrap(), b"first");
        assert_eq!(store.list_snapshots(doc).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_metadata_tracks_sizes() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        let data = vec![7u8; 4096];
        store.save_snapshot(doc, &data).unwrap();

        let meta = store.load_metadata(doc).unwrap().unwrap();
        assert_eq!(meta.doc_id, doc);
        assert_eq!(meta.latest_version, 1);
        assert_eq!(meta.snapshot_size, 4096);
        assert!(meta.compressed_size < meta.snapshot_size);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_documents_are_isolated() {
        let (_dir, store) = open_temp();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.save_snapshot(a, b"a1").unwrap();
        store.save_snapshot(b, b"b1").unwrap();
        store.save_snapshot(a, b"a2").unwrap();

        assert_eq!(store.list_snapshots(a).unwrap(), vec![1, 2]);
        assert_eq!(store.list_snapshots(b).unwrap(), vec![1]);
        let mut docs = store.list_documents().unwrap();
        docs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(docs, expected);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        for i in 0..5u8 {
            store.save_snapshot(doc, &[i]).unwrap();
        }
        assert_eq!(store.prune_snapshots(doc, 2).unwrap(), 3);
        assert_eq!(store.list_snapshots(doc).unwrap(), vec![4, 5]);
        assert_eq!(store.prune_snapshots(doc, 0).unwrap(), 1);
        assert_eq!(store.load_latest_snapshot(doc).unwrap().unwrap().bytes, vec![4]);

        // Version numbering continues after pruning
        assert_eq!(store.save_snapshot(doc, b"next").unwrap(), 6);
    }

    #[test]
    fn test_retention_applied_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            retain_snapshots: 2,
            ..StoreConfig::for_testing(dir.path())
        };
        let store = RocksStore::open(config).unwrap();
        let doc = Uuid::new_v4();
        for i in 0..4u8 {
            store.save_snapshot(doc, &[i]).unwrap();
        }
        assert_eq!(store.list_snapshots(doc).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_load_latest_during_pruning_saves() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            retain_snapshots: 1,
            sync_writes: false,
            ..StoreConfig::for_testing(dir.path())
        };
        let store = RocksStore::open(config).unwrap();
        let doc = Uuid::new_v4();
        store.save_snapshot(doc, &[0]).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 1..=200u32 {
                    store.save_snapshot(doc, &i.to_be_bytes()).unwrap();
                }
            });
            for _ in 0..200 {
                let latest = store.load_latest_snapshot(doc).unwrap().unwrap();
                assert!(latest.version >= 1);
            }
        });
        assert_eq!(store.list_snapshots(doc).unwrap(), vec![201]);
    }

    #[test]
    fn test_delete_document() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        store.save_snapshot(doc, b"gone").unwrap();
        store.delete_document(doc).unwrap();
        assert_eq!(store.load_latest_snapshot(doc).unwrap(), None);
        assert!(store.list_snapshots(doc).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot(doc, b"durable").unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let latest = store.load_latest_snapshot(doc).unwrap().unwrap();
        assert_eq!(latest, StoredSnapshot { bytes: b"durable".to_vec(), version: 1 });
    }

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::new("/tmp/x");
        assert_eq!(config.path, PathBuf::from("/tmp/x"));
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
        assert_eq!(config.retain_snapshots, 20);
    }
}
