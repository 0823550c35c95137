//! Process-wide map from document id to room.
//!
//! The lock is held only for lookup, insert and remove; rooms load their
//! snapshots on their own task. A room that is draining stays reachable
//! only as the predecessor of its replacement, which waits for it to
//! terminate before loading so the final save is never read stale.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backbone::Backbone;
use crate::compaction::Compactor;
use crate::config::RoomConfig;
use crate::room::{Room, RoomHandle, RoomStats};
use crate::storage::SnapshotStore;

/// Registry of live rooms for one server instance.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, RoomHandle>>,
    config: RoomConfig,
    store: Arc<dyn SnapshotStore>,
    backbone: Arc<dyn Backbone>,
    compactor: Option<Arc<dyn Compactor>>,
    instance_id: String,
    this: Weak<RoomRegistry>,
}

impl RoomRegistry {
    pub fn new(
        config: RoomConfig,
        store: Arc<dyn SnapshotStore>,
        backbone: Arc<dyn Backbone>,
        compactor: Option<Arc<dyn Compactor>>,
    ) -> Arc<Self> {
        let instance_id = Uuid::new_v4().to_string();
        log::info!("Room registry started as instance {}", instance_id);
        Arc::new_cyclic(|this| Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            store,
            backbone,
            compactor,
            instance_id,
            this: this.clone(),
        })
    }

    /// Id tagged on every message this instance publishes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Room for `doc_id`, creating (and starting) it when needed.
    pub async fn get_or_create(&self, doc_id: Uuid) -> RoomHandle {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                if room.is_accepting() {
                    return room.clone();
                }
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&doc_id) {
            if room.is_accepting() {
                return room.clone();
            }
        }

        let predecessor = rooms.remove(&doc_id);
        if let Some(stale) = &predecessor {
            log::debug!(
                "Replacing {} room {} of document {}",
                stale.state().as_str(),
                stale.room_id(),
                doc_id
            );
        }

        let (mut room, handle) = Room::new(
            doc_id,
            self.config.clone(),
            self.store.clone(),
            self.backbone.clone(),
            self.compactor.clone(),
            self.instance_id.clone(),
            predecessor,
        );
        rooms.insert(doc_id, handle.clone());
        drop(rooms);

        let registry = self.this.clone();
        tokio::spawn(async move {
            room.run().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove(room.doc_id(), room.room_id()).await;
            }
            room.finish();
        });

        handle
    }

    pub async fn get(&self, doc_id: Uuid) -> Option<RoomHandle> {
        self.rooms.read().await.get(&doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Forget a room whose loop has exited.
    ///
    /// Only removes the entry if it still belongs to `room_id`, so a
    /// successor registered in the meantime is left alone.
    pub async fn remove(&self, doc_id: Uuid, room_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(&doc_id) {
            Some(room) if room.room_id() == room_id => {
                rooms.remove(&doc_id);
                true
            }
            _ => false,
        }
    }

    /// Signal every room to drain. Returns immediately.
    pub async fn close_all(&self) {
        let rooms = self.rooms.read().await;
        log::info!("Closing {} rooms", rooms.len());
        for room in rooms.values() {
            room.close();
        }
    }

    /// Drain every room and wait until all of them terminated.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
        for room in &handles {
            room.close();
        }
        let waits = handles.iter().map(|room| room.wait_terminated());
        match tokio::time::timeout(timeout, join_all(waits)).await {
            Ok(_) => {
                log::info!("All {} rooms terminated", handles.len());
                true
            }
            Err(_) => {
                log::warn!("Timed out after {:?} waiting for rooms to terminate", timeout);
                false
            }
        }
    }

    /// Stats of every live room.
    pub async fn stats(&self) -> Vec<RoomStats> {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(handles.len());
        for room in handles {
            if let Ok(room_stats) = room.stats().await {
                stats.push(room_stats);
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::LocalHub;
    use crate::room::RoomState;
    use crate::storage::MemoryStore;

    fn registry() -> Arc<RoomRegistry> {
        RoomRegistry::new(
            RoomConfig::for_testing(),
            Arc::new(MemoryStore::new()),
            Arc::new(LocalHub::new().endpoint()),
            None,
        )
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let a = registry.get_or_create(doc).await;
        let b = registry.get_or_create(doc).await;
        assert_eq!(a.room_id(), b.room_id());
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.get(doc).await.map(|r| r.room_id()), Some(a.room_id()));
    }

    #[tokio::test]
    async fn test_multiple_documents() {
        let registry = registry();
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        registry.get_or_create(doc1).await;
        registry.get_or_create(doc2).await;

        let mut docs = registry.active_documents().await;
        docs.sort();
        let mut expected = vec![doc1, doc2];
        expected.sort();
        assert_eq!(docs, expected);
    }

    #[tokio::test]
    async fn test_remove_is_generation_checked() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let room = registry.get_or_create(doc).await;
        assert!(!registry.remove(doc, Uuid::new_v4()).await);
        assert_eq!(registry.room_count().await, 1);
        assert!(registry.remove(doc, room.room_id()).await);
        assert!(!registry.remove(doc, room.room_id()).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_room_is_replaced() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let first = registry.get_or_create(doc).await;
        first.close();

        let second = registry.get_or_create(doc).await;
        assert_ne!(first.room_id(), second.room_id());

        first.wait_terminated().await;
        assert_eq!(first.state(), RoomState::Terminated);
        // The successor keeps its registry entry
        assert_eq!(registry.get(doc).await.map(|r| r.room_id()), Some(second.room_id()));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_all_rooms() {
        let registry = registry();
        let rooms = vec![
            registry.get_or_create(Uuid::new_v4()).await,
            registry.get_or_create(Uuid::new_v4()).await,
        ];
        assert!(registry.shutdown(Duration::from_secs(5)).await);
        for room in rooms {
            assert_eq!(room.state(), RoomState::Terminated);
        }
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_stats_lists_rooms() {
        let registry = registry();
        let doc = Uuid::new_v4();
        registry.get_or_create(doc).await;
        let stats = registry.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].doc_id, doc);
        assert_eq!(stats[0].version, 0);
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = registry();
        let b = registry();
        assert_ne!(a.instance_id(), b.instance_id());
    }
}
