//! Room and registry integration tests.
//!
//! Drive rooms through the registry with in-process connections and a
//! shared local backbone, verifying:
//! - Relay, permission and replay behavior of a single room
//! - Late joiners reconstruct the document from the replay
//! - Cross-instance fan-out without echoes
//! - Idle reaping, backbone loss and predecessor hand-over
//! - Log compaction through yrs

use std::sync::Arc;

use collab_room::backbone::{presence_channel, snapshot_version_key, update_channel};
use collab_room::protocol::{Envelope, MessageKind, PresenceBroadcast, PresenceUpdate};
use collab_room::{
    Backbone, Compactor, Connection, CursorPosition, Identity, LocalHub, MemoryStore, Outbound,
    Permission, RoomConfig, RoomHandle, RoomRegistry, RoomState, YrsCompactor,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Instance {
    registry: Arc<RoomRegistry>,
    store: Arc<MemoryStore>,
}

fn instance(hub: &LocalHub, config: RoomConfig) -> Instance {
    instance_with(hub, config, Arc::new(MemoryStore::new()), None)
}

fn instance_with(
    hub: &LocalHub,
    config: RoomConfig,
    store: Arc<MemoryStore>,
    compactor: Option<Arc<dyn Compactor>>,
) -> Instance {
    let registry = RoomRegistry::new(config, store.clone(), Arc::new(hub.endpoint()), compactor);
    Instance { registry, store }
}

fn client(doc_id: Uuid, name: &str, permission: Permission) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
    Connection::new(
        doc_id,
        Identity {
            user_id: Uuid::new_v4(),
            display_name: name.to_string(),
            permission,
        },
        256,
    )
}

async fn next(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for outbound")
        .expect("outbound queue closed")
}

/// Register and consume the initial replay; returns the replayed frames.
async fn join(room: &RoomHandle, conn: &Arc<Connection>, rx: &mut mpsc::Receiver<Outbound>) -> Vec<Vec<u8>> {
    room.register(conn.clone()).await.unwrap();
    loop {
        if let Outbound::Replay { frames, .. } = next(rx).await {
            return frames.iter().map(|f| f.to_vec()).collect();
        }
    }
}

/// Skip presence text until a frame of another shape arrives.
async fn next_non_presence(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    loop {
        match next(rx).await {
            Outbound::Text(text) if text.contains("\"presence\"") => continue,
            other => return other,
        }
    }
}

fn presence_of(item: Outbound) -> PresenceBroadcast {
    match item {
        Outbound::Text(text) => {
            let envelope = Envelope::decode(&text).unwrap();
            assert_eq!(envelope.kind().unwrap(), MessageKind::Presence);
            envelope.payload().unwrap()
        }
        other => panic!("expected presence text, got {other:?}"),
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

fn edit(doc: &yrs::Doc, at: u32, chunk: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, at, chunk);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&before)
}

fn render(blobs: &[Vec<u8>]) -> String {
    let doc = yrs::Doc::new();
    {
        let mut txn = doc.transact_mut();
        for blob in blobs {
            txn.apply_update(yrs::Update::decode_v1(blob).unwrap()).unwrap();
        }
    }
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

// ─── Single room ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_edit_view_relay_and_final_save() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (c1, mut rx1) = client(doc, "Editor", Permission::Edit);
    let (c2, mut rx2) = client(doc, "Viewer", Permission::View);
    assert!(join(&room, &c1, &mut rx1).await.is_empty());
    assert!(join(&room, &c2, &mut rx2).await.is_empty());

    room.apply_update(c1.id(), b"b1".to_vec()).await.unwrap();
    assert_eq!(next(&mut rx2).await, Outbound::Binary(Arc::new(b"b1".to_vec())));

    room.apply_update(c2.id(), b"b2".to_vec()).await.unwrap();
    let stats = room.stats().await.unwrap();
    assert_eq!(stats.version, 1);
    assert!(rx1.try_recv().is_err(), "editor must not receive anything");

    room.unregister(c1.id()).await.unwrap();
    room.unregister(c2.id()).await.unwrap();

    let observer = hub.endpoint();
    let key = snapshot_version_key(doc);
    let (observer_ref, key_ref) = (&observer, key.as_str());
    assert!(eventually(|| async move { observer_ref.get(key_ref).await.unwrap().is_some() }).await);
    assert_eq!(inst.store.save_count(), 1);

    // The saved state replays exactly the edit that was accepted
    let mut log = collab_room::UpdateLog::new();
    log.load(&inst.store.latest(doc).unwrap(), 1);
    assert_eq!(log.version(), 1);
    assert_eq!(log.updates().collect::<Vec<_>>(), vec![b"b1".as_slice()]);
}

#[tokio::test]
async fn test_comment_permission_cannot_edit() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (commenter, mut rx_c) = client(doc, "Commenter", Permission::Comment);
    let (owner, mut rx_o) = client(doc, "Owner", Permission::Owner);
    join(&room, &commenter, &mut rx_c).await;
    join(&room, &owner, &mut rx_o).await;

    room.apply_update(commenter.id(), vec![1]).await.unwrap();
    room.apply_update(owner.id(), vec![2]).await.unwrap();

    assert_eq!(next(&mut rx_c).await, Outbound::Binary(Arc::new(vec![2])));
    assert_eq!(room.stats().await.unwrap().version, 1);
    assert!(rx_o.try_recv().is_err());
}

#[tokio::test]
async fn test_late_joiner_reconstructs_document() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (writer, mut rx_w) = client(doc, "Writer", Permission::Edit);
    join(&room, &writer, &mut rx_w).await;

    let source = yrs::Doc::new();
    let edits = vec![
        edit(&source, 0, "Hello"),
        edit(&source, 5, ", world"),
        edit(&source, 12, "!"),
    ];
    for blob in &edits {
        room.apply_update(writer.id(), blob.clone()).await.unwrap();
    }

    let (late, mut rx_l) = client(doc, "Late", Permission::View);
    let frames = join(&room, &late, &mut rx_l).await;
    assert_eq!(frames, edits);
    assert_eq!(render(&frames), "Hello, world!");
}

#[tokio::test]
async fn test_presence_lifecycle() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (a, mut rx_a) = client(doc, "Alice", Permission::Edit);
    let (b, mut rx_b) = client(doc, "Bob", Permission::View);
    join(&room, &a, &mut rx_a).await;
    join(&room, &b, &mut rx_b).await;

    room.update_presence(
        a.id(),
        PresenceUpdate { color: None, cursor: Some(CursorPosition { anchor: 3, head: 7 }) },
    )
    .await
    .unwrap();
    let seen = presence_of(next(&mut rx_b).await);
    let entry = seen.presence.unwrap();
    assert_eq!(seen.user_id, a.user_id());
    assert_eq!(entry.name, "Alice");
    assert!(entry.color.starts_with('#'));
    assert_eq!(entry.cursor, Some(CursorPosition { anchor: 3, head: 7 }));

    // A newcomer is told about existing presence right after the replay
    let (c, mut rx_c) = client(doc, "Carol", Permission::View);
    join(&room, &c, &mut rx_c).await;
    assert_eq!(presence_of(next(&mut rx_c).await).user_id, a.user_id());

    room.unregister(a.id()).await.unwrap();
    let left = presence_of(next(&mut rx_b).await);
    assert_eq!(left.user_id, a.user_id());
    assert!(left.presence.is_none());
    assert_eq!(room.stats().await.unwrap().presence_entries, 0);
}

#[tokio::test]
async fn test_same_user_two_tabs_keeps_presence() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let identity = Identity {
        user_id: Uuid::new_v4(),
        display_name: "Alice".into(),
        permission: Permission::Edit,
    };
    let (tab1, mut rx1) = Connection::new(doc, identity.clone(), 64);
    let (tab2, mut rx2) = Connection::new(doc, identity, 64);
    join(&room, &tab1, &mut rx1).await;
    join(&room, &tab2, &mut rx2).await;

    room.update_presence(tab1.id(), PresenceUpdate::default()).await.unwrap();
    presence_of(next(&mut rx2).await);

    room.unregister(tab1.id()).await.unwrap();
    assert_eq!(room.stats().await.unwrap().presence_entries, 1);
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_room_is_reaped() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    timeout(Duration::from_secs(2), room.wait_terminated())
        .await
        .expect("idle room should terminate");
    assert_eq!(room.state(), RoomState::Terminated);
    assert_eq!(inst.registry.room_count().await, 0);
    assert_eq!(hub.subscriber_count(&update_channel(doc)), 0);
    assert_eq!(hub.subscriber_count(&presence_channel(doc)), 0);
}

#[tokio::test]
async fn test_room_with_connection_stays_running() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (a, mut rx_a) = client(doc, "Alice", Permission::View);
    join(&room, &a, &mut rx_a).await;

    sleep(Duration::from_millis(400)).await;
    assert_eq!(room.state(), RoomState::Running);
    assert!(room.is_accepting());
    assert_eq!(
        inst.registry.get(doc).await.map(|r| r.room_id()),
        Some(room.room_id())
    );
}

#[tokio::test]
async fn test_successor_waits_for_final_save() {
    let hub = LocalHub::new();
    let store = Arc::new(MemoryStore::new());
    let inst = instance_with(&hub, RoomConfig::for_testing(), store.clone(), None);
    let doc = Uuid::new_v4();

    let first = inst.registry.get_or_create(doc).await;
    let (a, mut rx_a) = client(doc, "Alice", Permission::Edit);
    join(&first, &a, &mut rx_a).await;

    store.set_save_delay(Duration::from_millis(300));
    first.apply_update(a.id(), b"kept".to_vec()).await.unwrap();
    first.close();

    let second = inst.registry.get_or_create(doc).await;
    assert_ne!(first.room_id(), second.room_id());

    let (b, mut rx_b) = client(doc, "Bob", Permission::View);
    let frames = join(&second, &b, &mut rx_b).await;
    assert_eq!(frames, vec![b"kept".to_vec()]);
    assert_eq!(first.state(), RoomState::Terminated);
    assert_eq!(second.stats().await.unwrap().version, 1);

    match next_non_presence(&mut rx_a).await {
        Outbound::Text(text) => {
            let envelope = Envelope::decode(&text).unwrap();
            assert_eq!(envelope.kind().unwrap(), MessageKind::Disconnect);
        }
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert_eq!(next(&mut rx_a).await, Outbound::Close);
}

#[tokio::test]
async fn test_failed_saves_are_retried() {
    let hub = LocalHub::new();
    let store = Arc::new(MemoryStore::new());
    let inst = instance_with(&hub, RoomConfig::for_testing(), store.clone(), None);
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (a, mut rx_a) = client(doc, "Alice", Permission::Edit);
    join(&room, &a, &mut rx_a).await;

    store.set_fail_saves(true);
    room.apply_update(a.id(), vec![1]).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(room.stats().await.unwrap().persisted_version, 0);

    store.set_fail_saves(false);
    let room_ref = &room;
    assert!(
        eventually(|| async move {
            room_ref.stats().await.map(|s| s.persisted_version == 1).unwrap_or(false)
        })
        .await
    );
    assert_eq!(store.snapshot_count(doc), 1);
}

#[tokio::test]
async fn test_load_failure_starts_empty() {
    let hub = LocalHub::new();
    let store = Arc::new(MemoryStore::new());
    store.set_fail_loads(true);
    let inst = instance_with(&hub, RoomConfig::for_testing(), store, None);
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (a, mut rx_a) = client(doc, "Alice", Permission::Edit);
    assert!(join(&room, &a, &mut rx_a).await.is_empty());
    assert_eq!(room.stats().await.unwrap().version, 0);
}

#[tokio::test]
async fn test_raw_snapshot_is_replayed_as_base_content() {
    let hub = LocalHub::new();
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let source = yrs::Doc::new();
    let raw = edit(&source, 0, "legacy");
    store.insert(doc, raw.clone());

    let inst = instance_with(&hub, RoomConfig::for_testing(), store, None);
    let room = inst.registry.get_or_create(doc).await;
    let (a, mut rx_a) = client(doc, "Alice", Permission::View);
    let frames = join(&room, &a, &mut rx_a).await;
    assert_eq!(frames, vec![raw]);
    assert_eq!(render(&frames), "legacy");
    assert_eq!(room.stats().await.unwrap().version, 1);
}

#[tokio::test]
async fn test_registry_shutdown_saves_everything() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig {
        autosave_interval: Duration::from_secs(60),
        idle_save_after: Duration::from_secs(60),
        ..RoomConfig::for_testing()
    });

    let mut docs = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let doc = Uuid::new_v4();
        let room = inst.registry.get_or_create(doc).await;
        let (conn, mut rx) = client(doc, "Writer", Permission::Edit);
        join(&room, &conn, &mut rx).await;
        room.apply_update(conn.id(), doc.as_bytes().to_vec()).await.unwrap();
        room.stats().await.unwrap();
        docs.push(doc);
        clients.push((conn, rx));
    }

    assert!(inst.registry.shutdown(Duration::from_secs(5)).await);
    assert_eq!(inst.registry.room_count().await, 0);
    for doc in docs {
        assert_eq!(inst.store.snapshot_count(doc), 1);
    }
    for (conn, _rx) in clients {
        assert!(conn.is_closing());
    }
}

// ─── Backbone ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_updates_cross_instances_without_echo() {
    let hub = LocalHub::new();
    let one = instance(&hub, RoomConfig::for_testing());
    let two = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();

    let room1 = one.registry.get_or_create(doc).await;
    let room2 = two.registry.get_or_create(doc).await;
    let (a, mut rx_a) = client(doc, "Alice", Permission::Edit);
    let (b, mut rx_b) = client(doc, "Bob", Permission::Edit);
    join(&room1, &a, &mut rx_a).await;
    join(&room2, &b, &mut rx_b).await;
    assert_eq!(hub.subscriber_count(&update_channel(doc)), 2);

    room1.apply_update(a.id(), b"from-one".to_vec()).await.unwrap();
    assert_eq!(next(&mut rx_b).await, Outbound::Binary(Arc::new(b"from-one".to_vec())));

    room2.apply_update(b.id(), b"from-two".to_vec()).await.unwrap();
    assert_eq!(next(&mut rx_a).await, Outbound::Binary(Arc::new(b"from-two".to_vec())));

    sleep(Duration::from_millis(50)).await;
    assert_eq!(room1.stats().await.unwrap().version, 2);
    assert_eq!(room2.stats().await.unwrap().version, 2);
    assert!(rx_a.try_recv().is_err(), "own update must not echo back");
    assert!(rx_b.try_recv().is_err(), "own update must not echo back");
}

#[tokio::test]
async fn test_presence_crosses_instances() {
    let hub = LocalHub::new();
    let one = instance(&hub, RoomConfig::for_testing());
    let two = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();

    let room1 = one.registry.get_or_create(doc).await;
    let room2 = two.registry.get_or_create(doc).await;
    let (a, mut rx_a) = client(doc, "Alice", Permission::View);
    let (b, mut rx_b) = client(doc, "Bob", Permission::View);
    join(&room1, &a, &mut rx_a).await;
    join(&room2, &b, &mut rx_b).await;

    room1
        .update_presence(a.id(), PresenceUpdate { color: Some("#112233".into()), cursor: None })
        .await
        .unwrap();
    let remote = presence_of(next(&mut rx_b).await);
    assert_eq!(remote.user_id, a.user_id());
    assert_eq!(remote.presence.unwrap().color, "#112233");
    assert_eq!(room2.stats().await.unwrap().presence_entries, 1);

    room1.unregister(a.id()).await.unwrap();
    let removal = presence_of(next(&mut rx_b).await);
    assert_eq!(removal.user_id, a.user_id());
    assert!(removal.presence.is_none());
    assert_eq!(room2.stats().await.unwrap().presence_entries, 0);
}

#[tokio::test]
async fn test_backbone_loss_keeps_local_relay() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (a, mut rx_a) = client(doc, "Alice", Permission::Edit);
    let (b, mut rx_b) = client(doc, "Bob", Permission::View);
    join(&room, &a, &mut rx_a).await;
    join(&room, &b, &mut rx_b).await;

    hub.set_available(false);
    let room_ref = &room;
    assert!(eventually(|| async move { !room_ref.stats().await.unwrap().subscribed }).await);

    room.apply_update(a.id(), vec![42]).await.unwrap();
    assert_eq!(next(&mut rx_b).await, Outbound::Binary(Arc::new(vec![42])));
    assert_eq!(room.state(), RoomState::Running);

    hub.set_available(true);
    assert!(eventually(|| async move { room_ref.stats().await.unwrap().subscribed }).await);
    assert_eq!(hub.subscriber_count(&update_channel(doc)), 1);
}

#[tokio::test]
async fn test_malformed_backbone_message_is_skipped() {
    let hub = LocalHub::new();
    let inst = instance(&hub, RoomConfig::for_testing());
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;
    let (a, mut rx_a) = client(doc, "Alice", Permission::View);
    join(&room, &a, &mut rx_a).await;

    let outsider = hub.endpoint();
    let bogus = collab_room::BackboneMessage::presence("elsewhere", b"{not json".to_vec());
    outsider.publish(&presence_channel(doc), &bogus).unwrap();
    let good = collab_room::BackboneMessage::update("elsewhere", &[7, 7]);
    outsider.publish(&update_channel(doc), &good).unwrap();

    assert_eq!(next(&mut rx_a).await, Outbound::Binary(Arc::new(vec![7, 7])));
    let stats = room.stats().await.unwrap();
    assert_eq!(stats.version, 1);
    assert!(stats.subscribed);
}

// ─── Compaction ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_compaction_folds_log_without_changing_document() {
    let hub = LocalHub::new();
    let config = RoomConfig { compact_after: Some(3), ..RoomConfig::for_testing() };
    let inst = instance_with(&hub, config, Arc::new(MemoryStore::new()), Some(Arc::new(YrsCompactor)));
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (writer, mut rx_w) = client(doc, "Writer", Permission::Edit);
    let (reader, mut rx_r) = client(doc, "Reader", Permission::View);
    join(&room, &writer, &mut rx_w).await;
    join(&room, &reader, &mut rx_r).await;

    let source = yrs::Doc::new();
    let edits = vec![
        edit(&source, 0, "a"),
        edit(&source, 1, "b"),
        edit(&source, 2, "c"),
        edit(&source, 3, "d"),
    ];
    for blob in &edits {
        room.apply_update(writer.id(), blob.clone()).await.unwrap();
    }
    // Live relay is unaffected by compaction
    for blob in &edits {
        assert_eq!(next(&mut rx_r).await, Outbound::Binary(Arc::new(blob.clone())));
    }

    let stats = room.stats().await.unwrap();
    assert_eq!(stats.version, 4);
    assert_eq!(stats.log_len, 1);

    let (late, mut rx_l) = client(doc, "Late", Permission::View);
    let frames = join(&room, &late, &mut rx_l).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(render(&frames), "abcd");
}

/// Delegates to yrs and counts every attempt.
#[derive(Default)]
struct CountingCompactor {
    attempts: std::sync::atomic::AtomicUsize,
}

impl Compactor for CountingCompactor {
    fn compact(&self, blobs: &[&[u8]]) -> Option<Vec<u8>> {
        self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        YrsCompactor.compact(blobs)
    }
}

#[tokio::test]
async fn test_failed_compaction_backs_off() {
    let hub = LocalHub::new();
    let compactor = Arc::new(CountingCompactor::default());
    let config = RoomConfig { compact_after: Some(2), ..RoomConfig::for_testing() };
    let inst = instance_with(&hub, config, Arc::new(MemoryStore::new()), Some(compactor.clone()));
    let doc = Uuid::new_v4();
    let room = inst.registry.get_or_create(doc).await;

    let (writer, mut rx_w) = client(doc, "Writer", Permission::Edit);
    join(&room, &writer, &mut rx_w).await;

    // Not a yrs update, so every fold of the log fails
    room.apply_update(writer.id(), vec![0xFF, 0xFE, 0xFD]).await.unwrap();
    let source = yrs::Doc::new();
    for i in 0..64u32 {
        room.apply_update(writer.id(), edit(&source, i, "x")).await.unwrap();
    }

    let stats = room.stats().await.unwrap();
    assert_eq!(stats.version, 65);
    assert_eq!(stats.log_len, 65);
    // Attempts at 2, 4, 8, 16, 32 and 64 entries
    let attempts = compactor.attempts.load(std::sync::atomic::Ordering::SeqCst);
    assert!((1..=7).contains(&attempts), "compactor called {attempts} times");
}
