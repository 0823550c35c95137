//! Per-document room actor.
//!
//! ```text
//!                 ┌──────────────────────────── Room task ───────────────────────────┐
//!  RoomHandle ───▶│ events ─┐                                                        │
//!                 │         ├─▶ UpdateLog ──▶ local Connections (binary relay)       │
//!  Backbone  ────▶│ remote ─┘        │                                              │
//!                 │                  ├──▶ Backbone publish (local edits only)        │
//!                 │ timers ──────────┴──▶ SnapshotStore (blocking pool, timeout)     │
//!                 └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All room state is owned by one task and mutated only inside its loop.
//! Everything else talks to it through a cloneable [`RoomHandle`].
//!
//! Lifecycle: `Starting` (wait for a draining predecessor, subscribe, load)
//! → `Running` → `Draining` (final save, disconnect, unsubscribe)
//! → `Terminated`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::backbone::{
    presence_channel, snapshot_version_key, update_channel, Backbone, BackboneKind,
    BackboneMessage, Subscription,
};
use crate::compaction::Compactor;
use crate::config::RoomConfig;
use crate::connection::{Connection, Outbound};
use crate::error::{BackboneError, RoomError, StoreError};
use crate::presence::PresenceMap;
use crate::protocol::{
    encode_message, DisconnectInfo, MessageKind, PresenceBroadcast, PresenceUpdate,
};
use crate::storage::SnapshotStore;
use crate::update_log::{LoadOutcome, UpdateLog};

/// Lifecycle of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomState {
    Starting,
    Running,
    Draining,
    Terminated,
}

impl RoomState {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomState::Starting => "starting",
            RoomState::Running => "running",
            RoomState::Draining => "draining",
            RoomState::Terminated => "terminated",
        }
    }
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStats {
    pub doc_id: Uuid,
    pub room_id: Uuid,
    pub state: RoomState,
    pub version: u64,
    pub persisted_version: u64,
    pub connections: usize,
    pub presence_entries: usize,
    pub log_len: usize,
    pub log_bytes: usize,
    pub save_in_flight: bool,
    pub subscribed: bool,
}

/// Requests accepted by the room loop.
#[derive(Debug)]
pub enum RoomEvent {
    Register(Arc<Connection>),
    Unregister(Uuid),
    ApplyUpdate { connection_id: Uuid, blob: Vec<u8> },
    UpdatePresence { connection_id: Uuid, presence: PresenceUpdate },
    RequestSync(Uuid),
    Stats(oneshot::Sender<RoomStats>),
}

/// Result of one background save.
#[derive(Debug)]
struct PersistOutcome {
    /// Log version captured in the snapshot
    version: u64,
    result: Result<u64, StoreError>,
}

#[derive(Debug, Clone, Copy)]
enum Feed {
    Updates,
    Presence,
}

/// Cloneable address of a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    doc_id: Uuid,
    room_id: Uuid,
    events: mpsc::Sender<RoomEvent>,
    cancel: Arc<watch::Sender<bool>>,
    state: watch::Receiver<RoomState>,
}

impl RoomHandle {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Generation id, unique per room instance.
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    /// Whether the room can still take new connections.
    pub fn is_accepting(&self) -> bool {
        !*self.cancel.borrow()
            && !self.events.is_closed()
            && matches!(self.state(), RoomState::Starting | RoomState::Running)
    }

    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), RoomError> {
        self.send(RoomEvent::Register(connection)).await
    }

    pub async fn unregister(&self, connection_id: Uuid) -> Result<(), RoomError> {
        self.send(RoomEvent::Unregister(connection_id)).await
    }

    pub async fn apply_update(&self, connection_id: Uuid, blob: Vec<u8>) -> Result<(), RoomError> {
        self.send(RoomEvent::ApplyUpdate { connection_id, blob }).await
    }

    pub async fn update_presence(
        &self,
        connection_id: Uuid,
        presence: PresenceUpdate,
    ) -> Result<(), RoomError> {
        self.send(RoomEvent::UpdatePresence { connection_id, presence }).await
    }

    pub async fn request_sync(&self, connection_id: Uuid) -> Result<(), RoomError> {
        self.send(RoomEvent::RequestSync(connection_id)).await
    }

    pub async fn stats(&self) -> Result<RoomStats, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomEvent::Stats(tx)).await?;
        rx.await.map_err(|_| RoomError::Closed(self.doc_id))
    }

    /// Ask the room to drain. Returns immediately.
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }

    /// Resolves once the room reached `Terminated` (or its task is gone).
    pub async fn wait_terminated(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == RoomState::Terminated).await;
    }

    async fn send(&self, event: RoomEvent) -> Result<(), RoomError> {
        self.events
            .send(event)
            .await
            .map_err(|_| RoomError::Closed(self.doc_id))
    }
}

/// The room actor. Drive it with [`Room::run`], then [`Room::finish`].
pub struct Room {
    doc_id: Uuid,
    room_id: Uuid,
    config: RoomConfig,
    store: Arc<dyn SnapshotStore>,
    backbone: Arc<dyn Backbone>,
    compactor: Option<Arc<dyn Compactor>>,
    instance_id: String,
    predecessor: Option<RoomHandle>,

    log: UpdateLog,
    /// Log length below which compaction is not retried after a failure
    compact_retry_len: usize,
    connections: HashMap<Uuid, Arc<Connection>>,
    presence: PresenceMap,
    last_activity: Instant,
    persisted_version: u64,
    save_in_flight: bool,
    update_sub: Option<Subscription>,
    presence_sub: Option<Subscription>,

    events: mpsc::Receiver<RoomEvent>,
    persisted_tx: mpsc::Sender<PersistOutcome>,
    persisted_rx: mpsc::Receiver<PersistOutcome>,
    cancel: watch::Receiver<bool>,
    state: watch::Sender<RoomState>,
}

impl Room {
    /// Build a room and its handle. Nothing runs until [`Room::run`].
    pub fn new(
        doc_id: Uuid,
        config: RoomConfig,
        store: Arc<dyn SnapshotStore>,
        backbone: Arc<dyn Backbone>,
        compactor: Option<Arc<dyn Compactor>>,
        instance_id: String,
        predecessor: Option<RoomHandle>,
    ) -> (Self, RoomHandle) {
        let room_id = Uuid::new_v4();
        let (events_tx, events) = mpsc::channel(config.event_capacity.max(1));
        let (persisted_tx, persisted_rx) = mpsc::channel(1);
        let (cancel_tx, cancel) = watch::channel(false);
        let (state, state_rx) = watch::channel(RoomState::Starting);

        let handle = RoomHandle {
            doc_id,
            room_id,
            events: events_tx,
            cancel: Arc::new(cancel_tx),
            state: state_rx,
        };

        let room = Self {
            doc_id,
            room_id,
            config,
            store,
            backbone,
            compactor,
            instance_id,
            predecessor,
            log: UpdateLog::new(),
            compact_retry_len: 0,
            connections: HashMap::new(),
            presence: PresenceMap::new(),
            last_activity: Instant::now(),
            persisted_version: 0,
            save_in_flight: false,
            update_sub: None,
            presence_sub: None,
            events,
            persisted_tx,
            persisted_rx,
            cancel,
            state,
        };
        (room, handle)
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    /// Run the room through `Starting`, `Running` and `Draining`.
    pub async fn run(&mut self) {
        self.start().await;
        self.event_loop().await;
        self.drain().await;
    }

    /// Publish `Terminated`. Call after the room left the registry.
    pub fn finish(self) {
        self.state.send_replace(RoomState::Terminated);
        log::info!("Room {} for document {} terminated", self.room_id, self.doc_id);
    }

    // ─── Starting ─────────────────────────────────────────────────────

    async fn start(&mut self) {
        if let Some(predecessor) = self.predecessor.take() {
            log::debug!(
                "Room {} waiting for predecessor {} of document {}",
                self.room_id,
                predecessor.room_id(),
                self.doc_id
            );
            predecessor.wait_terminated().await;
        }

        // Subscribe before loading so edits published meanwhile are buffered.
        self.ensure_subscribed();
        self.load().await;

        self.last_activity = Instant::now();
        self.state.send_replace(RoomState::Running);
        log::info!(
            "Room {} for document {} running at version {}",
            self.room_id,
            self.doc_id,
            self.log.version()
        );
    }

    async fn load(&mut self) {
        let store = self.store.clone();
        let doc_id = self.doc_id;
        let loaded = time::timeout(
            self.config.persist_timeout,
            tokio::task::spawn_blocking(move || store.load_latest_snapshot(doc_id)),
        )
        .await;

        match loaded {
            Ok(Ok(Ok(Some(snapshot)))) => {
                if self.log.load(&snapshot.bytes, snapshot.version) == LoadOutcome::RawContent {
                    log::warn!(
                        "Snapshot {} of document {} is not in the room format, loaded as raw content",
                        snapshot.version,
                        doc_id
                    );
                }
                self.persisted_version = self.log.version();
            }
            Ok(Ok(Ok(None))) => log::debug!("No snapshot for document {}, starting empty", doc_id),
            Ok(Ok(Err(e))) => {
                log::warn!("Failed to load document {}: {}, starting empty", doc_id, e)
            }
            Ok(Err(e)) => log::error!("Snapshot load task for document {} failed: {}", doc_id, e),
            Err(_) => log::warn!("Timed out loading document {}, starting empty", doc_id),
        }
    }

    fn ensure_subscribed(&mut self) {
        if self.update_sub.is_none() {
            match self.backbone.subscribe(&update_channel(self.doc_id)) {
                Ok(sub) => self.update_sub = Some(sub),
                Err(e) => log::warn!("Update subscription for {} failed: {}", self.doc_id, e),
            }
        }
        if self.presence_sub.is_none() {
            match self.backbone.subscribe(&presence_channel(self.doc_id)) {
                Ok(sub) => self.presence_sub = Some(sub),
                Err(e) => log::warn!("Presence subscription for {} failed: {}", self.doc_id, e),
            }
        }
    }

    // ─── Running ──────────────────────────────────────────────────────

    async fn event_loop(&mut self) {
        let now = Instant::now();
        let mut autosave = time::interval_at(
            now + self.config.autosave_interval,
            self.config.autosave_interval,
        );
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_check = time::interval_at(
            now + self.config.idle_check_interval,
            self.config.idle_check_interval,
        );
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.cancel.borrow() {
                log::info!("Room {} for document {} cancelled", self.room_id, self.doc_id);
                return;
            }

            tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        log::debug!("All handles of room {} dropped", self.room_id);
                        return;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return,
                },
                outcome = self.persisted_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.on_persisted(outcome);
                    }
                }
                message = next_remote(&mut self.update_sub) => self.on_remote(Feed::Updates, message),
                message = next_remote(&mut self.presence_sub) => self.on_remote(Feed::Presence, message),
                _ = autosave.tick() => self.persist("autosave"),
                _ = idle_check.tick() => {
                    if self.idle_check() {
                        log::info!(
                            "Room {} for document {} idle with no connections, draining",
                            self.room_id,
                            self.doc_id
                        );
                        return;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Register(connection) => self.register(connection),
            RoomEvent::Unregister(connection_id) => self.unregister(connection_id),
            RoomEvent::ApplyUpdate { connection_id, blob } => self.apply_update(connection_id, blob),
            RoomEvent::UpdatePresence { connection_id, presence } => {
                self.update_presence(connection_id, presence)
            }
            RoomEvent::RequestSync(connection_id) => {
                if let Some(connection) = self.connections.get(&connection_id) {
                    connection.enqueue(self.replay());
                }
            }
            RoomEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn register(&mut self, connection: Arc<Connection>) {
        connection.enqueue(self.replay());
        for entry in self.presence.entries() {
            connection.send_message(
                MessageKind::Presence,
                &PresenceBroadcast {
                    user_id: entry.user_id,
                    presence: Some(entry.clone()),
                },
            );
        }

        log::info!(
            "User {} joined document {} ({} permission, {} connections)",
            connection.user_id(),
            self.doc_id,
            connection.permission(),
            self.connections.len() + 1
        );
        self.connections.insert(connection.id(), connection);
        self.touch();
    }

    fn unregister(&mut self, connection_id: Uuid) {
        let Some(connection) = self.connections.remove(&connection_id) else {
            return;
        };
        let user_id = connection.user_id();
        log::info!(
            "User {} left document {} ({} connections)",
            user_id,
            self.doc_id,
            self.connections.len()
        );

        let user_still_here = self.connections.values().any(|c| c.user_id() == user_id);
        if !user_still_here && self.presence.remove(&user_id).is_some() {
            let removal = PresenceBroadcast { user_id, presence: None };
            self.broadcast_text(MessageKind::Presence, &removal, None);
            self.publish_presence(&removal);
        }

        self.touch();
        if self.connections.is_empty() {
            self.persist("last connection left");
        }
    }

    fn apply_update(&mut self, connection_id: Uuid, blob: Vec<u8>) {
        let Some(connection) = self.connections.get(&connection_id) else {
            log::debug!("Dropped update from unknown connection {}", connection_id);
            return;
        };
        if !connection.can_edit() {
            log::debug!(
                "Dropped update from user {} with {} permission on document {}",
                connection.user_id(),
                connection.permission(),
                self.doc_id
            );
            return;
        }

        let blob = self.log.apply_update(blob);
        log::trace!(
            "Document {} at version {} ({} bytes from {})",
            self.doc_id,
            self.log.version(),
            blob.len(),
            connection_id
        );

        for (id, peer) in &self.connections {
            if *id != connection_id {
                peer.enqueue(Outbound::Binary(blob.clone()));
            }
        }

        let message = BackboneMessage::update(&self.instance_id, &blob);
        if let Err(e) = self.backbone.publish(&update_channel(self.doc_id), &message) {
            log::warn!("Failed to publish update for {}: {}", self.doc_id, e);
        }

        self.touch();
        self.maybe_compact();
    }

    fn update_presence(&mut self, connection_id: Uuid, update: PresenceUpdate) {
        let Some(connection) = self.connections.get(&connection_id) else {
            return;
        };
        let user_id = connection.user_id();
        let entry = self
            .presence
            .apply_local(user_id, &connection.identity().display_name, update);

        let broadcast = PresenceBroadcast {
            user_id,
            presence: Some(entry),
        };
        self.broadcast_text(MessageKind::Presence, &broadcast, Some(connection_id));
        self.publish_presence(&broadcast);
        self.touch();
    }

    fn on_remote(&mut self, feed: Feed, message: Result<BackboneMessage, BackboneError>) {
        let message = match message {
            Ok(message) => message,
            Err(BackboneError::Malformed(e)) => {
                log::warn!("Skipping malformed backbone message for {}: {}", self.doc_id, e);
                return;
            }
            Err(e) => {
                log::warn!("Backbone {:?} feed of {} lost: {}", feed, self.doc_id, e);
                match feed {
                    Feed::Updates => self.update_sub = None,
                    Feed::Presence => self.presence_sub = None,
                }
                return;
            }
        };

        if message.from == self.instance_id {
            log::trace!("Ignoring own {:?} echo for {}", message.kind, self.doc_id);
            return;
        }

        match message.kind {
            BackboneKind::Update => {
                let blob = self.log.apply_update(message.payload);
                for peer in self.connections.values() {
                    peer.enqueue(Outbound::Binary(blob.clone()));
                }
                self.touch();
                self.maybe_compact();
            }
            BackboneKind::Presence => {
                let broadcast: PresenceBroadcast = match serde_json::from_slice(&message.payload) {
                    Ok(broadcast) => broadcast,
                    Err(e) => {
                        log::warn!("Skipping malformed remote presence for {}: {}", self.doc_id, e);
                        return;
                    }
                };
                match &broadcast.presence {
                    Some(entry) => self.presence.apply_remote(entry.clone()),
                    None => {
                        self.presence.remove(&broadcast.user_id);
                    }
                }
                self.broadcast_text(MessageKind::Presence, &broadcast, None);
            }
        }
    }

    /// Returns `true` when the room should drain.
    fn idle_check(&mut self) -> bool {
        self.ensure_subscribed();

        let idle = self.last_activity.elapsed();
        if idle >= self.config.idle_save_after {
            self.persist("idle");
        }
        self.connections.is_empty() && idle >= self.config.idle_shutdown_after
    }

    // ─── Persistence ──────────────────────────────────────────────────

    fn persist(&mut self, reason: &str) {
        if self.save_in_flight || !self.log.is_dirty_since(self.persisted_version) {
            return;
        }
        let snapshot = match self.log.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Failed to encode snapshot of {}: {}", self.doc_id, e);
                return;
            }
        };

        self.save_in_flight = true;
        let version = self.log.version();
        let store = self.store.clone();
        let doc_id = self.doc_id;
        let timeout = self.config.persist_timeout;
        let results = self.persisted_tx.clone();
        log::debug!("Saving document {} at version {} ({})", doc_id, version, reason);

        tokio::spawn(async move {
            let result = save_snapshot(store, doc_id, snapshot, timeout).await;
            let _ = results.send(PersistOutcome { version, result }).await;
        });
    }

    fn on_persisted(&mut self, outcome: PersistOutcome) {
        self.save_in_flight = false;
        match outcome.result {
            Ok(snapshot_version) => {
                self.persisted_version = self.persisted_version.max(outcome.version);
                log::info!(
                    "Saved document {} at version {} as snapshot {}",
                    self.doc_id,
                    outcome.version,
                    snapshot_version
                );
                let key = snapshot_version_key(self.doc_id);
                if let Err(e) = self.backbone.set(&key, &snapshot_version.to_string()) {
                    log::warn!("Failed to record {}: {}", key, e);
                }
            }
            Err(e) => log::warn!(
                "Failed to save document {} at version {}: {}, will retry",
                self.doc_id,
                outcome.version,
                e
            ),
        }
    }

    // ─── Draining ─────────────────────────────────────────────────────

    async fn drain(&mut self) {
        self.state.send_replace(RoomState::Draining);
        self.events.close();

        // Requests that were already queued still count; new joiners are turned away.
        while let Ok(event) = self.events.try_recv() {
            match event {
                RoomEvent::Register(connection) => {
                    connection.send_message(
                        MessageKind::Disconnect,
                        &DisconnectInfo { reason: "room closed".into() },
                    );
                    connection.close();
                }
                other => self.handle_event(other),
            }
        }

        if self.save_in_flight {
            let wait = self.config.persist_timeout + self.config.persist_timeout / 2;
            match time::timeout(wait, self.persisted_rx.recv()).await {
                Ok(Some(outcome)) => self.on_persisted(outcome),
                _ => self.save_in_flight = false,
            }
        }

        if self.log.is_dirty_since(self.persisted_version) {
            match self.log.snapshot() {
                Ok(snapshot) => {
                    let version = self.log.version();
                    let result =
                        save_snapshot(self.store.clone(), self.doc_id, snapshot, self.config.persist_timeout)
                            .await;
                    self.on_persisted(PersistOutcome { version, result });
                }
                Err(e) => log::error!("Failed to encode final snapshot of {}: {}", self.doc_id, e),
            }
        }

        let mut departed: Vec<Uuid> = self.connections.values().map(|c| c.user_id()).collect();
        departed.sort_unstable();
        departed.dedup();
        for user_id in departed {
            if self.presence.remove(&user_id).is_some() {
                self.publish_presence(&PresenceBroadcast { user_id, presence: None });
            }
        }

        for (_, connection) in self.connections.drain() {
            connection.send_message(
                MessageKind::Disconnect,
                &DisconnectInfo { reason: "room closed".into() },
            );
            connection.close();
        }

        for channel in [update_channel(self.doc_id), presence_channel(self.doc_id)] {
            match self.backbone.unsubscribe(&channel) {
                Ok(()) | Err(BackboneError::NotSubscribed(_)) => {}
                Err(e) => log::warn!("Failed to unsubscribe from {}: {}", channel, e),
            }
        }
        self.update_sub = None;
        self.presence_sub = None;

        log::info!(
            "Room {} for document {} drained at version {} (persisted {})",
            self.room_id,
            self.doc_id,
            self.log.version(),
            self.persisted_version
        );
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn replay(&self) -> Outbound {
        Outbound::Replay {
            frames: self.log.replay_frames(),
            version: self.log.version(),
        }
    }

    fn broadcast_text<T: serde::Serialize>(&self, kind: MessageKind, payload: &T, except: Option<Uuid>) {
        let text: Arc<str> = match encode_message(kind, payload) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                log::error!("Failed to encode {} broadcast: {}", kind.as_str(), e);
                return;
            }
        };
        for (id, peer) in &self.connections {
            if Some(*id) != except {
                peer.enqueue(Outbound::Text(text.clone()));
            }
        }
    }

    fn publish_presence(&self, broadcast: &PresenceBroadcast) {
        let payload = match serde_json::to_vec(broadcast) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode presence for {}: {}", self.doc_id, e);
                return;
            }
        };
        let message = BackboneMessage::presence(&self.instance_id, payload);
        if let Err(e) = self.backbone.publish(&presence_channel(self.doc_id), &message) {
            log::warn!("Failed to publish presence for {}: {}", self.doc_id, e);
        }
    }

    fn maybe_compact(&mut self) {
        let (Some(threshold), Some(compactor)) = (self.config.compact_after, &self.compactor) else {
            return;
        };
        if self.log.len() < threshold.max(self.compact_retry_len) {
            return;
        }
        let before = self.log.total_bytes();
        if self.log.compact(compactor.as_ref()) {
            self.compact_retry_len = 0;
            log::debug!(
                "Compacted document {} at version {}: {} -> {} bytes",
                self.doc_id,
                self.log.version(),
                before,
                self.log.total_bytes()
            );
        } else {
            // Back off until the log doubles; a blob the compactor rejects stays in the log.
            self.compact_retry_len = self.log.len().saturating_mul(2);
            log::warn!(
                "Compaction of document {} failed at {} updates, retrying at {}",
                self.doc_id,
                self.log.len(),
                self.compact_retry_len
            );
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            doc_id: self.doc_id,
            room_id: self.room_id,
            state: *self.state.borrow(),
            version: self.log.version(),
            persisted_version: self.persisted_version,
            connections: self.connections.len(),
            presence_entries: self.presence.len(),
            log_len: self.log.len(),
            log_bytes: self.log.total_bytes(),
            save_in_flight: self.save_in_flight,
            subscribed: self.update_sub.is_some() && self.presence_sub.is_some(),
        }
    }
}

async fn next_remote(sub: &mut Option<Subscription>) -> Result<BackboneMessage, BackboneError> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// One store call on the blocking pool, bounded by `timeout`.
async fn save_snapshot(
    store: Arc<dyn SnapshotStore>,
    doc_id: Uuid,
    snapshot: Vec<u8>,
    timeout: std::time::Duration,
) -> Result<u64, StoreError> {
    let task = tokio::task::spawn_blocking(move || store.save_snapshot(doc_id, &snapshot));
    match time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(StoreError::Database(format!("save task failed: {e}"))),
        Err(_) => Err(StoreError::Unavailable(format!(
            "save timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
