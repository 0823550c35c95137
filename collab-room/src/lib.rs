//! # collab-room — Real-time collaboration rooms
//!
//! Fans out document edits and presence to every client of a document,
//! persists periodic snapshots, and keeps several server instances in step
//! through a pub/sub backbone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ Client      │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │  binary + JSON      │ (per process)│
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐      ┌──────────────┐
//!                                    │ RoomRegistry  │      │ Backbone     │
//!                                    │ doc → Room    │      │ room:{doc}   │
//!                                    └───────┬───────┘      │ presence:{doc}│
//!                                            │              └──────▲───────┘
//!                                    ┌───────┴───────┐             │
//!                                    │ Room (task)   │─────────────┘
//!                                    │ UpdateLog     │──────► SnapshotStore
//!                                    └───────────────┘
//! ```
//!
//! Update blobs are opaque: they are stored, relayed byte-for-byte and
//! replayed in order, never interpreted. Only an optional [`Compactor`]
//! hands them to a CRDT library.
//!
//! ## Modules
//!
//! - [`update_log`] — Ordered update blobs, snapshot format
//! - [`compaction`] — Optional log folding through `yrs`
//! - [`backbone`] — Cross-instance pub/sub and key-value seam
//! - [`connection`] — One client session and its outbound queue
//! - [`presence`] — Per-user presence entries
//! - [`room`] — The per-document actor
//! - [`registry`] — Document id → room map
//! - [`storage`] — Snapshot persistence (memory, RocksDB)
//! - [`auth`] — Identity and permission resolution
//! - [`protocol`] — Wire messages
//! - [`server`] — WebSocket transport

pub mod auth;
pub mod backbone;
pub mod compaction;
pub mod config;
pub mod connection;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;
pub mod update_log;

// Re-exports for convenience
pub use auth::{Authenticator, Credentials, Identity, StaticAuthenticator, DEV_USER_ID};
pub use backbone::{
    Backbone, BackboneKind, BackboneMessage, LocalBackbone, LocalHub, RedisBackbone, Subscription,
};
pub use compaction::{Compactor, YrsCompactor};
pub use config::{RoomConfig, ServerConfig};
pub use connection::{Connection, Outbound};
pub use error::{
    AuthError, BackboneError, ConfigError, ProtocolError, RoomError, ServerError, StoreError,
};
pub use presence::PresenceMap;
pub use protocol::{
    ClientMessage, CursorPosition, Envelope, MessageKind, Permission, PresenceBroadcast,
    PresenceEntry, PresenceUpdate,
};
pub use registry::RoomRegistry;
pub use room::{Room, RoomEvent, RoomHandle, RoomState, RoomStats};
pub use server::{CollabServer, Handshake, ServerStats};
pub use storage::{MemoryStore, RocksStore, SnapshotMetadata, SnapshotStore, StoreConfig, StoredSnapshot};
pub use update_log::{LoadOutcome, SnapshotState, UpdateLog};
