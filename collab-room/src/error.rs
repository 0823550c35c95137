//! Error types for every collaborator seam of the collaboration core.
//!
//! Each concern gets its own enum so callers can decide what is fatal:
//! transport and protocol errors end one connection, store and backbone
//! errors are logged and retried by the room, auth errors reject the
//! handshake.

use thiserror::Error;
use uuid::Uuid;

/// Wire encoding/decoding errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            ProtocolError::Deserialization(e.to_string())
        } else {
            ProtocolError::Serialization(e.to_string())
        }
    }
}

/// Persistence collaborator errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Pub/sub backbone errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackboneError {
    #[error("Backbone unavailable")]
    Unavailable,
    #[error("Subscription to {0} closed")]
    Closed(String),
    #[error("Not subscribed to {0}")]
    NotSubscribed(String),
    #[error("Malformed backbone message: {0}")]
    Malformed(String),
    #[error("Backbone command queue full")]
    Backlogged,
    #[error("Backbone service error: {0}")]
    Service(String),
}

/// Identity/permission resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Unknown user: {0}")]
    UnknownUser(Uuid),
    #[error("User {user} has no access to document {doc}")]
    Forbidden { user: Uuid, doc: Uuid },
}

/// Errors returned by [`crate::room::RoomHandle`] calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("Room for document {0} is closed")]
    Closed(Uuid),
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("Invalid auth table: {0}")]
    InvalidAuthTable(String),
}

/// WebSocket server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
