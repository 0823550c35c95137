//! Cross-instance pub/sub and key-value seam.
//!
//! ```text
//!  instance A                  hub                   instance B
//!  ┌────────┐  publish   ┌──────────────┐  deliver  ┌────────┐
//!  │ Room   │──────────▶│ room:{doc}   │─────────▶│ Room   │
//!  │        │◀──────────│ presence:{doc}│◀─────────│        │
//!  └────────┘  deliver   └──────────────┘  publish  └────────┘
//! ```
//!
//! Every message carries the publisher's instance id; a subscriber that
//! sees its own id drops the message. Delivery is at-most-once with no
//! ordering guarantee across channels.
//!
//! - [`LocalHub`]: in-process hub for tests and single-node deployments
//! - [`RedisBackbone`]: Redis pub/sub and keys, shared between processes

mod local;
mod redis;

pub use local::{LocalBackbone, LocalHub};
pub use self::redis::RedisBackbone;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BackboneError;
use crate::protocol::base64_bytes;

/// Buffered messages per subscription before the hub starts dropping.
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Channel carrying update blobs for a document.
pub fn update_channel(doc_id: Uuid) -> String {
    format!("room:{doc_id}")
}

/// Channel carrying presence changes for a document.
pub fn presence_channel(doc_id: Uuid) -> String {
    format!("presence:{doc_id}")
}

/// Key under which the last saved snapshot version is recorded.
pub fn snapshot_version_key(doc_id: Uuid) -> String {
    format!("snapshot-version:{doc_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    Update,
    Presence,
}

/// Message exchanged between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneMessage {
    #[serde(rename = "type")]
    pub kind: BackboneKind,
    /// Instance id of the publisher
    pub from: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl BackboneMessage {
    pub fn update(from: &str, blob: &[u8]) -> Self {
        Self {
            kind: BackboneKind::Update,
            from: from.to_string(),
            payload: blob.to_vec(),
        }
    }

    pub fn presence(from: &str, json: Vec<u8>) -> Self {
        Self {
            kind: BackboneKind::Presence,
            from: from.to_string(),
            payload: json,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BackboneError> {
        serde_json::to_vec(self).map_err(|e| BackboneError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BackboneError> {
        serde_json::from_slice(bytes).map_err(|e| BackboneError::Malformed(e.to_string()))
    }
}

/// Receiving end of one channel subscription.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<Arc<Vec<u8>>>,
}

impl Subscription {
    /// Wrap a raw receiver; adapters for external services feed it from a
    /// background task.
    pub fn new(channel: String, receiver: mpsc::Receiver<Arc<Vec<u8>>>) -> Self {
        Self { channel, receiver }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next decoded message.
    ///
    /// `Err(Closed)` means the subscription is gone for good; `Err(Malformed)`
    /// only skips one message.
    pub async fn recv(&mut self) -> Result<BackboneMessage, BackboneError> {
        match self.receiver.recv().await {
            Some(bytes) => BackboneMessage::decode(&bytes),
            None => Err(BackboneError::Closed(self.channel.clone())),
        }
    }
}

/// Pub/sub plus key-value service shared by all instances.
///
/// The synchronous calls never block on I/O; adapters for remote services
/// queue work on their own tasks. Reads that need an answer return a future.
pub trait Backbone: Send + Sync {
    fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError>;

    fn unsubscribe(&self, channel: &str) -> Result<(), BackboneError>;

    /// Returns the number of subscriptions the message was delivered to, or
    /// 0 when delivery happens on a remote service.
    fn publish(&self, channel: &str, message: &BackboneMessage) -> Result<usize, BackboneError>;

    fn set(&self, key: &str, value: &str) -> Result<(), BackboneError>;

    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<String>, BackboneError>>;

    /// Resolves to whether the key existed.
    fn delete(&self, key: &str) -> BoxFuture<'static, Result<bool, BackboneError>>;
}
