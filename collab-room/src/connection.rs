//! One live client session as seen by its room.
//!
//! The room only ever pushes into the bounded outbound queue; the transport
//! write pump drains it. A slow client loses messages instead of stalling
//! the room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::{encode_message, MessageKind, Permission};

/// Items queued for the transport write pump.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Raw update blob, written as one binary frame
    Binary(Arc<Vec<u8>>),
    /// Pre-encoded JSON envelope, written as one text frame
    Text(Arc<str>),
    /// Full document state: one binary frame per blob, then a `sync` text frame
    Replay { frames: Vec<Arc<Vec<u8>>>, version: u64 },
    /// Flush and close the socket
    Close,
}

/// A client session registered with a room.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    doc_id: Uuid,
    identity: Identity,
    sender: mpsc::Sender<Outbound>,
    closing: watch::Sender<bool>,
    dropped: AtomicU64,
    connected_at: Instant,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    pub fn new(doc_id: Uuid, identity: Identity, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (closing, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            doc_id,
            identity,
            sender,
            closing,
            dropped: AtomicU64::new(0),
            connected_at: Instant::now(),
        });
        (connection, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }

    pub fn permission(&self) -> Permission {
        self.identity.permission
    }

    pub fn can_edit(&self) -> bool {
        self.identity.permission.can_edit()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Queue an item without waiting.
    ///
    /// Returns `false` if the queue was full (the item is dropped and counted)
    /// or the write pump is gone.
    pub fn enqueue(&self, item: Outbound) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "Outbound queue full for connection {} (user {}), {} dropped so far",
                    self.id,
                    self.identity.user_id,
                    dropped
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Encode a JSON envelope and queue it.
    pub fn send_message<T: Serialize>(&self, kind: MessageKind, payload: &T) -> bool {
        match encode_message(kind, payload) {
            Ok(text) => self.enqueue(Outbound::Text(Arc::from(text))),
            Err(e) => {
                log::error!("Failed to encode {} message: {}", kind.as_str(), e);
                false
            }
        }
    }

    /// Ask the write pump to flush what is queued and close the socket.
    ///
    /// Works even when the queue is full: the closing flag is observed by the
    /// pump independently of queued items.
    pub fn close(&self) {
        self.closing.send_replace(true);
        let _ = self.sender.try_send(Outbound::Close);
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Receiver that flips to `true` once [`Connection::close`] was called.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Messages dropped because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the write pump still holds the receiving end.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
