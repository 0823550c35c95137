//! Wire shapes at the transport boundary.
//!
//! Two kinds of WebSocket frames:
//! ```text
//! Binary ── raw CRDT update blob, relayed byte-for-byte, never parsed
//! Text   ── JSON envelope { "type": <kind>, "payload": <value> }
//! ```
//!
//! Recognized envelope kinds: `sync`, `update`, `presence`, `connected`,
//! `error`, `disconnect`. Binary data inside JSON is base64 (standard
//! alphabet, padded).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Document permission level resolved by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Owner,
    Edit,
    Comment,
    View,
}

impl Permission {
    pub fn can_edit(self) -> bool {
        matches!(self, Permission::Owner | Permission::Edit)
    }

    pub fn can_comment(self) -> bool {
        self.can_edit() || self == Permission::Comment
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Owner => "owner",
            Permission::Edit => "edit",
            Permission::Comment => "comment",
            Permission::View => "view",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Permission::Owner),
            "edit" => Ok(Permission::Edit),
            "comment" => Ok(Permission::Comment),
            "view" => Ok(Permission::View),
            other => Err(ProtocolError::Deserialization(format!(
                "unknown permission {other:?}"
            ))),
        }
    }
}

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sync,
    Update,
    Presence,
    Connected,
    Error,
    Disconnect,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Sync => "sync",
            MessageKind::Update => "update",
            MessageKind::Presence => "presence",
            MessageKind::Connected => "connected",
            MessageKind::Error => "error",
            MessageKind::Disconnect => "disconnect",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "sync" => Ok(MessageKind::Sync),
            "update" => Ok(MessageKind::Update),
            "presence" => Ok(MessageKind::Presence),
            "connected" => Ok(MessageKind::Connected),
            "error" => Ok(MessageKind::Error),
            "disconnect" => Ok(MessageKind::Disconnect),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Tagged JSON envelope carried in text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: kind.as_str().to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> Result<MessageKind, ProtocolError> {
        MessageKind::parse(&self.kind)
    }

    /// Deserialize the payload; a missing payload is read as `null`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Encode an outbound envelope straight to text.
pub fn encode_message<T: Serialize>(kind: MessageKind, payload: &T) -> Result<String, ProtocolError> {
    Envelope::new(kind, payload)?.encode()
}

/// Cursor/selection range inside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub anchor: i64,
    pub head: i64,
}

/// Presence as shown to other users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

/// Client-supplied presence payload; identity fields come from the connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
}

/// Outbound presence change; `presence: null` means the user left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceBroadcast {
    pub user_id: Uuid,
    pub presence: Option<PresenceEntry>,
}

/// Update blob carried inside a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(with = "base64_bytes")]
    pub update: Vec<u8>,
}

/// Sent after the replay frames of a (re)sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub version: u64,
    pub frames: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    pub user_id: Uuid,
    pub permission: Permission,
    pub doc_id: Uuid,
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectInfo {
    pub reason: String,
}

/// Inbound text-frame requests understood by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Presence(PresenceUpdate),
    Update(Vec<u8>),
    Sync,
    Disconnect,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::decode(text)?;
        match envelope.kind()? {
            MessageKind::Presence => Ok(ClientMessage::Presence(envelope.payload()?)),
            MessageKind::Update => {
                let payload: UpdatePayload = envelope.payload()?;
                Ok(ClientMessage::Update(payload.update))
            }
            MessageKind::Sync => Ok(ClientMessage::Sync),
            MessageKind::Disconnect => Ok(ClientMessage::Disconnect),
            other => Err(ProtocolError::UnknownMessageType(format!(
                "{} is server-to-client only",
                other.as_str()
            ))),
        }
    }
}

/// Serde adapter: `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
