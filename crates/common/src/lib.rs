// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between chat clients and the chathub server.
//! This module defines the WebSocket frame payloads and supporting types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier assigned to every persisted message
pub type MessageId = Uuid;

/// Stable user identifier produced by the authenticator
pub type UserId = String;

/// Maximum message content length, counted in UTF-8 bytes
pub const MAX_CONTENT_LENGTH: usize = 1000;

/// Kind of chat message content
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text
    #[default]
    Text,
    /// Image reference (URL or uploaded asset id)
    Image,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a kind string is not one of the supported kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for MessageKind {
    type Err = UnknownKind;

    /// Empty input maps to [`MessageKind::Text`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Inbound frame: a client asking to send a message.
///
/// Every field is optional on the wire so that an incomplete request is a
/// validation failure rather than an undecodable frame.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SendMessageRequest {
    /// Recipient user id
    #[serde(default, deserialize_with = "null_as_empty")]
    pub receiver_id: String,
    /// Message body
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    /// Content kind, `"text"` when omitted or empty
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: Option<String>,
}

/// Read a string field where `null` means the same as absent
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A persisted chat message.
///
/// This is also the outbound frame: the receiver gets it as a new message and
/// the sender gets the very same payload as a send confirmation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields the message store needs to create a [`ChatMessage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub kind: MessageKind,
}

impl NewMessage {
    /// Stamp a fresh id and creation time onto the message
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            kind: self.kind,
            read: false,
            created_at: Utc::now(),
        }
    }
}

/// Monitoring snapshot of the connection registry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub total_connections: usize,
    pub connected_users: Vec<UserId>,
    pub timestamp: DateTime<Utc>,
}

/// Latest message and unread count for one peer of a user
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// The other participant
    pub user_id: UserId,
    pub last_message: ChatMessage,
    /// Unread messages from the peer to the user
    pub unread_count: u64,
}

/// Presence record kept by the presence store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}
