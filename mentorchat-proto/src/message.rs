//! Data model shared by the push channel and the REST API.
//!
//! All types serialize to the JSON shapes the backend produces. Identifiers
//! are opaque: the backend may emit user ids as JSON integers or strings and
//! both forms are accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque identifier of a platform user (student, mentor, admin).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this user ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Self(n.to_string()),
            Raw::Str(s) => Self(s),
        })
    }
}

/// Server-assigned message identity.
///
/// Unique and monotonically increasing per deployment, which makes it safe
/// to address a message without knowing its conversation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Wraps a raw server id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw server id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A one-to-one chat message as persisted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identity.
    pub id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Addressee of the message.
    pub receiver_id: UserId,
    /// Message payload. No format constraints are enforced client-side.
    pub text: String,
    /// Server timestamp; the authoritative ordering key.
    pub sent_at: DateTime<Utc>,
    /// Whether the receiver has read the message.
    #[serde(default)]
    pub is_read: bool,
    /// Whether the server or the receiver acknowledged the message.
    #[serde(default)]
    pub delivered: bool,
}

impl Message {
    /// Returns the other party of this message from `me`'s point of view.
    ///
    /// `None` if `me` is neither the sender nor the receiver.
    #[must_use]
    pub fn peer_of(&self, me: &UserId) -> Option<&UserId> {
        if self.sender_id == *me {
            Some(&self.receiver_id)
        } else if self.receiver_id == *me {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Sort key of a conversation: `sent_at`, ties broken by `id`.
    #[must_use]
    pub const fn ordering_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.sent_at, self.id)
    }
}

/// Denormalized per-conversation record used to render a conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// The other party of the conversation.
    #[serde(alias = "id")]
    pub peer_id: UserId,
    /// Human-readable name of the peer, when the backend provides one.
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Text of the most recent message.
    #[serde(default, alias = "last_message")]
    pub last_message_text: Option<String>,
    /// Timestamp of the most recent message.
    #[serde(default, alias = "last_message_time")]
    pub last_message_at: Option<DateTime<Utc>>,
    /// Messages from the peer not yet read by the viewer.
    #[serde(default)]
    pub unread_count: u32,
    /// Presence flag.
    #[serde(default)]
    pub is_online: bool,
}

impl ConversationSummary {
    /// Creates an empty summary for `peer_id`.
    #[must_use]
    pub const fn empty(peer_id: UserId) -> Self {
        Self {
            peer_id,
            display_name: None,
            last_message_text: None,
            last_message_at: None,
            unread_count: 0,
            is_online: false,
        }
    }
}
