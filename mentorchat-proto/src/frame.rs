//! Push-channel frames exchanged over the chat WebSocket.
//!
//! Every frame is a JSON object discriminated by its `action` field. Frames
//! with an action this client does not know are reported as `Ok(None)` by
//! [`decode_inbound`] so that newer servers can add actions without breaking
//! older clients.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, UserId};

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame is not valid JSON or does not match the frame shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The frame is a JSON value without a string `action` field.
    #[error("frame has no action")]
    MissingAction,
}

/// Frames pushed by the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundFrame {
    /// A new message involving the connected user (either direction).
    Message {
        /// The persisted message.
        message: Message,
    },
    /// A user came online.
    Online {
        /// The user whose presence changed.
        user_id: UserId,
    },
    /// The recipient acknowledged receipt of one of our messages.
    MessageDelivered {
        /// The acknowledged message.
        message_id: MessageId,
        /// The user that acknowledged it.
        #[serde(default)]
        delivered_by: Option<UserId>,
    },
    /// A reader has read our messages up to and including an id.
    MessagesRead {
        /// The user who read the messages.
        reader_id: UserId,
        /// Highest message id covered by the read receipt.
        last_read_message_id: MessageId,
    },
}

impl InboundFrame {
    /// Actions understood by [`decode_inbound`].
    pub const ACTIONS: [&'static str; 4] =
        ["message", "online", "message_delivered", "messages_read"];

    /// Returns the wire `action` of this frame.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Online { .. } => "online",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessagesRead { .. } => "messages_read",
        }
    }
}

/// Frames sent by the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Tells the server (and through it the sender) that a message arrived
    /// while its conversation was not being viewed.
    Delivered {
        /// The message that arrived.
        message_id: MessageId,
        /// The original sender, to be notified.
        to: UserId,
    },
}

/// Decodes a server frame.
///
/// Returns `Ok(None)` for a well-formed frame whose `action` is unknown.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] for invalid JSON or a known action with
/// the wrong shape, and [`FrameError::MissingAction`] when the `action`
/// discriminator is absent.
pub fn decode_inbound(text: &str) -> Result<Option<InboundFrame>, FrameError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let Some(action) = value.get("action").and_then(serde_json::Value::as_str) else {
        return Err(FrameError::MissingAction);
    };
    if !InboundFrame::ACTIONS.contains(&action) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

/// Encodes a server frame. Used by servers and test harnesses.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if serialization fails.
pub fn encode_inbound(frame: &InboundFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Encodes a client frame.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if serialization fails.
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a client frame on the server side.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if the text is not a known client frame.
pub fn decode_outbound(text: &str) -> Result<OutboundFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}
