//! REST request/response bodies and endpoint paths of the communications API.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationSummary, Message, UserId};

/// Path of the chat WebSocket endpoint (`?user_id=` is appended by clients).
pub const WS_CHAT_PATH: &str = "/ws/chat/";

/// Path of the conversation list endpoint.
pub const CHATS_PATH: &str = "/api/communications/chats/";

/// Path of the history endpoint for one peer.
#[must_use]
pub fn messages_path(peer: &UserId) -> String {
    format!("{CHATS_PATH}{peer}/messages/")
}

/// Path of the send endpoint for one peer.
#[must_use]
pub fn send_path(peer: &UserId) -> String {
    format!("{CHATS_PATH}{peer}/send/")
}

/// Response of `GET /api/communications/chats/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatListResponse {
    /// Whether the backend handled the request.
    pub success: bool,
    /// One summary per peer, most recent first.
    #[serde(default)]
    pub users: Vec<ConversationSummary>,
    /// Backend error description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `GET /api/communications/chats/{peer}/messages/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Whether the backend handled the request.
    pub success: bool,
    /// Full conversation history in server order.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Backend error description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /api/communications/chats/{peer}/send/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// The sending user.
    pub me: UserId,
    /// Message text.
    pub text: String,
}

/// Response of `POST /api/communications/chats/{peer}/send/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    /// Whether the backend persisted the message.
    pub success: bool,
    /// The persisted message as echoed by the server.
    #[serde(default)]
    pub data: Option<Message>,
    /// Backend error description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
