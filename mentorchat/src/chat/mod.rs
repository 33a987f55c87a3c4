//! Chat synchronization layer for `MentorChat`.
//!
//! Contains the [`store::ConversationStore`] (client-side message, unread
//! and presence cache) and the [`controller::SyncController`] which
//! reconciles push frames, REST responses and local sends into it.

pub mod controller;
pub mod store;

use std::fmt;

use mentorchat_proto::message::{Message, UserId};

/// Viewing state of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    /// Not being viewed. Inbound messages count as unread.
    #[default]
    Closed,
    /// Opened by the user, history fetch in flight.
    Loading,
    /// History loaded, live updates applied directly.
    Open,
}

impl ConversationState {
    /// Whether the user is looking at the conversation (`Loading` or `Open`).
    #[must_use]
    pub const fn is_viewed(self) -> bool {
        matches!(self, Self::Loading | Self::Open)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Loading => write!(f, "loading"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Notifications for UI consumers. They carry no state of their own: the
/// UI re-reads the store through the session handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A new message from a peer was stored.
    MessageReceived {
        /// The conversation it belongs to.
        peer: UserId,
        /// The stored message.
        message: Message,
    },
    /// The message list of a conversation changed.
    ConversationUpdated {
        /// The conversation that changed.
        peer: UserId,
    },
    /// The summary list changed (order, unread counts, last message).
    SummariesUpdated,
    /// A conversation moved between `Closed`, `Loading` and `Open`.
    StateChanged {
        /// The conversation.
        peer: UserId,
        /// Its new state.
        state: ConversationState,
    },
    /// A user was reported online.
    PresenceChanged {
        /// The user.
        user: UserId,
    },
    /// The push channel connected or dropped.
    ConnectionStatus {
        /// Whether the push channel is up.
        connected: bool,
    },
}
