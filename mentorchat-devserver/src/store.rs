//! In-memory message database for the development backend.
//!
//! The [`ChatDb`] holds every message exchanged through the server plus the
//! display names of known users. Ids are assigned from a single increasing
//! counter, so id order is persistence order.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use mentorchat_proto::message::{ConversationSummary, Message, MessageId, UserId};

#[derive(Debug, Default)]
struct Inner {
    messages: Vec<Message>,
    next_id: u64,
    names: HashMap<UserId, String>,
}

/// Thread-safe in-memory message database.
#[derive(Debug, Default)]
pub struct ChatDb {
    inner: Mutex<Inner>,
}

impl ChatDb {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a database that knows the given users' display names.
    #[must_use]
    pub fn with_users(names: impl IntoIterator<Item = (UserId, String)>) -> Self {
        let db = Self::new();
        db.inner.lock().names.extend(names);
        db
    }

    /// Registers or renames a user.
    pub fn set_display_name(&self, user: UserId, name: impl Into<String>) {
        self.inner.lock().names.insert(user, name.into());
    }

    /// Persists a new message and returns it.
    pub fn insert(&self, sender: &UserId, receiver: &UserId, text: &str) -> Message {
        self.insert_at(sender, receiver, text, Utc::now())
    }

    /// Persists a new message with an explicit timestamp.
    pub fn insert_at(
        &self,
        sender: &UserId,
        receiver: &UserId,
        text: &str,
        sent_at: DateTime<Utc>,
    ) -> Message {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let message = Message {
            id: MessageId::new(inner.next_id),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            text: text.to_string(),
            sent_at,
            is_read: false,
            delivered: false,
        };
        inner.messages.push(message.clone());
        message
    }

    /// Looks up a message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.inner.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    /// All messages between `a` and `b`, in id order.
    #[must_use]
    pub fn conversation(&self, a: &UserId, b: &UserId) -> Vec<Message> {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| is_between(m, a, b))
            .cloned()
            .collect()
    }

    /// Marks every unread message from `peer` to `reader` as read (and
    /// delivered). Returns the highest id marked, if any.
    pub fn mark_read(&self, reader: &UserId, peer: &UserId) -> Option<MessageId> {
        let mut inner = self.inner.lock();
        let mut highest = None;
        for m in inner
            .messages
            .iter_mut()
            .filter(|m| m.sender_id == *peer && m.receiver_id == *reader && !m.is_read)
        {
            m.is_read = true;
            m.delivered = true;
            highest = highest.max(Some(m.id));
        }
        highest
    }

    /// Marks message `id` delivered on behalf of its receiver `by`.
    ///
    /// Returns the message if this changed it. Acks from anyone other than
    /// the receiver, and repeated acks, return `None`.
    pub fn mark_delivered(&self, id: MessageId, by: &UserId) -> Option<Message> {
        let mut inner = self.inner.lock();
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.receiver_id == *by && !m.delivered)?;
        message.delivered = true;
        Some(message.clone())
    }

    /// Conversation list for `me`, most recent first.
    ///
    /// Includes every user `me` has exchanged messages with and every user
    /// with a known display name. `query` filters case-insensitively on id
    /// and display name; an empty query matches everything.
    #[must_use]
    pub fn summaries(
        &self,
        me: &UserId,
        query: &str,
        online: &HashSet<UserId>,
    ) -> Vec<ConversationSummary> {
        let inner = self.inner.lock();
        let query = query.trim().to_lowercase();

        let mut by_peer: BTreeMap<UserId, ConversationSummary> = inner
            .names
            .keys()
            .filter(|user| *user != me)
            .map(|user| (user.clone(), ConversationSummary::empty(user.clone())))
            .collect();

        for m in &inner.messages {
            let Some(peer) = m.peer_of(me) else { continue };
            let summary = by_peer
                .entry(peer.clone())
                .or_insert_with(|| ConversationSummary::empty(peer.clone()));
            summary.last_message_text = Some(m.text.clone());
            summary.last_message_at = Some(m.sent_at);
            if m.receiver_id == *me && !m.is_read {
                summary.unread_count += 1;
            }
        }

        let mut summaries: Vec<ConversationSummary> = by_peer
            .into_values()
            .map(|mut s| {
                s.display_name = inner.names.get(&s.peer_id).cloned();
                s.is_online = online.contains(&s.peer_id);
                s
            })
            .filter(|s| {
                query.is_empty()
                    || s.peer_id.as_str().to_lowercase().contains(&query)
                    || s.display_name
                        .as_deref()
                        .is_some_and(|n| n.to_lowercase().contains(&query))
            })
            .collect();

        // Most recent first; conversations without messages last, by id.
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        summaries
    }
}

fn is_between(m: &Message, a: &UserId, b: &UserId) -> bool {
    (m.sender_id == *a && m.receiver_id == *b) || (m.sender_id == *b && m.receiver_id == *a)
}
