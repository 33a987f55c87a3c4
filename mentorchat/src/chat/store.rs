//! In-memory conversation cache.
//!
//! [`ConversationStore`] holds, per peer, the ordered message list and the
//! conversation summary, plus the set of users seen online. It performs no
//! I/O and is owned by exactly one [`SyncController`](super::controller::SyncController),
//! so it needs no interior locking.
//!
//! # Invariants
//!
//! - Per conversation, messages are sorted by (`sent_at`, `id`).
//! - A message id is stored at most once per conversation.
//! - Messages are never removed; only their `is_read` / `delivered` flags
//!   change, and only from `false` to `true` through merges.
//! - Unread counters live apart from the summary list. A summary list that
//!   omits a peer (for example a filtered search) leaves its counter alone.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use mentorchat_proto::message::{ConversationSummary, Message, MessageId, UserId};

/// A mutable per-message flag addressed by [`ConversationStore::mark_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlag {
    /// `is_read`.
    Read,
    /// `delivered`.
    Delivered,
}

impl MessageFlag {
    fn set(self, message: &mut Message, value: bool) -> bool {
        let slot = match self {
            Self::Read => &mut message.is_read,
            Self::Delivered => &mut message.delivered,
        };
        let changed = *slot != value;
        *slot = value;
        changed
    }
}

/// Result of [`ConversationStore::append_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The message was new and has been inserted in order.
    Inserted,
    /// A message with the same id was already stored; flags were merged.
    Duplicate {
        /// Whether the merge changed any flag.
        changed: bool,
    },
}

/// Partial update applied by [`ConversationStore::upsert_summary`].
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryPatch {
    /// New display name.
    pub display_name: Option<String>,
    /// New last message text.
    pub last_message_text: Option<String>,
    /// New last message timestamp.
    pub last_message_at: Option<DateTime<Utc>>,
    /// New unread counter.
    pub unread_count: Option<u32>,
    /// New presence flag.
    pub is_online: Option<bool>,
}

impl SummaryPatch {
    /// Patch recording `message` as the latest message of its conversation.
    #[must_use]
    pub fn last_message(message: &Message) -> Self {
        Self {
            last_message_text: Some(message.text.clone()),
            last_message_at: Some(message.sent_at),
            ..Self::default()
        }
    }
}

/// Per-session conversation cache.
#[derive(Debug, Default)]
pub struct ConversationStore {
    /// Ordered messages keyed by peer.
    messages: HashMap<UserId, Vec<Message>>,
    /// Summaries, most recent first. May be a filtered view.
    summaries: Vec<ConversationSummary>,
    /// Unread counter per peer, authoritative over `summaries`.
    unread: HashMap<UserId, u32>,
    /// Users reported online during this session.
    online: HashSet<UserId>,
}

impl ConversationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `message` into `peer`'s conversation, preserving order.
    ///
    /// If a message with the same id is already stored the call does not
    /// duplicate it: the `is_read` and `delivered` flags are OR-merged into
    /// the stored copy instead.
    pub fn append_message(&mut self, peer: &UserId, message: Message) -> AppendOutcome {
        let list = self.messages.entry(peer.clone()).or_default();
        if let Some(existing) = list.iter_mut().find(|m| m.id == message.id) {
            let changed = merge_flags(existing, &message);
            return AppendOutcome::Duplicate { changed };
        }
        let key = message.ordering_key();
        let pos = list.partition_point(|m| m.ordering_key() <= key);
        list.insert(pos, message);
        AppendOutcome::Inserted
    }

    /// Installs the server's canonical history for `peer`.
    ///
    /// The fetched list replaces the stored order. Stored messages missing
    /// from the fetch (pushed after the server took its snapshot) are kept,
    /// so a late fetch never loses a push and never duplicates one.
    pub fn replace_history(&mut self, peer: &UserId, fetched: Vec<Message>) {
        let previous = self.messages.remove(peer).unwrap_or_default();

        let mut list: Vec<Message> = Vec::with_capacity(fetched.len() + previous.len());
        let mut index: HashMap<MessageId, usize> = HashMap::with_capacity(list.capacity());
        for message in fetched.into_iter().chain(previous) {
            if let Some(&at) = index.get(&message.id) {
                merge_flags(&mut list[at], &message);
            } else {
                index.insert(message.id, list.len());
                list.push(message);
            }
        }
        list.sort_by_key(Message::ordering_key);
        self.messages.insert(peer.clone(), list);
    }

    /// Merges `patch` into `peer`'s summary and moves it to the front.
    ///
    /// Creates the summary if the peer has none yet.
    pub fn upsert_summary(&mut self, peer: &UserId, patch: SummaryPatch) {
        let mut summary = match self.summaries.iter().position(|s| s.peer_id == *peer) {
            Some(index) => self.summaries.remove(index),
            None => {
                let mut fresh = ConversationSummary::empty(peer.clone());
                fresh.is_online = self.online.contains(peer);
                fresh.unread_count = self.unread_count(peer);
                fresh
            }
        };

        if let Some(name) = patch.display_name {
            summary.display_name = Some(name);
        }
        if let Some(text) = patch.last_message_text {
            summary.last_message_text = Some(text);
        }
        if let Some(at) = patch.last_message_at {
            summary.last_message_at = Some(at);
        }
        if let Some(count) = patch.unread_count {
            summary.unread_count = count;
            self.unread.insert(peer.clone(), count);
        }
        if let Some(online) = patch.is_online {
            summary.is_online = online;
        }

        self.summaries.insert(0, summary);
    }

    /// Replaces the summary list with a fetched one, kept in server order.
    ///
    /// Listed peers take the server's unread count; counters of peers the
    /// list omits are kept. Presence seen on the push channel is re-applied
    /// on top.
    pub fn replace_summaries(&mut self, summaries: Vec<ConversationSummary>) {
        self.summaries = summaries;
        for summary in &mut self.summaries {
            self.unread
                .insert(summary.peer_id.clone(), summary.unread_count);
            if self.online.contains(&summary.peer_id) {
                summary.is_online = true;
            }
        }
    }

    /// Sets `flag` to `value` on every message of `peer`'s conversation with
    /// `id <= upto` whose sender satisfies `sender`.
    ///
    /// Returns the number of messages whose flag actually changed.
    pub fn mark_range(
        &mut self,
        peer: &UserId,
        upto: MessageId,
        sender: impl Fn(&UserId) -> bool,
        flag: MessageFlag,
        value: bool,
    ) -> usize {
        self.messages.get_mut(peer).map_or(0, |list| {
            list.iter_mut()
                .filter(|m| m.id <= upto && sender(&m.sender_id))
                .map(|m| flag.set(m, value))
                .filter(|changed| *changed)
                .count()
        })
    }

    /// Marks as read every message sent by `sender` with `id <= upto`, in
    /// every conversation.
    ///
    /// Returns the peers whose conversation changed.
    pub fn mark_read_everywhere(&mut self, upto: MessageId, sender: &UserId) -> Vec<UserId> {
        let peers: Vec<UserId> = self.messages.keys().cloned().collect();
        peers
            .into_iter()
            .filter(|peer| {
                self.mark_range(peer, upto, |s| s == sender, MessageFlag::Read, true) > 0
            })
            .collect()
    }

    /// Sets `delivered` on the message `id` authored by `sender`, wherever it
    /// is stored.
    ///
    /// Message ids are globally unique, so the peer is not needed. Returns
    /// the peer whose conversation changed, or `None` if the message is
    /// unknown, authored by someone else, or already delivered.
    pub fn mark_delivered(&mut self, id: MessageId, sender: &UserId) -> Option<UserId> {
        self.messages.iter_mut().find_map(|(peer, list)| {
            let message = list
                .iter_mut()
                .find(|m| m.id == id && m.sender_id == *sender)?;
            MessageFlag::Delivered
                .set(message, true)
                .then(|| peer.clone())
        })
    }

    /// Adds one to `peer`'s unread counter and returns the new value.
    ///
    /// Creates the summary if the peer has none yet.
    pub fn increment_unread(&mut self, peer: &UserId) -> u32 {
        let count = self.unread_count(peer).saturating_add(1);
        self.upsert_summary(
            peer,
            SummaryPatch {
                unread_count: Some(count),
                ..SummaryPatch::default()
            },
        );
        count
    }

    /// Resets `peer`'s unread counter to zero without reordering.
    pub fn reset_unread(&mut self, peer: &UserId) {
        if let Some(count) = self.unread.get_mut(peer) {
            *count = 0;
        }
        if let Some(summary) = self.summaries.iter_mut().find(|s| s.peer_id == *peer) {
            summary.unread_count = 0;
        }
    }

    /// Records `user` as online. Returns `true` if the user was not already
    /// in the online set.
    pub fn set_online(&mut self, user: &UserId) -> bool {
        if let Some(summary) = self.summaries.iter_mut().find(|s| s.peer_id == *user) {
            summary.is_online = true;
        }
        self.online.insert(user.clone())
    }

    /// Whether `user` has been reported online during this session.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.contains(user)
    }

    /// Users reported online during this session, in no particular order.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.online.iter().cloned().collect()
    }

    /// Messages of `peer`'s conversation in (`sent_at`, `id`) order.
    #[must_use]
    pub fn ordered_messages(&self, peer: &UserId) -> &[Message] {
        self.messages
            .get(peer)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Summaries, most recent first.
    #[must_use]
    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    /// The summary of `peer`'s conversation, if any.
    #[must_use]
    pub fn summary(&self, peer: &UserId) -> Option<&ConversationSummary> {
        self.summaries.iter().find(|s| s.peer_id == *peer)
    }

    /// `peer`'s unread counter; zero for a peer never seen.
    #[must_use]
    pub fn unread_count(&self, peer: &UserId) -> u32 {
        self.unread.get(peer).copied().unwrap_or_default()
    }

    /// Whether `peer` has a summary or a tracked unread counter.
    #[must_use]
    pub fn knows_peer(&self, peer: &UserId) -> bool {
        self.unread.contains_key(peer) || self.summary(peer).is_some()
    }
}

/// OR-merges the flags of `incoming` into `existing`.
fn merge_flags(existing: &mut Message, incoming: &Message) -> bool {
    let mut changed = false;
    if incoming.is_read && !existing.is_read {
        existing.is_read = true;
        changed = true;
    }
    if incoming.delivered && !existing.delivered {
        existing.delivered = true;
        changed = true;
    }
    changed
}
