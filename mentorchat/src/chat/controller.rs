//! Sync controller: the per-conversation state machine.
//!
//! [`SyncController`] owns the session's [`ConversationStore`] and applies
//! every input to it synchronously: push frames, completed REST calls and
//! UI actions. Anything that needs I/O is returned as an [`Effect`] for the
//! session driver ([`crate::net`]) to execute; the driver feeds the results
//! back through the `on_*` methods.
//!
//! History fetches and summary refreshes are tagged with a generation
//! number. A completion older than the latest request of the same kind (for
//! the same peer, in the case of history) is discarded, since the newer
//! request will replace whatever it would have installed.

use std::collections::HashMap;

use mentorchat_proto::frame::{InboundFrame, OutboundFrame};
use mentorchat_proto::message::{ConversationSummary, Message, MessageId, UserId};

use super::store::{AppendOutcome, ConversationStore, SummaryPatch};
use super::{ChatEvent, ConversationState};

/// Work requested by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// `GET .../chats/{peer}/messages/`, then call
    /// [`SyncController::on_history_loaded`].
    FetchHistory {
        /// The conversation to fetch.
        peer: UserId,
        /// Tag to hand back on completion.
        generation: u64,
    },
    /// `GET .../chats/`, then call [`SyncController::on_summaries_loaded`].
    RefreshSummaries {
        /// Search filter (`q`), if any.
        query: Option<String>,
        /// Tag to hand back on completion.
        generation: u64,
    },
    /// `POST .../chats/{peer}/send/`, then call
    /// [`SyncController::on_message_sent`].
    PostMessage {
        /// The recipient.
        peer: UserId,
        /// The text to send.
        text: String,
    },
    /// Write a frame to the push channel.
    SendFrame(OutboundFrame),
    /// Tell UI consumers something changed.
    Notify(ChatEvent),
}

/// Reconciles push frames, REST results and local actions into the store.
#[derive(Debug)]
pub struct SyncController {
    /// The logged-in user.
    me: UserId,
    /// The session's conversation cache.
    store: ConversationStore,
    /// Viewing state per conversation; absent means `Closed`.
    states: HashMap<UserId, ConversationState>,
    /// Latest history request generation per peer.
    history_generations: HashMap<UserId, u64>,
    /// Latest summary refresh generation.
    summary_generation: u64,
    /// The latest summary refresh has not completed yet.
    summary_in_flight: bool,
    /// Source of generation numbers.
    next_generation: u64,
    /// Search filter applied to summary refreshes.
    query: Option<String>,
}

impl SyncController {
    /// Creates a controller with an empty store for `me`.
    #[must_use]
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            store: ConversationStore::new(),
            states: HashMap::new(),
            history_generations: HashMap::new(),
            summary_generation: 0,
            summary_in_flight: false,
            next_generation: 0,
            query: None,
        }
    }

    /// The logged-in user.
    #[must_use]
    pub const fn me(&self) -> &UserId {
        &self.me
    }

    /// Read access to the conversation cache.
    #[must_use]
    pub const fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// The viewing state of `peer`'s conversation.
    #[must_use]
    pub fn state(&self, peer: &UserId) -> ConversationState {
        self.states.get(peer).copied().unwrap_or_default()
    }

    /// The search filter currently applied to summary refreshes.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    // -----------------------------------------------------------------------
    // UI actions
    // -----------------------------------------------------------------------

    /// The user opened `peer`'s conversation.
    pub fn open_conversation(&mut self, peer: &UserId) -> Vec<Effect> {
        let mut effects = self.set_state(peer, ConversationState::Loading);
        effects.push(self.fetch_history(peer));
        effects
    }

    /// The user closed `peer`'s conversation.
    pub fn close_conversation(&mut self, peer: &UserId) -> Vec<Effect> {
        self.set_state(peer, ConversationState::Closed)
    }

    /// The user sent `text` to `peer`.
    ///
    /// Nothing is appended until the server echoes the persisted message.
    pub fn send_message(&mut self, peer: &UserId, text: &str) -> Vec<Effect> {
        if text.trim().is_empty() {
            tracing::debug!(peer = %peer, "ignoring empty message");
            return Vec::new();
        }
        vec![Effect::PostMessage {
            peer: peer.clone(),
            text: text.to_string(),
        }]
    }

    /// Reloads the summary list, optionally changing the search filter.
    ///
    /// `None` keeps the current filter; `Some("")` clears it.
    pub fn refresh_summaries(&mut self, query: Option<String>) -> Vec<Effect> {
        if let Some(query) = query {
            self.query = (!query.is_empty()).then_some(query);
        }
        vec![self.summary_refresh()]
    }

    /// Re-reads everything the push channel may have missed: the summary
    /// list and the history of every viewed conversation.
    pub fn resync(&mut self) -> Vec<Effect> {
        let viewed: Vec<UserId> = self
            .states
            .iter()
            .filter(|(_, state)| state.is_viewed())
            .map(|(peer, _)| peer.clone())
            .collect();
        let mut effects = vec![self.summary_refresh()];
        for peer in &viewed {
            effects.push(self.fetch_history(peer));
        }
        effects
    }

    // -----------------------------------------------------------------------
    // Push frames
    // -----------------------------------------------------------------------

    /// Applies one push frame. Frames must be passed in arrival order.
    pub fn handle_frame(&mut self, frame: InboundFrame) -> Vec<Effect> {
        match frame {
            InboundFrame::Message { message } => self.on_pushed_message(message),
            InboundFrame::Online { user_id } => {
                if self.store.set_online(&user_id) {
                    tracing::debug!(user = %user_id, "user online");
                    vec![Effect::Notify(ChatEvent::PresenceChanged { user: user_id })]
                } else {
                    Vec::new()
                }
            }
            InboundFrame::MessageDelivered {
                message_id,
                delivered_by,
            } => self.on_delivered(message_id, delivered_by.as_ref()),
            InboundFrame::MessagesRead {
                reader_id,
                last_read_message_id,
            } => self.on_messages_read(&reader_id, last_read_message_id),
        }
    }

    fn on_pushed_message(&mut self, message: Message) -> Vec<Effect> {
        let Some(peer) = message.peer_of(&self.me).cloned() else {
            tracing::debug!(
                message_id = %message.id,
                "ignoring pushed message not addressed to this user"
            );
            return Vec::new();
        };

        if message.sender_id == self.me {
            return self.on_own_echo(&peer, message);
        }

        let known_peer = self.store.knows_peer(&peer);
        let patch = SummaryPatch::last_message(&message);
        let message_id = message.id;
        let outcome = self.store.append_message(&peer, message.clone());

        if let AppendOutcome::Duplicate { changed } = outcome {
            tracing::debug!(peer = %peer, message_id = %message_id, "duplicate push");
            return if changed {
                vec![Effect::Notify(ChatEvent::ConversationUpdated { peer })]
            } else {
                Vec::new()
            };
        }

        self.store.upsert_summary(&peer, patch);
        let mut effects = vec![
            Effect::Notify(ChatEvent::MessageReceived {
                peer: peer.clone(),
                message,
            }),
            Effect::Notify(ChatEvent::ConversationUpdated { peer: peer.clone() }),
        ];

        if self.state(&peer).is_viewed() {
            // The fetch marks the message read server-side and clears the badge.
            effects.push(self.fetch_history(&peer));
        } else {
            let unread = self.store.increment_unread(&peer);
            tracing::debug!(peer = %peer, unread, "message for closed conversation");
            effects.push(Effect::SendFrame(OutboundFrame::Delivered {
                message_id,
                to: peer.clone(),
            }));
            // A refresh still in flight may carry a snapshot older than this
            // message, so it is superseded.
            if !known_peer || self.summary_in_flight {
                effects.push(self.summary_refresh());
            }
        }
        effects.push(Effect::Notify(ChatEvent::SummariesUpdated));
        effects
    }

    fn on_own_echo(&mut self, peer: &UserId, message: Message) -> Vec<Effect> {
        let patch = SummaryPatch::last_message(&message);
        match self.store.append_message(peer, message) {
            AppendOutcome::Inserted => {
                self.store.upsert_summary(peer, patch);
                vec![
                    Effect::Notify(ChatEvent::ConversationUpdated { peer: peer.clone() }),
                    Effect::Notify(ChatEvent::SummariesUpdated),
                ]
            }
            AppendOutcome::Duplicate { changed: true } => {
                vec![Effect::Notify(ChatEvent::ConversationUpdated { peer: peer.clone() })]
            }
            AppendOutcome::Duplicate { changed: false } => Vec::new(),
        }
    }

    fn on_delivered(&mut self, message_id: MessageId, by: Option<&UserId>) -> Vec<Effect> {
        match self.store.mark_delivered(message_id, &self.me) {
            Some(peer) => {
                tracing::debug!(message_id = %message_id, by = ?by, "message delivered");
                vec![Effect::Notify(ChatEvent::ConversationUpdated { peer })]
            }
            None => Vec::new(),
        }
    }

    fn on_messages_read(&mut self, reader: &UserId, upto: MessageId) -> Vec<Effect> {
        let changed = self.store.mark_read_everywhere(upto, &self.me);
        tracing::debug!(
            reader = %reader,
            upto = %upto,
            conversations = changed.len(),
            "read receipt"
        );
        let mut effects: Vec<Effect> = changed
            .into_iter()
            .map(|peer| Effect::Notify(ChatEvent::ConversationUpdated { peer }))
            .collect();
        effects.push(self.summary_refresh());
        effects
    }

    // -----------------------------------------------------------------------
    // REST completions
    // -----------------------------------------------------------------------

    /// A history fetch for `peer` succeeded.
    pub fn on_history_loaded(
        &mut self,
        peer: &UserId,
        generation: u64,
        messages: Vec<Message>,
    ) -> Vec<Effect> {
        if self.history_generations.get(peer) != Some(&generation) {
            tracing::debug!(peer = %peer, generation, "discarding stale history response");
            return Vec::new();
        }

        self.store.replace_history(peer, messages);
        self.store.reset_unread(peer);

        let mut effects = vec![
            Effect::Notify(ChatEvent::ConversationUpdated { peer: peer.clone() }),
            Effect::Notify(ChatEvent::SummariesUpdated),
        ];
        if self.state(peer) == ConversationState::Loading {
            effects.extend(self.set_state(peer, ConversationState::Open));
        }
        effects
    }

    /// A summary refresh succeeded.
    pub fn on_summaries_loaded(
        &mut self,
        generation: u64,
        summaries: Vec<ConversationSummary>,
    ) -> Vec<Effect> {
        if generation != self.summary_generation {
            tracing::debug!(generation, "discarding stale summary response");
            return Vec::new();
        }
        self.summary_in_flight = false;
        self.store.replace_summaries(summaries);
        // Viewed conversations have been read locally even if the server
        // has not caught up yet.
        let viewed: Vec<UserId> = self
            .states
            .iter()
            .filter(|(_, state)| **state == ConversationState::Open)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &viewed {
            self.store.reset_unread(peer);
        }
        vec![Effect::Notify(ChatEvent::SummariesUpdated)]
    }

    /// A summary refresh failed.
    pub fn on_summaries_failed(&mut self, generation: u64) {
        if generation == self.summary_generation {
            self.summary_in_flight = false;
        }
    }

    /// A send to `peer` was persisted; `message` is the server echo.
    pub fn on_message_sent(&mut self, peer: &UserId, mut message: Message) -> Vec<Effect> {
        message.delivered = true;
        let patch = SummaryPatch::last_message(&message);
        self.store.append_message(peer, message);
        self.store.upsert_summary(peer, patch);
        vec![
            Effect::Notify(ChatEvent::ConversationUpdated { peer: peer.clone() }),
            Effect::Notify(ChatEvent::SummariesUpdated),
            self.summary_refresh(),
        ]
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn set_state(&mut self, peer: &UserId, state: ConversationState) -> Vec<Effect> {
        let previous = self.states.insert(peer.clone(), state).unwrap_or_default();
        if previous == state {
            return Vec::new();
        }
        tracing::debug!(peer = %peer, from = %previous, to = %state, "conversation state");
        vec![Effect::Notify(ChatEvent::StateChanged {
            peer: peer.clone(),
            state,
        })]
    }

    fn fetch_history(&mut self, peer: &UserId) -> Effect {
        let generation = self.bump_generation();
        self.history_generations.insert(peer.clone(), generation);
        Effect::FetchHistory {
            peer: peer.clone(),
            generation,
        }
    }

    fn summary_refresh(&mut self) -> Effect {
        let generation = self.bump_generation();
        self.summary_generation = generation;
        self.summary_in_flight = true;
        Effect::RefreshSummaries {
            query: self.query.clone(),
            generation,
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}
