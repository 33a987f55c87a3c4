//! Property-based tests for the conversation store and sync controller.
//!
//! Uses proptest to verify:
//! 1. Any interleaving of pushes and history fetches stores each id once.
//! 2. Stored conversations stay sorted by (`sent_at`, `id`).
//! 3. N pushes to a closed conversation raise its unread count by exactly N,
//!    however summary refreshes (filtered or not, late or not) interleave.
//! 4. A completed history fetch always leaves the unread count at zero.
//! 5. A read receipt marks exactly this user's messages up to its id.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use mentorchat::chat::controller::{Effect, SyncController};
use mentorchat::chat::store::ConversationStore;
use mentorchat_proto::frame::InboundFrame;
use mentorchat_proto::message::{ConversationSummary, Message, MessageId, UserId};
use proptest::prelude::*;

fn me() -> UserId {
    UserId::new("me")
}

/// A message whose content depends only on its id, the way a server copy
/// would. Timestamps are deliberately out of id order and collide.
fn message(id: u64, from: &UserId, to: &UserId) -> Message {
    let offset = i64::try_from((id * 7) % 13).unwrap();
    Message {
        id: MessageId::new(id),
        sender_id: from.clone(),
        receiver_id: to.clone(),
        text: format!("message {id}"),
        sent_at: Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap(),
        is_read: false,
        delivered: false,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Push(u64),
    Fetch(Vec<u64>),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u64..30).prop_map(Op::Push),
        1 => proptest::collection::vec(0u64..30, 0..12).prop_map(Op::Fetch),
    ]
}

#[derive(Debug, Clone)]
enum SyncOp {
    Push,
    Refresh,
    Filter(bool),
    Complete(proptest::sample::Index),
}

fn arb_sync_op() -> impl Strategy<Value = SyncOp> {
    prop_oneof![
        3 => Just(SyncOp::Push),
        1 => Just(SyncOp::Refresh),
        1 => any::<bool>().prop_map(SyncOp::Filter),
        3 => any::<proptest::sample::Index>().prop_map(SyncOp::Complete),
    ]
}

/// Records every summary refresh in `effects` with the list the server
/// would answer at this moment, when `persisted` messages from `peer` exist.
fn record_refreshes(
    effects: &[Effect],
    peer: &UserId,
    persisted: u32,
    pending: &mut Vec<(u64, Vec<ConversationSummary>)>,
) {
    for effect in effects {
        if let Effect::RefreshSummaries { query, generation } = effect {
            let snapshot = if query.is_some() || persisted == 0 {
                Vec::new()
            } else {
                let mut summary = ConversationSummary::empty(peer.clone());
                summary.unread_count = persisted;
                vec![summary]
            };
            pending.push((*generation, snapshot));
        }
    }
}

fn history_generation(effects: &[Effect]) -> u64 {
    effects
        .iter()
        .find_map(|e| match e {
            Effect::FetchHistory { generation, .. } => Some(*generation),
            _ => None,
        })
        .expect("opening a conversation fetches history")
}

proptest! {
    #[test]
    fn ids_are_never_duplicated(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let peer = UserId::new("p");
        let mut store = ConversationStore::new();
        let mut seen = HashSet::new();

        for op in ops {
            match op {
                Op::Push(id) => {
                    store.append_message(&peer, message(id, &peer, &me()));
                    seen.insert(id);
                }
                Op::Fetch(ids) => {
                    let fetched = ids.iter().map(|id| message(*id, &peer, &me())).collect();
                    store.replace_history(&peer, fetched);
                    seen.extend(ids);
                }
            }
        }

        let stored: Vec<u64> = store
            .ordered_messages(&peer)
            .iter()
            .map(|m| m.id.as_u64())
            .collect();
        let unique: HashSet<u64> = stored.iter().copied().collect();
        prop_assert_eq!(unique.len(), stored.len());
        prop_assert_eq!(unique, seen);
    }

    #[test]
    fn conversations_stay_ordered(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let peer = UserId::new("p");
        let mut store = ConversationStore::new();

        for op in ops {
            match op {
                Op::Push(id) => {
                    store.append_message(&peer, message(id, &peer, &me()));
                }
                Op::Fetch(ids) => {
                    let fetched = ids.iter().map(|id| message(*id, &peer, &me())).collect();
                    store.replace_history(&peer, fetched);
                }
            }
            let keys: Vec<_> = store
                .ordered_messages(&peer)
                .iter()
                .map(Message::ordering_key)
                .collect();
            prop_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn closed_conversation_counts_each_new_message_once(
        ids in proptest::collection::hash_set(1u64..10_000, 0..25),
        start in 0u32..5,
    ) {
        let peer = UserId::new("p");
        let mut controller = SyncController::new(me());
        // Pre-existing unread messages.
        for id in 0..u64::from(start) {
            controller.handle_frame(InboundFrame::Message {
                message: message(100_000 + id, &peer, &me()),
            });
        }
        prop_assert_eq!(controller.store().unread_count(&peer), start);

        for id in &ids {
            controller.handle_frame(InboundFrame::Message {
                message: message(*id, &peer, &me()),
            });
        }
        // Replaying the same frames must not count again.
        for id in &ids {
            controller.handle_frame(InboundFrame::Message {
                message: message(*id, &peer, &me()),
            });
        }

        let expected = start + u32::try_from(ids.len()).unwrap();
        prop_assert_eq!(controller.store().unread_count(&peer), expected);
    }

    #[test]
    fn completed_history_fetch_clears_unread(
        unread in 0u32..20,
        fetched in proptest::collection::vec(1u64..100, 0..10),
    ) {
        let peer = UserId::new("p");
        let mut controller = SyncController::new(me());
        for id in 0..u64::from(unread) {
            controller.handle_frame(InboundFrame::Message {
                message: message(1_000 + id, &peer, &me()),
            });
        }

        let effects = controller.open_conversation(&peer);
        let generation = history_generation(&effects);
        let history = fetched.iter().map(|id| message(*id, &peer, &me())).collect();
        controller.on_history_loaded(&peer, generation, history);

        prop_assert_eq!(controller.store().unread_count(&peer), 0);
    }

    #[test]
    fn read_receipt_marks_exactly_own_messages_up_to_id(
        sent in proptest::collection::vec((0usize..3, any::<bool>()), 1..30),
        upto in 0u64..35,
    ) {
        let peers = [UserId::new("a"), UserId::new("b"), UserId::new("c")];
        let mut store = ConversationStore::new();
        for (id, (peer_index, mine)) in (1u64..).zip(&sent) {
            let peer = &peers[*peer_index];
            let m = if *mine {
                message(id, &me(), peer)
            } else {
                message(id, peer, &me())
            };
            store.append_message(peer, m);
        }

        store.mark_read_everywhere(MessageId::new(upto), &me());

        for peer in &peers {
            for m in store.ordered_messages(peer) {
                let should_be_read = m.sender_id == me() && m.id.as_u64() <= upto;
                prop_assert_eq!(m.is_read, should_be_read, "message {:?}", m.id);
            }
        }
    }

    #[test]
    fn unread_survives_interleaved_refreshes(
        ops in proptest::collection::vec(arb_sync_op(), 1..60),
    ) {
        let peer = UserId::new("p");
        let mut controller = SyncController::new(me());
        let mut pending = Vec::new();
        let mut persisted = 0u32;

        for op in ops {
            match op {
                SyncOp::Push => {
                    persisted += 1;
                    let effects = controller.handle_frame(InboundFrame::Message {
                        message: message(u64::from(persisted), &peer, &me()),
                    });
                    record_refreshes(&effects, &peer, persisted, &mut pending);
                }
                SyncOp::Refresh => {
                    let effects = controller.refresh_summaries(None);
                    record_refreshes(&effects, &peer, persisted, &mut pending);
                }
                SyncOp::Filter(on) => {
                    let query = if on { "zzz".to_string() } else { String::new() };
                    let effects = controller.refresh_summaries(Some(query));
                    record_refreshes(&effects, &peer, persisted, &mut pending);
                }
                SyncOp::Complete(index) => {
                    if !pending.is_empty() {
                        let (generation, snapshot) = pending.remove(index.index(pending.len()));
                        controller.on_summaries_loaded(generation, snapshot);
                    }
                }
            }
            prop_assert_eq!(controller.store().unread_count(&peer), persisted);
        }
    }
}
