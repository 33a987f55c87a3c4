//! End-to-end chat synchronization against the in-memory dev server.
//!
//! Each test starts a server on an ephemeral port and runs real sessions
//! (REST over HTTP, push over WebSocket) for two or more users.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use mentorchat::chat::{ChatEvent, ConversationState};
use mentorchat::net::{self, NetConfig, SessionHandle};
use mentorchat_devserver::server::{self, DevState};
use mentorchat_devserver::store::ChatDb;
use mentorchat_proto::message::{ConversationSummary, Message, UserId};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    id: UserId,
    session: SessionHandle,
    events: mpsc::Receiver<ChatEvent>,
}

async fn start_server(db: ChatDb) -> (std::net::SocketAddr, Arc<DevState>) {
    let state = Arc::new(DevState::with_db(db));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

/// Starts a session for `user` and waits until its push channel is up and
/// the server has registered it.
async fn connect(addr: std::net::SocketAddr, state: &DevState, user: &str) -> Client {
    let id = UserId::new(user);
    let base_url = Url::parse(&format!("http://{addr}")).unwrap();
    let (session, mut events) = net::spawn_http_session(NetConfig::new(base_url, id.clone())).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ChatEvent::ConnectionStatus { connected: true })
    })
    .await;
    let deadline = Instant::now() + TIMEOUT;
    while !state.is_connected(&id).await {
        assert!(Instant::now() < deadline, "server never registered {id}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Client {
        id,
        session,
        events,
    }
}

async fn wait_for(events: &mut mpsc::Receiver<ChatEvent>, pred: impl Fn(&ChatEvent) -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return;
        }
    }
}

/// Polls `peer`'s stored conversation until `pred` holds.
async fn wait_messages(
    client: &Client,
    peer: &UserId,
    pred: impl Fn(&[Message]) -> bool,
) -> Vec<Message> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let messages = client.session.messages(peer).await.unwrap();
        if pred(&messages) {
            return messages;
        }
        assert!(
            Instant::now() < deadline,
            "conversation {peer} never matched, last seen: {messages:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls the summary list until `pred` holds.
async fn wait_summaries(
    client: &Client,
    pred: impl Fn(&[ConversationSummary]) -> bool,
) -> Vec<ConversationSummary> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let summaries = client.session.summaries().await.unwrap();
        if pred(&summaries) {
            return summaries;
        }
        assert!(
            Instant::now() < deadline,
            "summaries never matched, last seen: {summaries:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn unread(summaries: &[ConversationSummary], peer: &UserId) -> Option<u32> {
    summaries
        .iter()
        .find(|s| s.peer_id == *peer)
        .map(|s| s.unread_count)
}

#[tokio::test]
async fn message_to_closed_conversation_is_unread_until_opened() {
    let (addr, state) = start_server(ChatDb::new()).await;
    let mut alice = connect(addr, &state, "1").await;
    let bob = connect(addr, &state, "2").await;

    bob.session.send_message(&alice.id, "hi alice").await.unwrap();

    wait_for(&mut alice.events, |e| {
        matches!(e, ChatEvent::MessageReceived { peer, .. } if peer.as_str() == "2")
    })
    .await;
    wait_summaries(&alice, |s| unread(s, &bob.id) == Some(1)).await;

    alice.session.open_conversation(&bob.id).await.unwrap();
    wait_for(&mut alice.events, |e| {
        matches!(e, ChatEvent::StateChanged { state: ConversationState::Open, .. })
    })
    .await;

    let messages = alice.session.messages(&bob.id).await.unwrap();
    assert_eq!(messages.len(), 1, "pushed and fetched copies must merge");
    assert_eq!(messages[0].text, "hi alice");
    assert!(messages[0].is_read);
    assert_eq!(
        unread(&alice.session.summaries().await.unwrap(), &bob.id),
        Some(0)
    );

    alice.session.shutdown().await;
    bob.session.shutdown().await;
}

#[tokio::test]
async fn sent_message_is_delivered_and_late_ack_changes_nothing() {
    let (addr, state) = start_server(ChatDb::new()).await;
    let alice = connect(addr, &state, "1").await;
    let bob = connect(addr, &state, "2").await;

    alice.session.send_message(&bob.id, "hello bob").await.unwrap();
    let sent = wait_messages(&alice, &bob.id, |m| m.len() == 1).await;
    assert!(sent[0].delivered);

    // Bob has the conversation closed, so his client acks delivery and the
    // server relays a `message_delivered` frame back to alice.
    wait_summaries(&bob, |s| unread(s, &alice.id) == Some(1)).await;
    let deadline = Instant::now() + TIMEOUT;
    while !state.db.get(sent[0].id).unwrap().delivered {
        assert!(Instant::now() < deadline, "delivered ack never reached server");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = alice.session.messages(&bob.id).await.unwrap();
    assert_eq!(after, sent);

    alice.session.shutdown().await;
    bob.session.shutdown().await;
}

#[tokio::test]
async fn opening_conversation_sends_read_receipt_to_sender() {
    let (addr, state) = start_server(ChatDb::new()).await;
    let alice = connect(addr, &state, "1").await;
    let carol = connect(addr, &state, "3").await;
    let bob = connect(addr, &state, "2").await;

    // Sends are awaited one by one so server ids follow this order.
    alice.session.send_message(&carol.id, "other").await.unwrap();
    wait_messages(&alice, &carol.id, |m| m.len() == 1).await;
    alice.session.send_message(&bob.id, "one").await.unwrap();
    wait_messages(&alice, &bob.id, |m| m.len() == 1).await;
    alice.session.send_message(&bob.id, "two").await.unwrap();
    wait_messages(&alice, &bob.id, |m| m.len() == 2).await;
    wait_summaries(&bob, |s| unread(s, &alice.id) == Some(2)).await;

    bob.session.open_conversation(&alice.id).await.unwrap();

    let read = wait_messages(&alice, &bob.id, |m| m.iter().all(|m| m.is_read)).await;
    assert_eq!(read.len(), 2);
    // The receipt covers every message alice sent up to bob's last read
    // id, including the earlier one to carol.
    let to_carol = wait_messages(&alice, &carol.id, |m| m.iter().all(|m| m.is_read)).await;
    assert_eq!(to_carol.len(), 1);

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    carol.session.shutdown().await;
}

#[tokio::test]
async fn live_message_in_open_conversation_is_read_immediately() {
    let (addr, state) = start_server(ChatDb::new()).await;
    let alice = connect(addr, &state, "1").await;
    let mut bob = connect(addr, &state, "2").await;

    bob.session.open_conversation(&alice.id).await.unwrap();
    wait_for(&mut bob.events, |e| {
        matches!(e, ChatEvent::StateChanged { state: ConversationState::Open, .. })
    })
    .await;

    alice.session.send_message(&bob.id, "are you there?").await.unwrap();
    let messages = wait_messages(&bob, &alice.id, |m| m.len() == 1 && m[0].is_read).await;
    assert_eq!(messages[0].text, "are you there?");
    wait_summaries(&bob, |s| unread(s, &alice.id).unwrap_or(0) == 0).await;
    wait_messages(&alice, &bob.id, |m| m.len() == 1 && m[0].is_read).await;

    alice.session.shutdown().await;
    bob.session.shutdown().await;
}

#[tokio::test]
async fn presence_is_reported_to_connected_users() {
    let (addr, state) = start_server(ChatDb::new()).await;
    let alice = connect(addr, &state, "1").await;
    let bob = connect(addr, &state, "2").await;

    let deadline = Instant::now() + TIMEOUT;
    loop {
        let alice_sees = alice.session.online_users().await.unwrap();
        let bob_sees = bob.session.online_users().await.unwrap();
        if alice_sees.contains(&bob.id) && bob_sees.contains(&alice.id) {
            break;
        }
        assert!(Instant::now() < deadline, "presence never propagated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    alice.session.shutdown().await;
    bob.session.shutdown().await;
}

#[tokio::test]
async fn summary_query_filters_the_list() {
    let db = ChatDb::with_users([
        (UserId::new("2"), "Dana Mentor".to_string()),
        (UserId::new("3"), "Sam Student".to_string()),
    ]);
    let (addr, state) = start_server(db).await;
    let alice = connect(addr, &state, "1").await;

    wait_summaries(&alice, |s| s.len() == 2).await;

    alice
        .session
        .refresh_summaries(Some("dana".to_string()))
        .await
        .unwrap();
    let filtered = wait_summaries(&alice, |s| s.len() == 1).await;
    assert_eq!(filtered[0].peer_id, UserId::new("2"));
    assert_eq!(filtered[0].display_name.as_deref(), Some("Dana Mentor"));

    alice.session.refresh_summaries(Some(String::new())).await.unwrap();
    wait_summaries(&alice, |s| s.len() == 2).await;

    alice.session.shutdown().await;
}
