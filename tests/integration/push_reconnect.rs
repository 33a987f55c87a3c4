//! Push channel loss and recovery against the in-memory dev server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use mentorchat::chat::{ChatEvent, ConversationState};
use mentorchat::net::{self, NetConfig, SessionHandle};
use mentorchat::transport::reconnect::ReconnectPolicy;
use mentorchat_devserver::server::{self, DevState};
use mentorchat_proto::message::UserId;

const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
        max_attempts: 5,
        jitter: false,
    }
}

async fn start_server() -> (std::net::SocketAddr, Arc<DevState>) {
    let state = Arc::new(DevState::new());
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

async fn start_session(
    addr: std::net::SocketAddr,
    user: &UserId,
) -> (SessionHandle, mpsc::Receiver<ChatEvent>) {
    let base_url = Url::parse(&format!("http://{addr}")).unwrap();
    let mut config = NetConfig::new(base_url, user.clone());
    config.reconnect = fast_policy();
    let (session, mut events) = net::spawn_http_session(config).unwrap();
    wait_connected(&mut events, true).await;
    (session, events)
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

async fn wait_connected(events: &mut mpsc::Receiver<ChatEvent>, up: bool) {
    wait_for(events, |e| {
        matches!(e, ChatEvent::ConnectionStatus { connected } if *connected == up)
    })
    .await;
}

async fn wait_registered(state: &DevState, user: &UserId) {
    let deadline = Instant::now() + TIMEOUT;
    while !state.is_connected(user).await {
        assert!(Instant::now() < deadline, "server never registered {user}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn reconnects_after_server_closes_connection() {
    let (addr, state) = start_server().await;
    let me = UserId::new("1");
    let (session, mut events) = start_session(addr, &me).await;
    wait_registered(&state, &me).await;

    state.close_all_connections().await;

    wait_connected(&mut events, false).await;
    wait_connected(&mut events, true).await;
    wait_registered(&state, &me).await;

    session.shutdown().await;
}

#[tokio::test]
async fn resync_recovers_messages_missed_while_disconnected() {
    let (addr, state) = start_server().await;
    let me = UserId::new("1");
    let peer = UserId::new("2");
    let (session, mut events) = start_session(addr, &me).await;
    wait_registered(&state, &me).await;

    session.open_conversation(&peer).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ChatEvent::StateChanged { state: ConversationState::Open, .. })
    })
    .await;

    // Written straight to the database: no push frame is ever sent for it.
    let missed = state.db.insert(&peer, &me, "you missed this");
    state.disconnect(&me).await;

    wait_connected(&mut events, false).await;
    wait_connected(&mut events, true).await;

    let deadline = Instant::now() + TIMEOUT;
    loop {
        let messages = session.messages(&peer).await.unwrap();
        if messages.iter().any(|m| m.id == missed.id) {
            assert_eq!(messages.len(), 1);
            break;
        }
        assert!(Instant::now() < deadline, "resync never fetched history");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        session.conversation_state(&peer).await.unwrap(),
        ConversationState::Open
    );

    session.shutdown().await;
}

#[tokio::test]
async fn manual_reconnect_refreshes_summaries() {
    let (addr, state) = start_server().await;
    let me = UserId::new("1");
    let peer = UserId::new("2");
    let (session, mut events) = start_session(addr, &me).await;
    wait_registered(&state, &me).await;

    state.db.insert(&peer, &me, "offline hello");
    session.reconnect().await.unwrap();
    wait_connected(&mut events, false).await;
    wait_connected(&mut events, true).await;

    let deadline = Instant::now() + TIMEOUT;
    loop {
        let summaries = session.summaries().await.unwrap();
        if let Some(summary) = summaries.iter().find(|s| s.peer_id == peer) {
            assert_eq!(summary.unread_count, 1);
            assert_eq!(summary.last_message_text.as_deref(), Some("offline hello"));
            break;
        }
        assert!(Instant::now() < deadline, "summaries never refreshed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    session.shutdown().await;
}

#[tokio::test]
async fn rest_keeps_working_while_push_is_down() {
    let (addr, state) = start_server().await;
    let me = UserId::new("1");
    let peer = UserId::new("2");
    let (session, mut events) = start_session(addr, &me).await;
    wait_registered(&state, &me).await;

    state.close_all_connections().await;
    wait_connected(&mut events, false).await;

    // Whether or not the channel is back yet, the send goes over REST.
    session.send_message(&peer, "still here").await.unwrap();
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let messages = session.messages(&peer).await.unwrap();
        if let Some(m) = messages.first() {
            assert_eq!(m.text, "still here");
            assert!(m.delivered);
            assert_eq!(messages.len(), 1);
            break;
        }
        assert!(Instant::now() < deadline, "send never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.db.conversation(&me, &peer).len(), 1);

    session.shutdown().await;
}
