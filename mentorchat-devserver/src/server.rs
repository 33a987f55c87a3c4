//! Development backend: shared state, REST handlers and the chat WebSocket.
//!
//! Speaks the same contract as the production backend:
//!
//! - `GET  /ws/chat/?user_id={id}` push channel
//! - `GET  /api/communications/chats/?user_id={id}&q={query}`
//! - `GET  /api/communications/chats/{peer}/messages/?me={id}`
//! - `POST /api/communications/chats/{peer}/send/`
//!
//! Each connected user has one registered push connection; a second
//! connection for the same user replaces the first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};

use mentorchat_proto::api::{
    CHATS_PATH, ChatListResponse, MessagesResponse, SendRequest, SendResponse, WS_CHAT_PATH,
};
use mentorchat_proto::frame::{self, InboundFrame, OutboundFrame};
use mentorchat_proto::message::UserId;

use crate::store::ChatDb;

/// A registered push connection.
struct Connection {
    /// Distinguishes successive connections of the same user.
    id: u64,
    /// Feeds the connection's WebSocket writer task.
    sender: mpsc::UnboundedSender<WsMessage>,
}

/// Shared server state: message database, push connections, online set.
pub struct DevState {
    /// Persisted messages and known users.
    pub db: ChatDb,
    /// Push connection per connected user.
    connections: RwLock<HashMap<UserId, Connection>>,
    /// Users with an open push connection.
    online: RwLock<HashSet<UserId>>,
    /// Source of connection ids.
    next_connection_id: AtomicU64,
}

impl Default for DevState {
    fn default() -> Self {
        Self::new()
    }
}

impl DevState {
    /// Creates a state with an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::with_db(ChatDb::new())
    }

    /// Creates a state around a pre-populated database.
    #[must_use]
    pub fn with_db(db: ChatDb) -> Self {
        Self {
            db,
            connections: RwLock::new(HashMap::new()),
            online: RwLock::new(HashSet::new()),
            next_connection_id: AtomicU64::new(0),
        }
    }

    /// Registers a push connection for `user`, replacing any previous one.
    /// Returns the new connection's id.
    async fn register(&self, user: &UserId, sender: mpsc::UnboundedSender<WsMessage>) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .connections
            .write()
            .await
            .insert(user.clone(), Connection { id, sender });
        if previous.is_some() {
            tracing::info!(user = %user, "replaced existing connection");
        }
        self.online.write().await.insert(user.clone());
        id
    }

    /// Removes `user`'s connection if it is still connection `id`.
    async fn unregister(&self, user: &UserId, id: u64) {
        let mut conns = self.connections.write().await;
        if conns.get(user).is_some_and(|c| c.id == id) {
            conns.remove(user);
            drop(conns);
            self.online.write().await.remove(user);
        }
    }

    /// Whether `user` has an open push connection.
    pub async fn is_connected(&self, user: &UserId) -> bool {
        self.connections.read().await.contains_key(user)
    }

    /// Snapshot of the online set.
    pub async fn online_users(&self) -> HashSet<UserId> {
        self.online.read().await.clone()
    }

    /// Pushes `frame` to `user` if connected. Returns whether it was queued
    /// for sending.
    pub async fn push(&self, user: &UserId, frame: &InboundFrame) -> bool {
        let text = match frame::encode_inbound(frame) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode push frame");
                return false;
            }
        };
        let conns = self.connections.read().await;
        conns
            .get(user)
            .is_some_and(|c| c.sender.send(WsMessage::Text(text.into())).is_ok())
    }

    /// Sends a close frame to `user`'s push connection, if any.
    pub async fn disconnect(&self, user: &UserId) {
        if let Some(conn) = self.connections.read().await.get(user) {
            tracing::info!(user = %user, "closing push connection");
            let _ = conn.sender.send(WsMessage::Close(None));
        }
    }

    /// Sends a close frame to every connected user.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (user, conn) in conns.iter() {
            tracing::info!(user = %user, "sending close frame");
            let _ = conn.sender.send(WsMessage::Close(None));
        }
    }
}

/// Handles an upgraded push connection for `user`.
///
/// The connection lifecycle:
/// 1. Register the connection and mark the user online.
/// 2. Tell the user who else is online, and everyone else that the user is.
/// 3. Process `delivered` acks until the socket closes.
/// 4. Unregister.
pub async fn handle_socket(socket: WebSocket, user: UserId, state: Arc<DevState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let conn_id = state.register(&user, tx).await;
    tracing::info!(user = %user, "push connection opened");

    let others: Vec<UserId> = state
        .online_users()
        .await
        .into_iter()
        .filter(|u| *u != user)
        .collect();
    for other in &others {
        state
            .push(
                &user,
                &InboundFrame::Online {
                    user_id: other.clone(),
                },
            )
            .await;
        state
            .push(
                other,
                &InboundFrame::Online {
                    user_id: user.clone(),
                },
            )
            .await;
    }

    // Writer task: forward queued frames to the socket.
    let writer_user = user.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader task: process acks from the client.
    let reader_user = user.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_client_frame(&reader_user, text.as_str(), &reader_state).await;
                }
                WsMessage::Close(_) => {
                    tracing::info!(user = %reader_user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(&user, conn_id).await;
    tracing::info!(user = %user, "push connection closed");
}

/// Handles one text frame from a connected client.
async fn handle_client_frame(user: &UserId, text: &str, state: &Arc<DevState>) {
    let frame = match frame::decode_outbound(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(user = %user, error = %e, "failed to decode client frame");
            return;
        }
    };

    let OutboundFrame::Delivered { message_id, to } = frame;
    let Some(message) = state.db.mark_delivered(message_id, user) else {
        tracing::debug!(user = %user, message_id = %message_id, "ignoring delivered ack");
        return;
    };
    if message.sender_id != to {
        tracing::debug!(
            user = %user,
            to = %to,
            sender = %message.sender_id,
            "delivered ack names wrong sender, notifying actual sender"
        );
    }
    state
        .push(
            &message.sender_id,
            &InboundFrame::MessageDelivered {
                message_id,
                delivered_by: Some(user.clone()),
            },
        )
        .await;
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsParams {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    user_id: Option<String>,
    #[serde(default)]
    q: String,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    me: Option<String>,
}

/// axum handler that upgrades `/ws/chat/?user_id=` to a push connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<DevState>>,
) -> Response {
    let Some(user) = params.user_id.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    };
    let user = UserId::new(user);
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
        .into_response()
}

async fn list_chats(
    Query(params): Query<ListParams>,
    State(state): State<Arc<DevState>>,
) -> (StatusCode, Json<ChatListResponse>) {
    let Some(me) = params.user_id.filter(|u| !u.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ChatListResponse {
                success: false,
                users: Vec::new(),
                error: Some("user_id is required".into()),
            }),
        );
    };
    let online = state.online_users().await;
    let users = state.db.summaries(&UserId::new(me), &params.q, &online);
    (
        StatusCode::OK,
        Json(ChatListResponse {
            success: true,
            users,
            error: None,
        }),
    )
}

async fn fetch_messages(
    Path(peer): Path<String>,
    Query(params): Query<HistoryParams>,
    State(state): State<Arc<DevState>>,
) -> (StatusCode, Json<MessagesResponse>) {
    let Some(me) = params.me.filter(|u| !u.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(MessagesResponse {
                success: false,
                messages: Vec::new(),
                error: Some("me is required".into()),
            }),
        );
    };
    let me = UserId::new(me);
    let peer = UserId::new(peer);

    if let Some(last_read) = state.db.mark_read(&me, &peer) {
        tracing::debug!(reader = %me, peer = %peer, last_read = %last_read, "messages read");
        state
            .push(
                &peer,
                &InboundFrame::MessagesRead {
                    reader_id: me.clone(),
                    last_read_message_id: last_read,
                },
            )
            .await;
    }

    (
        StatusCode::OK,
        Json(MessagesResponse {
            success: true,
            messages: state.db.conversation(&me, &peer),
            error: None,
        }),
    )
}

async fn send_message(
    Path(peer): Path<String>,
    State(state): State<Arc<DevState>>,
    Json(request): Json<SendRequest>,
) -> (StatusCode, Json<SendResponse>) {
    if request.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SendResponse {
                success: false,
                data: None,
                error: Some("message text is empty".into()),
            }),
        );
    }
    let peer = UserId::new(peer);
    let message = state.db.insert(&request.me, &peer, &request.text);
    tracing::debug!(from = %request.me, to = %peer, id = %message.id, "message stored");

    let push = InboundFrame::Message {
        message: message.clone(),
    };
    state.push(&peer, &push).await;
    if peer != request.me {
        state.push(&request.me, &push).await;
    }

    // The message is persisted, which the sender treats as delivered.
    let mut echo = message;
    echo.delivered = true;
    (
        StatusCode::OK,
        Json(SendResponse {
            success: true,
            data: Some(echo),
            error: None,
        }),
    )
}

/// Builds the router for `state`.
pub fn router(state: Arc<DevState>) -> axum::Router {
    axum::Router::new()
        .route(WS_CHAT_PATH, axum::routing::get(ws_handler))
        .route(CHATS_PATH, axum::routing::get(list_chats))
        .route(
            &format!("{CHATS_PATH}{{peer}}/messages/"),
            axum::routing::get(fetch_messages),
        )
        .route(
            &format!("{CHATS_PATH}{{peer}}/send/"),
            axum::routing::post(send_message),
        )
        .with_state(state)
}

/// Starts the server on the given address and returns the bound address and
/// a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(DevState::new())).await
}

/// Starts the server with a pre-configured [`DevState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<DevState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "dev server error");
        }
    });

    Ok((bound_addr, handle))
}
