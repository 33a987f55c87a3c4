//! Session driver: wires the [`SyncController`] to the network.
//!
//! [`spawn_session`] starts one background task per logged-in user. The task
//! owns the controller (and through it the conversation store), holds the
//! single push connection and executes the controller's effects. UI code
//! talks to it through a [`SessionHandle`] and listens for [`ChatEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! UI ── SessionCommand ──▶ ┌──────────────┐ ── REST tasks ──▶ ChatApi
//!                          │  event loop  │ ◀── completions ──┘
//! UI ◀──── ChatEvent ───── │ (controller) │ ◀── frames ────── PushTransport
//!                          └──────────────┘
//! ```
//!
//! Inputs are handled one at a time in arrival order, so the store needs
//! no locking. REST calls run as spawned tasks and post their results back
//! into the loop; push frames are read directly from the transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use mentorchat_proto::frame::InboundFrame;
use mentorchat_proto::message::{ConversationSummary, Message, UserId};

use crate::api::{ApiError, ChatApi, DEFAULT_REQUEST_TIMEOUT, HttpChatApi};
use crate::chat::controller::{Effect, SyncController};
use crate::chat::{ChatEvent, ConversationState};
use crate::transport::reconnect::ReconnectPolicy;
use crate::transport::ws::{DEFAULT_CONNECT_TIMEOUT, WsConnector};
use crate::transport::{Connector, PushTransport, TransportError};

/// Default channel capacity for session commands.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default channel capacity for UI events.
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Configuration for one chat session.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// HTTP(S) base URL of the backend (e.g. `http://127.0.0.1:8000`).
    pub base_url: Url,
    /// The logged-in user.
    pub user_id: UserId,
    /// Push channel handshake timeout.
    pub connect_timeout: Duration,
    /// Timeout for one REST request.
    pub request_timeout: Duration,
    /// Channel capacity for session commands.
    pub channel_capacity: usize,
    /// Channel capacity for UI events. Events are dropped, with a warning,
    /// when the UI falls this far behind.
    pub event_buffer: usize,
    /// Backoff applied when the push channel drops.
    pub reconnect: ReconnectPolicy,
}

impl NetConfig {
    /// Creates a `NetConfig` with default timeouts, capacities and backoff.
    #[must_use]
    pub fn new(base_url: Url, user_id: UserId) -> Self {
        Self {
            base_url,
            user_id,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            event_buffer: DEFAULT_EVENT_BUFFER,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Errors returned by [`SessionHandle`] methods.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session task has stopped.
    #[error("session is closed")]
    Closed,
}

/// Snapshot of the session's connection state, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// The push channel is up.
    pub connected: bool,
    /// A reconnect attempt is scheduled.
    pub reconnect_pending: bool,
    /// The backoff policy allows reconnecting at all.
    pub reconnect_enabled: bool,
    /// Search filter applied to summary refreshes.
    pub query: Option<String>,
}

/// Requests from a [`SessionHandle`] to the session task.
#[derive(Debug)]
enum SessionCommand {
    Open(UserId),
    Close(UserId),
    Send { peer: UserId, text: String },
    Refresh(Option<String>),
    Messages {
        peer: UserId,
        reply: oneshot::Sender<Vec<Message>>,
    },
    Summaries(oneshot::Sender<Vec<ConversationSummary>>),
    Online(oneshot::Sender<Vec<UserId>>),
    State {
        peer: UserId,
        reply: oneshot::Sender<ConversationState>,
    },
    Status(oneshot::Sender<SessionStatus>),
    Reconnect,
    Shutdown,
}

/// Results posted back to the session task by spawned work.
enum Completion<T> {
    History {
        peer: UserId,
        generation: u64,
        result: Result<Vec<Message>, ApiError>,
    },
    Summaries {
        generation: u64,
        result: Result<Vec<ConversationSummary>, ApiError>,
    },
    Sent {
        peer: UserId,
        result: Result<Message, ApiError>,
    },
    Connected(Result<T, TransportError>),
}

/// Handle to a running session.
///
/// Commands are queued and applied by the session task in order; the
/// read accessors observe the store after every earlier command.
#[derive(Debug)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Open `peer`'s conversation and load its history.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn open_conversation(&self, peer: &UserId) -> Result<(), SessionError> {
        self.command(SessionCommand::Open(peer.clone())).await
    }

    /// Close `peer`'s conversation.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn close_conversation(&self, peer: &UserId) -> Result<(), SessionError> {
        self.command(SessionCommand::Close(peer.clone())).await
    }

    /// Send `text` to `peer`. Empty text is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn send_message(&self, peer: &UserId, text: &str) -> Result<(), SessionError> {
        self.command(SessionCommand::Send {
            peer: peer.clone(),
            text: text.to_string(),
        })
        .await
    }

    /// Reload the conversation list. `Some(q)` changes the search filter,
    /// `Some("")` clears it, `None` keeps it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn refresh_summaries(&self, query: Option<String>) -> Result<(), SessionError> {
        self.command(SessionCommand::Refresh(query)).await
    }

    /// Drop the push connection, if any, and connect again immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::Reconnect).await
    }

    /// Messages of `peer`'s conversation in display order.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn messages(&self, peer: &UserId) -> Result<Vec<Message>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Messages {
            peer: peer.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Conversation summaries, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn summaries(&self) -> Result<Vec<ConversationSummary>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Summaries(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Users reported online during this session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn online_users(&self) -> Result<Vec<UserId>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Online(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Viewing state of `peer`'s conversation.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn conversation_state(
        &self,
        peer: &UserId,
    ) -> Result<ConversationState, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::State {
            peer: peer.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Connection and filter state of the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has stopped.
    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Status(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Stop the session: close the push connection and drop the store.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "session task ended abnormally");
        }
    }

    async fn command(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.cmd_tx.send(cmd).await.map_err(|_| SessionError::Closed)
    }
}

/// Start a session for `config.user_id` against `api` and `connector`.
///
/// Returns immediately. The push channel connects in the background; if it
/// cannot, the session keeps working over REST and retries according to
/// `config.reconnect`. Must be called from within a tokio runtime.
pub fn spawn_session<A, C>(
    config: NetConfig,
    api: A,
    connector: C,
) -> (SessionHandle, mpsc::Receiver<ChatEvent>)
where
    A: ChatApi,
    C: Connector,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity.max(1));
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();

    let session = Session {
        controller: SyncController::new(config.user_id.clone()),
        policy: config.reconnect,
        api: Arc::new(api),
        connector: Arc::new(connector),
        transport: None,
        connecting: false,
        resync_on_connect: false,
        reconnect_attempt: 0,
        reconnect_at: None,
        completion_tx,
        event_tx,
    };
    let task = tokio::spawn(session.run(cmd_rx, completion_rx));

    (SessionHandle { cmd_tx, task }, event_rx)
}

/// Start a session against a real backend: REST over [`HttpChatApi`], push
/// over [`WsConnector`].
///
/// # Errors
///
/// Returns [`ApiError::Http`] if the HTTP client cannot be built.
pub fn spawn_http_session(
    config: NetConfig,
) -> Result<(SessionHandle, mpsc::Receiver<ChatEvent>), ApiError> {
    let api = HttpChatApi::new(config.base_url.clone(), config.request_timeout)?;
    let connector = WsConnector::new(config.base_url.clone(), config.connect_timeout);
    Ok(spawn_session(config, api, connector))
}

/// State owned by the session task.
struct Session<A, C: Connector> {
    controller: SyncController,
    policy: ReconnectPolicy,
    api: Arc<A>,
    connector: Arc<C>,
    /// The push connection, when up.
    transport: Option<C::Transport>,
    /// A connect task is in flight.
    connecting: bool,
    /// The push channel has been down since the last REST sync.
    resync_on_connect: bool,
    /// Failed reconnect attempts since the last successful connect.
    reconnect_attempt: u32,
    /// When the next reconnect attempt is due.
    reconnect_at: Option<Instant>,
    completion_tx: mpsc::UnboundedSender<Completion<C::Transport>>,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl<A, C> Session<A, C>
where
    A: ChatApi,
    C: Connector,
{
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut completion_rx: mpsc::UnboundedReceiver<Completion<C::Transport>>,
    ) {
        tracing::info!(user = %self.controller.me(), "session started");
        self.start_connect();
        let effects = self.controller.refresh_summaries(None);
        self.apply(effects).await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(done) = completion_rx.recv() => self.handle_completion(done).await,
                frame = next_frame(self.transport.as_ref()) => self.handle_frame(frame).await,
                () = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect();
                }
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        tracing::info!(user = %self.controller.me(), "session stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        let effects = match cmd {
            SessionCommand::Open(peer) => self.controller.open_conversation(&peer),
            SessionCommand::Close(peer) => self.controller.close_conversation(&peer),
            SessionCommand::Send { peer, text } => self.controller.send_message(&peer, &text),
            SessionCommand::Refresh(query) => self.controller.refresh_summaries(query),
            SessionCommand::Messages { peer, reply } => {
                let _ = reply.send(self.controller.store().ordered_messages(&peer).to_vec());
                return;
            }
            SessionCommand::Summaries(reply) => {
                let _ = reply.send(self.controller.store().summaries().to_vec());
                return;
            }
            SessionCommand::Online(reply) => {
                let _ = reply.send(self.controller.store().online_users());
                return;
            }
            SessionCommand::State { peer, reply } => {
                let _ = reply.send(self.controller.state(&peer));
                return;
            }
            SessionCommand::Status(reply) => {
                let _ = reply.send(SessionStatus {
                    connected: self
                        .transport
                        .as_ref()
                        .is_some_and(PushTransport::is_connected),
                    reconnect_pending: self.reconnect_at.is_some() || self.connecting,
                    reconnect_enabled: self.policy.is_enabled(),
                    query: self.controller.query().map(str::to_string),
                });
                return;
            }
            SessionCommand::Reconnect => {
                tracing::info!("manual reconnect requested");
                self.drop_transport().await;
                self.reconnect_attempt = 0;
                self.reconnect_at = None;
                self.start_connect();
                return;
            }
            SessionCommand::Shutdown => return,
        };
        self.apply(effects).await;
    }

    async fn handle_completion(&mut self, done: Completion<C::Transport>) {
        let effects = match done {
            Completion::History {
                peer,
                generation,
                result,
            } => match result {
                Ok(messages) => self
                    .controller
                    .on_history_loaded(&peer, generation, messages),
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "history fetch failed");
                    return;
                }
            },
            Completion::Summaries { generation, result } => match result {
                Ok(summaries) => self.controller.on_summaries_loaded(generation, summaries),
                Err(e) => {
                    tracing::warn!(error = %e, "summary refresh failed");
                    self.controller.on_summaries_failed(generation);
                    return;
                }
            },
            Completion::Sent { peer, result } => match result {
                Ok(message) => self.controller.on_message_sent(&peer, message),
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "send failed");
                    return;
                }
            },
            Completion::Connected(result) => {
                self.connecting = false;
                match result {
                    Ok(transport) => self.on_connected(transport),
                    Err(e) => {
                        tracing::warn!(error = %e, "push channel connect failed");
                        self.resync_on_connect = true;
                        self.schedule_reconnect();
                        return;
                    }
                }
            }
        };
        self.apply(effects).await;
    }

    fn on_connected(&mut self, transport: C::Transport) -> Vec<Effect> {
        tracing::info!(user = %self.controller.me(), "push channel up");
        self.transport = Some(transport);
        self.reconnect_attempt = 0;
        self.reconnect_at = None;

        let mut effects = vec![Effect::Notify(ChatEvent::ConnectionStatus { connected: true })];
        if self.resync_on_connect {
            self.resync_on_connect = false;
            effects.extend(self.controller.resync());
        }
        effects
    }

    async fn handle_frame(&mut self, frame: Result<InboundFrame, TransportError>) {
        match frame {
            Ok(frame) => {
                tracing::debug!(action = frame.action(), "push frame");
                let effects = self.controller.handle_frame(frame);
                self.apply(effects).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "push channel lost");
                self.drop_transport().await;
                self.schedule_reconnect();
            }
        }
    }

    /// Close and forget the current connection, telling the UI.
    async fn drop_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            self.resync_on_connect = true;
            self.notify(ChatEvent::ConnectionStatus { connected: false });
        }
    }

    fn start_connect(&mut self) {
        if self.connecting || self.transport.is_some() {
            return;
        }
        self.connecting = true;
        let connector = Arc::clone(&self.connector);
        let me = self.controller.me().clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(&me).await;
            let _ = tx.send(Completion::Connected(result));
        });
    }

    fn schedule_reconnect(&mut self) {
        if !self.policy.allows(self.reconnect_attempt) {
            tracing::warn!(
                attempts = self.reconnect_attempt,
                "giving up on push channel, continuing over REST only"
            );
            self.reconnect_at = None;
            return;
        }
        let delay = self.policy.delay_for(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        tracing::info!(
            attempt = self.reconnect_attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling push channel reconnect"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::FetchHistory { peer, generation } => {
                    let api = Arc::clone(&self.api);
                    let me = self.controller.me().clone();
                    let tx = self.completion_tx.clone();
                    tokio::spawn(async move {
                        let result = api.fetch_messages(&peer, &me).await;
                        let _ = tx.send(Completion::History {
                            peer,
                            generation,
                            result,
                        });
                    });
                }
                Effect::RefreshSummaries { query, generation } => {
                    let api = Arc::clone(&self.api);
                    let me = self.controller.me().clone();
                    let tx = self.completion_tx.clone();
                    tokio::spawn(async move {
                        let result = api.list_chats(&me, query.as_deref()).await;
                        let _ = tx.send(Completion::Summaries { generation, result });
                    });
                }
                Effect::PostMessage { peer, text } => {
                    let api = Arc::clone(&self.api);
                    let me = self.controller.me().clone();
                    let tx = self.completion_tx.clone();
                    tokio::spawn(async move {
                        let result = api.send_message(&peer, &me, &text).await;
                        let _ = tx.send(Completion::Sent { peer, result });
                    });
                }
                Effect::SendFrame(frame) => match self.transport.as_ref() {
                    Some(transport) => {
                        if let Err(e) = transport.send(&frame).await {
                            tracing::warn!(error = %e, "failed to send push frame");
                        }
                    }
                    None => tracing::debug!("push channel down, dropping outbound frame"),
                },
                Effect::Notify(event) => self.notify(event),
            }
        }
    }

    fn notify(&self, event: ChatEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event = ?event, "UI event buffer full, dropping event");
            }
        }
    }
}

/// Next frame from `transport`, or never if there is none.
async fn next_frame<T: PushTransport>(
    transport: Option<&T>,
) -> Result<InboundFrame, TransportError> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep until `deadline`, or forever if there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
