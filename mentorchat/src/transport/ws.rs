//! WebSocket push transport.
//!
//! Implements [`PushTransport`] over the chat WebSocket
//! (`/ws/chat/?user_id=...`). Frames are JSON text messages; a background
//! reader task decodes them and hands them over in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use mentorchat_proto::frame::{self, InboundFrame, OutboundFrame};
use mentorchat_proto::message::UserId;

use super::{Connector, PushTransport, TransportError, push_endpoint};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the decoded-frame channel between reader task and consumer.
const FRAME_BUFFER: usize = 256;

/// Opens [`WsTransport`]s against a backend base URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// HTTP(S) base URL of the backend.
    base_url: Url,
    /// Handshake timeout.
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for the backend at `base_url`.
    #[must_use]
    pub const fn new(base_url: Url, connect_timeout: Duration) -> Self {
        Self {
            base_url,
            connect_timeout,
        }
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, user: &UserId) -> Result<WsTransport, TransportError> {
        let endpoint = push_endpoint(&self.base_url, user)?;
        WsTransport::connect(&endpoint, self.connect_timeout).await
    }
}

/// An open chat WebSocket.
///
/// Created via [`WsTransport::connect`], which performs the handshake and
/// spawns a background reader task. Dropping the transport aborts the
/// reader; [`close`](PushTransport::close) additionally sends a close frame.
pub struct WsTransport {
    /// The endpoint this transport is connected to.
    endpoint: Url,
    /// Write half of the WebSocket connection.
    ws_sender: Mutex<WsSender>,
    /// Frames decoded by the background reader task.
    incoming: Mutex<mpsc::Receiver<InboundFrame>>,
    /// Whether the WebSocket connection is active.
    connected: Arc<AtomicBool>,
    /// Handle to the background reader task.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Open the chat WebSocket at `endpoint`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish in time.
    /// - [`TransportError::WebSocket`] / [`TransportError::Io`] if the
    ///   server cannot be reached or rejects the upgrade.
    pub async fn connect(endpoint: &Url, timeout: Duration) -> Result<Self, TransportError> {
        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %endpoint, "push channel connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %endpoint, err = %e, "push channel connect failed");
                map_ws_connect_error(e)
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        tracing::info!(url = %endpoint, "push channel connected");

        Ok(Self {
            endpoint: endpoint.clone(),
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }
}

impl PushTransport for WsTransport {
    async fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        let text = frame::encode_outbound(frame)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "push channel send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<InboundFrame, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        let was_connected = self.connected.swap(false, Ordering::Relaxed);
        if was_connected {
            let mut sender = self.ws_sender.lock().await;
            if let Err(e) = sender.close().await {
                tracing::debug!(err = %e, "error while closing push channel");
            }
            tracing::info!(url = %self.endpoint, "push channel closed");
        }
        self.reader_handle.abort();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that reads WebSocket messages and decodes frames.
///
/// Malformed frames and frames with unknown actions are logged and skipped;
/// the task does not disconnect on bad data. Sets `connected` to `false`
/// when the WebSocket closes or errors out.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<InboundFrame>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match frame::decode_inbound(text.as_str()) {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        // Receiver dropped, transport is gone.
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("ignoring push frame with unknown action");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed push frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("push channel closed by server");
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!("ignoring binary push frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "push channel read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::info!("push channel reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => TransportError::Io(io_err),
        WsError::Http(response) => {
            TransportError::WebSocket(format!("upgrade rejected: status {}", response.status()))
        }
        other => TransportError::WebSocket(other.to_string()),
    }
}
