//! Push-channel transport for `MentorChat`.
//!
//! Defines the [`PushTransport`] trait (one open connection to the server
//! push channel) and the [`Connector`] trait that opens such connections.
//! Concrete implementations:
//! - [`ws::WsConnector`] / [`ws::WsTransport`]: the chat WebSocket
//! - [`loopback::LoopbackConnector`]: in-process channels for testing
//!
//! Reconnection is not done here; [`reconnect::ReconnectPolicy`] describes
//! the backoff the session driver applies when a connection drops.

pub mod loopback;
pub mod reconnect;
pub mod ws;

use std::future::Future;

use mentorchat_proto::api::WS_CHAT_PATH;
use mentorchat_proto::frame::{FrameError, InboundFrame, OutboundFrame};
use mentorchat_proto::message::UserId;
use url::Url;

use crate::api::join_under;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed (by either side).
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The push endpoint could not be derived from the configured base URL.
    #[error("invalid push endpoint: {0}")]
    InvalidEndpoint(String),

    /// A frame could not be encoded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The WebSocket handshake or stream failed.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One open connection to the server push channel.
///
/// Inbound frames are yielded by [`recv`](Self::recv) strictly in arrival
/// order. Frames with unknown actions or that fail to parse never reach the
/// caller; the implementation logs and skips them.
pub trait PushTransport: Send + Sync + 'static {
    /// Write one frame to the server.
    fn send(
        &self,
        frame: &OutboundFrame,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next frame from the server.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is
    /// gone and all frames received before that have been yielded.
    fn recv(&self) -> impl Future<Output = Result<InboundFrame, TransportError>> + Send;

    /// Close the connection and release the socket. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Whether the connection is still up.
    fn is_connected(&self) -> bool;
}

/// Opens push connections for a user.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced.
    type Transport: PushTransport;

    /// Open a new connection for `user`.
    fn connect(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Derive the chat WebSocket URL for `user` from the HTTP base URL.
///
/// The scheme mirrors the base: `http` → `ws`, `https` → `wss`. `ws`/`wss`
/// bases are used as they are. A path prefix on the base is kept, so a
/// backend mounted at `https://host/app` is reached at `wss://host/app/ws/chat/`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidEndpoint`] for other schemes or a base
/// that cannot carry a path.
pub fn push_endpoint(base: &Url, user: &UserId) -> Result<Url, TransportError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme {other:?}"
            )));
        }
    };

    let mut url = join_under(base, WS_CHAT_PATH)
        .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidEndpoint(format!("cannot use scheme {scheme}")))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", user.as_str());
    Ok(url)
}
