//! Loopback push transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels in place of a WebSocket.
//! [`LoopbackConnector::new`] returns the connector together with a
//! [`LoopbackRemote`]; every successful `connect` hands the server end of
//! the new connection to the remote, where a test can push frames to the
//! client and observe what the client sends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use mentorchat_proto::frame::{InboundFrame, OutboundFrame};
use mentorchat_proto::message::UserId;

use super::{Connector, PushTransport, TransportError};

/// Channel capacity for each direction of a loopback connection.
const LOOPBACK_BUFFER: usize = 64;

/// Opens [`LoopbackTransport`]s. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    /// Delivers the server end of each new connection.
    accept_tx: mpsc::UnboundedSender<LoopbackServer>,
    /// When set, `connect` fails as if the server were down.
    refusing: Arc<AtomicBool>,
    /// Number of `connect` calls so far, successful or not.
    attempts: Arc<AtomicUsize>,
}

impl LoopbackConnector {
    /// Create a connector and the remote that receives its connections.
    #[must_use]
    pub fn new() -> (Self, LoopbackRemote) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept_tx,
            refusing: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        (connector, LoopbackRemote { accept_rx })
    }

    /// Make subsequent `connect` calls fail (`true`) or succeed (`false`).
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Relaxed);
    }

    /// Number of `connect` calls made so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self, user: &UserId) -> Result<LoopbackTransport, TransportError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.refusing.load(Ordering::Relaxed) {
            return Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }

        let (to_client, from_server) = mpsc::channel(LOOPBACK_BUFFER);
        let (to_server, from_client) = mpsc::channel(LOOPBACK_BUFFER);

        let server = LoopbackServer {
            user: user.clone(),
            to_client: Some(to_client),
            from_client,
        };
        self.accept_tx
            .send(server)
            .map_err(|_| TransportError::ConnectionClosed)?;

        Ok(LoopbackTransport {
            incoming: Mutex::new(from_server),
            outgoing: Mutex::new(Some(to_server)),
            connected: AtomicBool::new(true),
        })
    }
}

/// Receives the server ends of connections opened by a [`LoopbackConnector`].
#[derive(Debug)]
pub struct LoopbackRemote {
    accept_rx: mpsc::UnboundedReceiver<LoopbackServer>,
}

impl LoopbackRemote {
    /// Wait for the next connection. Returns `None` once every connector
    /// clone has been dropped.
    pub async fn accept(&mut self) -> Option<LoopbackServer> {
        self.accept_rx.recv().await
    }
}

/// Server end of one loopback connection.
#[derive(Debug)]
pub struct LoopbackServer {
    user: UserId,
    to_client: Option<mpsc::Sender<InboundFrame>>,
    from_client: mpsc::Receiver<OutboundFrame>,
}

impl LoopbackServer {
    /// The user the client connected as.
    #[must_use]
    pub const fn user(&self) -> &UserId {
        &self.user
    }

    /// Push a frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if either side has
    /// closed the connection.
    pub async fn push(&self, frame: InboundFrame) -> Result<(), TransportError> {
        let tx = self
            .to_client
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next frame sent by the client. `None` once the client
    /// has closed the connection.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
    }

    /// Drop the connection from the server side. Frames already pushed are
    /// still delivered to the client before it sees the close.
    pub fn disconnect(&mut self) {
        self.to_client = None;
    }
}

/// Client end of a loopback connection.
#[derive(Debug)]
pub struct LoopbackTransport {
    /// Frames pushed by the server end.
    incoming: Mutex<mpsc::Receiver<InboundFrame>>,
    /// Sender toward the server end; taken on close.
    outgoing: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    /// Cleared on close or when the server end goes away.
    connected: AtomicBool,
}

impl PushTransport for LoopbackTransport {
    async fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let outgoing = self.outgoing.lock().await;
        let tx = outgoing.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.clone()).await.map_err(|_| {
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<InboundFrame, TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut rx = self.incoming.lock().await;
        if let Some(frame) = rx.recv().await {
            Ok(frame)
        } else {
            self.connected.store(false, Ordering::Relaxed);
            Err(TransportError::ConnectionClosed)
        }
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.outgoing.lock().await.take();
        self.incoming.lock().await.close();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
