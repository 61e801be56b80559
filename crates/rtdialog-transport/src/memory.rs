//! In-process connector.
//!
//! [`MemoryConnector`] hands each accepted connection's far end to a
//! [`MemoryServer`], which can read the client's frames and script server
//! responses. The client-to-server wire is a bounded channel, so a server
//! that stops reading exerts real backpressure on the client's writer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, SinkExt};
use rtdialog_frame::{decode_frame, Frame, FrameError, DEFAULT_MAX_PAYLOAD};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{ConnectTarget, Connector, WireConnection};

/// Default capacity of the client-to-server wire, in messages.
pub const DEFAULT_WIRE_CAPACITY: usize = 1024;

/// How the connector answers `connect`.
#[derive(Debug, Clone, Default)]
pub enum ConnectMode {
    /// Complete immediately.
    #[default]
    Accept,
    /// Never complete.
    Pending,
    /// Fail with the given reason.
    Refuse(String),
}

/// Connector whose connections terminate in a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerConnection>,
    mode: ConnectMode,
    wire_capacity: usize,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Create a connector and the server that receives its connections.
    pub fn new() -> (Self, MemoryServer) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Self {
            accepted,
            mode: ConnectMode::Accept,
            wire_capacity: DEFAULT_WIRE_CAPACITY,
            attempts: Arc::clone(&attempts),
        };
        (connector, MemoryServer { incoming, attempts })
    }

    pub fn with_mode(mut self, mode: ConnectMode) -> Self {
        self.mode = mode;
        self
    }

    /// Messages the client may have in flight before its sink blocks.
    pub fn with_wire_capacity(mut self, capacity: usize) -> Self {
        self.wire_capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<WireConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            ConnectMode::Accept => {}
            ConnectMode::Pending => std::future::pending::<()>().await,
            ConnectMode::Refuse(reason) => {
                return Err(TransportError::Connect {
                    url: target.url.clone(),
                    reason: reason.clone(),
                })
            }
        }

        let (client_tx, server_rx) = mpsc::channel::<Bytes>(self.wire_capacity);
        let (server_tx, client_rx) = mpsc::unbounded_channel::<Result<Bytes>>();

        let server = ServerConnection {
            target: target.clone(),
            inbound: server_rx,
            outbound: Some(server_tx),
        };
        self.accepted
            .send(server)
            .map_err(|_| TransportError::Connect {
                url: target.url.clone(),
                reason: "memory server dropped".to_string(),
            })?;
        debug!(connect_id = %target.connect_id, "memory connection accepted");

        let sink = PollSender::new(client_tx)
            .sink_map_err(|_| TransportError::WebSocket("memory peer gone".to_string()));
        let stream = stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(WireConnection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Receives connections made through a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<ServerConnection>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryServer {
    /// Wait for the next accepted connection. `None` once the connector is gone.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.incoming.recv().await
    }

    /// Number of `connect` calls observed, including refused and pending ones.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Server end of one in-memory connection.
#[derive(Debug)]
pub struct ServerConnection {
    target: ConnectTarget,
    inbound: mpsc::Receiver<Bytes>,
    outbound: Option<mpsc::UnboundedSender<Result<Bytes>>>,
}

impl ServerConnection {
    /// The target the client dialed, including its headers.
    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Next raw message from the client. `None` once the client closed.
    pub async fn recv_raw(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Next raw message if one is already queued.
    pub fn try_recv_raw(&mut self) -> Option<Bytes> {
        self.inbound.try_recv().ok()
    }

    /// Next decoded frame from the client.
    pub async fn recv_frame(&mut self) -> Option<std::result::Result<Frame, FrameError>> {
        let raw = self.recv_raw().await?;
        Some(decode_frame(&raw, DEFAULT_MAX_PAYLOAD))
    }

    /// Encode and deliver a frame to the client.
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        self.send_raw(bytes)
    }

    /// Deliver raw bytes to the client without encoding.
    pub fn send_raw(&self, data: impl Into<Bytes>) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Ok(data.into()))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Close the connection from the server side with a close code.
    pub fn close(&mut self, code: u16, reason: &str) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Err(TransportError::RemoteClosed {
                code: Some(code),
                reason: reason.to_string(),
            }));
        }
    }

    /// Drop the server-to-client direction without a close frame.
    pub fn hang_up(&mut self) {
        self.outbound = None;
    }
}
