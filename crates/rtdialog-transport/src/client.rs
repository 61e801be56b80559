use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rtdialog_frame::{decode_frame, event_name, Frame, FrameError, DEFAULT_MAX_PAYLOAD};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{ConnectTarget, Connector, WireConnection, WireSink, WireStream};

/// Lifecycle of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Local,
    /// The remote sent a close frame or ended the stream.
    Remote { code: Option<u16>, reason: String },
    /// The dial failed.
    ConnectFailed(String),
    /// A socket-level failure.
    Transport(String),
    /// An inbound message could not be decoded.
    Decode(FrameError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Remote {
                code: Some(code),
                reason,
            } => write!(f, "closed by remote ({code}): {reason}"),
            Self::Remote { code: None, reason } => write!(f, "closed by remote: {reason}"),
            Self::ConnectFailed(reason) => write!(f, "connect failed: {reason}"),
            Self::Transport(reason) => write!(f, "transport failure: {reason}"),
            Self::Decode(err) => write!(f, "undecodable frame: {err}"),
        }
    }
}

/// Delivered to the client's listener in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(Frame),
    /// Sent exactly once, after which no further events follow.
    Closed(CloseReason),
}

/// Configuration for the transport client.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Frames that may wait for the writer before `try_send` reports full.
    pub write_queue_depth: usize,
    /// Maximum inbound payload size in bytes.
    pub max_payload_size: usize,
    /// Upper bound on flushing the close handshake.
    pub close_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            write_queue_depth: 64,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Owns one physical connection.
///
/// All outbound frames pass through a single writer task, so frames queued
/// by concurrent callers reach the wire whole and in queue order. Inbound
/// messages are decoded on a reader task and delivered as
/// [`TransportEvent`]s; any decode failure ends the connection.
pub struct TransportClient {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    target: ConnectTarget,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<mpsc::Sender<Bytes>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    close_reported: AtomicBool,
    dial_error: Mutex<Option<TransportError>>,
    cancel: CancellationToken,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl TransportClient {
    /// Create an idle client. The receiver gets every [`TransportEvent`].
    pub fn new(
        connector: Arc<dyn Connector>,
        target: ConnectTarget,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            config,
            state,
            writer: Mutex::new(None),
            events,
            close_reported: AtomicBool::new(false),
            dial_error: Mutex::new(None),
            cancel: CancellationToken::new(),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        });
        let client = Self {
            shared,
            connector,
            target,
            writer_task: Mutex::new(None),
        };
        (client, events_rx)
    }

    /// Start dialing. Returns once the attempt is underway; use
    /// [`wait_for_connection`](Self::wait_for_connection) to observe the outcome.
    pub fn connect(&self) -> Result<()> {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Idle {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(TransportError::AlreadyStarted);
        }

        let shared = Arc::clone(&self.shared);
        let connector = Arc::clone(&self.connector);
        let target = self.target.clone();
        let dial = tokio::spawn(async move {
            let result = tokio::select! {
                _ = shared.cancel.cancelled() => return None,
                result = connector.connect(&target) => result,
            };
            match result {
                Ok(conn) => Some(shared.on_connected(conn)),
                Err(err) => {
                    warn!(url = %target.url, error = %err, "connect failed");
                    let reason = err.to_string();
                    if let Ok(mut slot) = shared.dial_error.lock() {
                        *slot = Some(err);
                    }
                    shared.mark_closed(CloseReason::ConnectFailed(reason));
                    None
                }
            }
        });

        // The writer only exists once the dial succeeds; close() waits on
        // the dial and then on the writer it produced.
        if let Ok(mut slot) = self.writer_task.lock() {
            *slot = Some(tokio::spawn(async move {
                if let Ok(Some(writer)) = dial.await {
                    let _ = writer.await;
                }
            }));
        }
        Ok(())
    }

    /// Wait until the connection is open.
    ///
    /// Fails with [`TransportError::ConnectTimeout`] if it does not open
    /// within `timeout`, or with the dial error if the attempt failed.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let reached = tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Closed)
            })
            .await
            .map(|state| *state)
        })
        .await;

        match reached {
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => {
                let dial_error = self
                    .shared
                    .dial_error
                    .lock()
                    .ok()
                    .and_then(|slot| slot.clone());
                Err(dial_error.unwrap_or(TransportError::NotConnected))
            }
        }
    }

    /// Encode and queue a frame, waiting for queue space if necessary.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        let writer = self.shared.writer()?;
        writer
            .send(bytes)
            .await
            .map_err(|_| TransportError::NotConnected)?;
        debug!(
            event = ?frame.event,
            name = frame.event.map(event_name).unwrap_or("-"),
            "queued frame"
        );
        Ok(())
    }

    /// Encode and queue a frame without waiting.
    ///
    /// Fails with [`TransportError::WriteQueueFull`] when the writer is behind.
    pub fn try_send(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        let writer = self.shared.writer()?;
        writer.try_send(bytes).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::WriteQueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
        })
    }

    /// Close the connection. Idempotent.
    ///
    /// Waits, bounded by the close timeout, for the writer to flush the close
    /// handshake.
    pub async fn close(&self) {
        self.shared.mark_closed(CloseReason::Local);
        let task = self.writer_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let limit = self.shared.config.close_timeout + Duration::from_millis(100);
            if tokio::time::timeout(limit, task).await.is_err() {
                warn!("writer did not finish within close timeout");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.shared.frames_received.load(Ordering::Relaxed)
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn writer(&self) -> Result<mpsc::Sender<Bytes>> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.writer
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(TransportError::NotConnected)
    }

    /// Wire up reader and writer tasks; returns the writer handle.
    fn on_connected(self: &Arc<Self>, conn: WireConnection) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(self.config.write_queue_depth.max(1));
        if let Ok(mut slot) = self.writer.lock() {
            *slot = Some(tx);
        }

        let writer = tokio::spawn(write_loop(Arc::clone(self), conn.sink, rx));
        tokio::spawn(read_loop(Arc::clone(self), conn.stream));

        let opened = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if opened {
            info!("connection open");
        }
        writer
    }

    /// Transition to `Closed` and report `reason`, once.
    fn mark_closed(&self, reason: CloseReason) {
        if self.close_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(ConnectionState::Closed);
        self.cancel.cancel();
        if let Ok(mut slot) = self.writer.lock() {
            slot.take();
        }
        match &reason {
            CloseReason::Local => info!("connection closed locally"),
            other => warn!(reason = ?other, "connection closed"),
        }
        let _ = self.events.send(TransportEvent::Closed(reason));
    }
}

async fn write_loop(shared: Arc<Shared>, mut sink: WireSink, mut rx: mpsc::Receiver<Bytes>) {
    loop {
        let bytes = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let len = bytes.len();
        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = sink.send(bytes) => result,
        };
        match result {
            Ok(()) => {
                shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                debug!(len, "wrote frame");
            }
            Err(err) => {
                shared.mark_closed(CloseReason::Transport(err.to_string()));
                return;
            }
        }
    }

    // Frames queued before the close still go out ahead of the close handshake.
    let flush = async {
        while let Ok(bytes) = rx.try_recv() {
            if sink.send(bytes).await.is_err() {
                return;
            }
            shared.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        let _ = sink.close().await;
    };
    if tokio::time::timeout(shared.config.close_timeout, flush)
        .await
        .is_err()
    {
        debug!("close handshake timed out");
    }
}

async fn read_loop(shared: Arc<Shared>, mut stream: WireStream) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(bytes)) => match decode_frame(&bytes, shared.config.max_payload_size) {
                Ok(frame) => {
                    shared.frames_received.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        kind = frame.message_type.name(),
                        event = ?frame.event,
                        len = frame.payload.len(),
                        "received frame"
                    );
                    if shared.events.send(TransportEvent::Frame(frame)).is_err() {
                        debug!("event receiver dropped");
                    }
                }
                Err(err) => {
                    warn!(error = %err, len = bytes.len(), "undecodable frame");
                    shared.mark_closed(CloseReason::Decode(err));
                    return;
                }
            },
            Some(Err(TransportError::RemoteClosed { code, reason })) => {
                shared.mark_closed(CloseReason::Remote { code, reason });
                return;
            }
            Some(Err(err)) => {
                shared.mark_closed(CloseReason::Transport(err.to_string()));
                return;
            }
            None => {
                shared.mark_closed(CloseReason::Remote {
                    code: None,
                    reason: "stream ended".to_string(),
                });
                return;
            }
        }
    }
}
