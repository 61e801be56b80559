use std::time::Duration;

use rtdialog_frame::FrameError;

/// Errors that can occur in dialogue transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The connect target could not be turned into a request.
    #[error("invalid connect request: {0}")]
    InvalidRequest(String),

    /// Failed to establish the connection.
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The connection did not open within the allotted time.
    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),

    /// The operation needs an open connection.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called on a client that already left `Idle`.
    #[error("connect already attempted")]
    AlreadyStarted,

    /// The write queue is at capacity.
    #[error("write queue full")]
    WriteQueueFull,

    /// The remote end closed the connection.
    #[error("connection closed by remote (code {code:?}): {reason}")]
    RemoteClosed { code: Option<u16>, reason: String },

    /// A socket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// An outbound frame could not be encoded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, TransportError>;
