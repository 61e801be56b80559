use std::time::Duration;

/// Errors that can occur while running a dialogue.
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] rtdialog_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] rtdialog_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration is incomplete or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The connection did not open in time.
    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),

    /// The server did not acknowledge StartConnection in time.
    #[error("connection handshake not acknowledged within {0:?}")]
    HandshakeTimeout(Duration),

    /// The server did not acknowledge StartSession in time.
    #[error("session start not acknowledged within {0:?}")]
    SessionTimeout(Duration),

    /// The server rejected a request.
    #[error("server error {code}: {message}")]
    Server { code: u32, message: String },

    /// A session is already registered on this connection.
    #[error("session {0} already active")]
    SessionAlreadyActive(String),

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Audio capture or playback failed.
    #[error("audio device error: {0}")]
    Audio(String),

    /// The connection ended while the operation was pending.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The caller already stopped the dialogue.
    #[error("stopped by caller")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, DialogError>;
