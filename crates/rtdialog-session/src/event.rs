use bytes::Bytes;
use rtdialog_transport::CloseReason;

/// Typed outcome of an inbound frame, delivered to the orchestrator in
/// arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The server accepted StartConnection.
    ConnectionAckReceived { connect_id: Option<String> },
    /// The server rejected StartConnection.
    ConnectionFailed { message: String },
    /// The server acknowledged FinishConnection or ended the connection.
    ConnectionFinished,
    /// The server accepted StartSession.
    SessionStarted {
        session_id: Option<String>,
        dialog_id: Option<String>,
    },
    /// The server ended the session.
    SessionFinished { session_id: Option<String> },
    /// Synthesized speech, already queued for playback.
    AudioOutputChunk(Bytes),
    /// The server rejected a request or failed the session.
    SessionError { code: u32, message: String },
    /// The user started speaking; pending playback was discarded.
    UserSpeechDetected,
    /// Any other server event, payload left as received.
    ServerMessage { event: u32, payload: Bytes },
    /// The connection ended. No events follow.
    ConnectionClosed(CloseReason),
}
