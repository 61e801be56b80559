//! Realtime spoken-dialogue client.
//!
//! rtdialog connects to a realtime speech-dialogue service over WebSocket,
//! negotiates a session, and streams microphone audio up while synthesized
//! speech streams down.
//!
//! # Crate Structure
//!
//! - [`frame`]: binary frame codec (header bits, event ids, gzip payloads)
//! - [`transport`]: connector abstraction and the single-writer transport client
//! - [`session`]: request/response coordinators and the dialogue orchestrator

/// Re-export frame types.
pub mod frame {
    pub use rtdialog_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use rtdialog_transport::*;
}

/// Re-export session types.
pub mod session {
    pub use rtdialog_session::*;
}
