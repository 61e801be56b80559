//! Single-writer transport for the realtime dialogue protocol.
//!
//! Provides one persistent, message-oriented connection per
//! [`TransportClient`]:
//! - [`WebSocketConnector`] dials secure WebSockets with authentication headers
//! - [`MemoryConnector`] keeps both ends in-process
//!
//! The client serializes every write through one task and decodes inbound
//! messages into [`rtdialog_frame::Frame`]s. It holds no protocol semantics
//! beyond framing and never reconnects.

pub mod client;
pub mod error;
pub mod memory;
pub mod traits;
pub mod websocket;

pub use client::{CloseReason, ConnectionState, TransportClient, TransportConfig, TransportEvent};
pub use error::{Result, TransportError};
pub use memory::{ConnectMode, MemoryConnector, MemoryServer, ServerConnection};
pub use traits::{ConnectTarget, Connector, WireConnection, WireSink, WireStream};
pub use websocket::WebSocketConnector;
