//! Binary frame codec for the realtime dialogue protocol.
//!
//! Every message on the wire is one frame:
//! - A header of `header_size_words * 4` bytes (version, header size,
//!   message type, flags, serialization, compression, extension words)
//! - Optional big-endian body fields selected by the flags and event id
//! - A length-prefixed payload, optionally gzip-compressed
//!
//! Decoding is pure and fails closed: a frame is either fully valid or
//! rejected with a [`FrameError`].

pub mod codec;
pub mod compression;
pub mod error;
pub mod event;
pub mod header;

pub use codec::{
    decode_frame, encode_frame, Frame, BASE_HEADER_SIZE, DEFAULT_MAX_PAYLOAD, MAX_ID_LEN,
};
pub use error::{FrameError, Result};
pub use event::{carries_connect_id, carries_session_id, event_name};
pub use header::{Compression, MessageFlags, MessageType, Serialization, PROTOCOL_VERSION};
