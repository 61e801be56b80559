/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than the header requires (base word or declared size).
    #[error("truncated header ({available} bytes, need {needed})")]
    TruncatedHeader { needed: usize, available: usize },

    /// The protocol version nibble is not one we speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// The declared header size is outside the accepted word range.
    #[error("invalid header size {0} words")]
    InvalidHeaderSize(u8),

    /// The message type nibble does not name a known message type.
    #[error("unknown message type 0b{0:04b}")]
    UnknownMessageType(u8),

    /// The serialization nibble names a method this codec does not handle.
    #[error("unsupported serialization 0b{0:04b}")]
    UnsupportedSerialization(u8),

    /// The compression nibble names a scheme this codec does not handle.
    #[error("unsupported compression 0b{0:04b}")]
    UnsupportedCompression(u8),

    /// A body field runs past the end of the buffer.
    #[error("truncated {field} field")]
    TruncatedField { field: &'static str },

    /// A length-prefixed identifier exceeds its limit.
    #[error("{field} too long ({len} bytes, max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    /// The declared payload length disagrees with the bytes that follow it.
    #[error("payload length mismatch (declared {declared}, actual {actual})")]
    PayloadLengthMismatch { declared: usize, actual: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Gzip compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// The frame's fields are inconsistent with its flags or message type.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;
