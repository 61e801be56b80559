use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::compression::{gunzip, gzip};
use crate::error::{FrameError, Result};
use crate::event::{self, carries_connect_id, carries_session_id};
use crate::header::{
    Compression, MessageFlags, MessageType, Serialization, MAX_HEADER_WORDS, MIN_HEADER_WORDS,
    PROTOCOL_VERSION,
};

/// Size of the mandatory first header word.
pub const BASE_HEADER_SIZE: usize = 4;

/// Maximum length of a session id or connect id, in bytes.
pub const MAX_ID_LEN: usize = 1024;

/// Default maximum payload size: 10 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 10 * 1024 * 1024;

/// One unit of wire exchange.
///
/// `payload` always holds the uncompressed bytes; compression is applied by
/// [`encode_frame`] and undone by [`decode_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version nibble.
    pub version: u8,
    /// Header length in 4-byte words.
    pub header_size_words: u8,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub serialization: Serialization,
    pub compression: Compression,
    /// Header words beyond the first, preserved verbatim.
    pub header_extension: Bytes,
    /// Present iff `flags.has_sequence()`.
    pub sequence: Option<i32>,
    /// Present iff `message_type` is [`MessageType::Error`].
    pub error_code: Option<u32>,
    /// Present iff `flags.has_event()`.
    pub event: Option<u32>,
    pub session_id: Option<String>,
    pub connect_id: Option<String>,
    pub payload: Bytes,
}

impl Frame {
    /// Create an empty frame of the given type with a single-word header.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            header_size_words: MIN_HEADER_WORDS,
            message_type,
            flags: MessageFlags::NO_SEQUENCE,
            serialization: Serialization::Json,
            compression: Compression::None,
            header_extension: Bytes::new(),
            sequence: None,
            error_code: None,
            event: None,
            session_id: None,
            connect_id: None,
            payload: Bytes::new(),
        }
    }

    /// A client control request carrying a JSON payload.
    pub fn client_event(event: u32, session_id: Option<&str>, payload: impl Into<Bytes>) -> Self {
        let frame = Self::new(MessageType::FullClientRequest)
            .with_event(event)
            .with_payload(payload);
        match session_id {
            Some(id) => frame.with_session_id(id),
            None => frame,
        }
    }

    /// A client audio frame tagged to `session_id`.
    pub fn audio(session_id: &str, pcm: impl Into<Bytes>) -> Self {
        Self::new(MessageType::AudioOnlyClientRequest)
            .with_serialization(Serialization::Raw)
            .with_event(event::TASK_REQUEST)
            .with_session_id(session_id)
            .with_payload(pcm)
    }

    pub fn with_event(mut self, event: u32) -> Self {
        self.flags = self.flags.union(MessageFlags::WITH_EVENT);
        self.event = Some(event);
        self
    }

    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.flags = self.flags.union(MessageFlags::POSITIVE_SEQUENCE);
        self.sequence = Some(sequence);
        self
    }

    pub fn with_error_code(mut self, code: u32) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_connect_id(mut self, connect_id: impl Into<String>) -> Self {
        self.connect_id = Some(connect_id.into());
        self
    }

    pub fn with_serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Attach extra header words. `extension.len()` must be a multiple of 4.
    pub fn with_header_extension(mut self, extension: impl Into<Bytes>) -> Self {
        let extension = extension.into();
        self.header_size_words = (extension.len() / 4) as u8 + MIN_HEADER_WORDS;
        self.header_extension = extension;
        self
    }

    /// Header length in bytes as declared by `header_size_words`.
    pub fn header_len(&self) -> usize {
        self.header_size_words as usize * 4
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        encode_frame(self, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode with the default payload limit.
    pub fn decode(src: &[u8]) -> Result<Self> {
        decode_frame(src, DEFAULT_MAX_PAYLOAD)
    }

    fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(self.version));
        }
        if !(MIN_HEADER_WORDS..=MAX_HEADER_WORDS).contains(&self.header_size_words) {
            return Err(FrameError::InvalidHeaderSize(self.header_size_words));
        }
        let ext_len = self.header_len() - BASE_HEADER_SIZE;
        if self.header_extension.len() != ext_len {
            return Err(FrameError::InvalidFrame(format!(
                "header extension is {} bytes, header size declares {ext_len}",
                self.header_extension.len()
            )));
        }
        if self.flags.has_sequence() != self.sequence.is_some() {
            return Err(FrameError::InvalidFrame(
                "sequence field must match the sequence flag".to_string(),
            ));
        }
        if self.flags.has_event() != self.event.is_some() {
            return Err(FrameError::InvalidFrame(
                "event field must match the event flag".to_string(),
            ));
        }
        if (self.message_type == MessageType::Error) != self.error_code.is_some() {
            return Err(FrameError::InvalidFrame(
                "error code is required on error frames and only there".to_string(),
            ));
        }

        let (session_allowed, connect_allowed) = match self.event {
            Some(id) => (carries_session_id(id), carries_connect_id(id)),
            None => (false, false),
        };
        check_id("session id", self.session_id.as_deref(), session_allowed)?;
        check_id("connect id", self.connect_id.as_deref(), connect_allowed)?;

        if self.payload.len() > u32::MAX as usize {
            return Err(FrameError::PayloadTooLarge {
                size: self.payload.len(),
                max: u32::MAX as usize,
            });
        }
        Ok(())
    }
}

fn check_id(field: &'static str, value: Option<&str>, allowed: bool) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !allowed {
        return Err(FrameError::InvalidFrame(format!(
            "{field} is not carried by this event"
        )));
    }
    if value.is_empty() {
        return Err(FrameError::InvalidFrame(format!(
            "{field} must not be empty"
        )));
    }
    if value.len() > MAX_ID_LEN {
        return Err(FrameError::FieldTooLong {
            field,
            len: value.len(),
            max: MAX_ID_LEN,
        });
    }
    Ok(())
}

/// Encode a frame into the wire format.
///
/// Wire format (all integers big-endian):
/// ```text
/// ┌────────────────────┬──────────────────────┬─────────────────────────────┐
/// │ Header word (4B)   │ Extension            │ Body                        │
/// │ ver|size type|flag │ (size-1)*4 bytes     │ [seq i32] [err u32]         │
/// │ ser|comp  reserved │                      │ [event u32] [sid len+utf8]  │
/// │                    │                      │ [cid len+utf8] len+payload  │
/// └────────────────────┴──────────────────────┴─────────────────────────────┘
/// ```
///
/// The session id is written whenever the event carries one (zero length when
/// absent); the connect id only for connection acknowledgement events.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    frame.validate()?;

    let compressed;
    let payload: &[u8] = match frame.compression {
        Compression::None => frame.payload.as_ref(),
        Compression::Gzip => {
            compressed = gzip(&frame.payload)?;
            &compressed
        }
    };
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }

    dst.reserve(frame.header_len() + 32 + payload.len());
    dst.put_u8(frame.version << 4 | frame.header_size_words);
    dst.put_u8(frame.message_type.bits() << 4 | frame.flags.bits());
    dst.put_u8(frame.serialization.bits() << 4 | frame.compression.bits());
    dst.put_u8(0);
    dst.put_slice(&frame.header_extension);

    if let Some(sequence) = frame.sequence {
        dst.put_i32(sequence);
    }
    if let Some(code) = frame.error_code {
        dst.put_u32(code);
    }
    if let Some(id) = frame.event {
        dst.put_u32(id);
        if carries_session_id(id) {
            put_string(dst, frame.session_id.as_deref().unwrap_or(""));
        }
        if carries_connect_id(id) {
            put_string(dst, frame.connect_id.as_deref().unwrap_or(""));
        }
    }
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value.as_bytes());
}

/// Decode one complete frame.
///
/// `src` must hold exactly one frame; the transport's message boundary
/// delimits frames, so any bytes beyond the declared payload are an error.
pub fn decode_frame(src: &[u8], max_payload: usize) -> Result<Frame> {
    if src.len() < BASE_HEADER_SIZE {
        return Err(FrameError::TruncatedHeader {
            needed: BASE_HEADER_SIZE,
            available: src.len(),
        });
    }

    let version = src[0] >> 4;
    let header_size_words = src[0] & 0x0F;
    let header_len = header_size_words as usize * 4;
    if src.len() < header_len {
        return Err(FrameError::TruncatedHeader {
            needed: header_len,
            available: src.len(),
        });
    }
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    if !(MIN_HEADER_WORDS..=MAX_HEADER_WORDS).contains(&header_size_words) {
        return Err(FrameError::InvalidHeaderSize(header_size_words));
    }

    let type_bits = src[1] >> 4;
    let message_type =
        MessageType::from_bits(type_bits).ok_or(FrameError::UnknownMessageType(type_bits))?;
    let flags = MessageFlags::from_bits(src[1]);
    let ser_bits = src[2] >> 4;
    let serialization =
        Serialization::from_bits(ser_bits).ok_or(FrameError::UnsupportedSerialization(ser_bits))?;
    let comp_bits = src[2] & 0x0F;
    let compression =
        Compression::from_bits(comp_bits).ok_or(FrameError::UnsupportedCompression(comp_bits))?;

    let header_extension = Bytes::copy_from_slice(&src[BASE_HEADER_SIZE..header_len]);
    let mut body = BodyReader {
        buf: &src[header_len..],
    };

    let sequence = if flags.has_sequence() {
        Some(body.read_i32("sequence")?)
    } else {
        None
    };
    let error_code = if message_type == MessageType::Error {
        Some(body.read_u32("error code")?)
    } else {
        None
    };

    let mut session_id = None;
    let mut connect_id = None;
    let event = if flags.has_event() {
        let id = body.read_u32("event")?;
        if carries_session_id(id) {
            session_id = body.read_string("session id")?;
        }
        if carries_connect_id(id) {
            connect_id = body.read_string("connect id")?;
        }
        Some(id)
    } else {
        None
    };

    let declared = body.read_u32("payload length")? as usize;
    if declared > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: declared,
            max: max_payload,
        });
    }
    if declared != body.buf.len() {
        return Err(FrameError::PayloadLengthMismatch {
            declared,
            actual: body.buf.len(),
        });
    }

    let payload = match compression {
        Compression::None => Bytes::copy_from_slice(body.buf),
        Compression::Gzip => {
            let inflated = gunzip(body.buf, max_payload)?;
            trace!(wire = declared, inflated = inflated.len(), "gunzipped payload");
            Bytes::from(inflated)
        }
    };

    Ok(Frame {
        version,
        header_size_words,
        message_type,
        flags,
        serialization,
        compression,
        header_extension,
        sequence,
        error_code,
        event,
        session_id,
        connect_id,
        payload,
    })
}

struct BodyReader<'a> {
    buf: &'a [u8],
}

impl BodyReader<'_> {
    fn read_u32(&mut self, field: &'static str) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(FrameError::TruncatedField { field });
        }
        Ok(self.buf.get_u32())
    }

    fn read_i32(&mut self, field: &'static str) -> Result<i32> {
        if self.buf.remaining() < 4 {
            return Err(FrameError::TruncatedField { field });
        }
        Ok(self.buf.get_i32())
    }

    /// Length-prefixed UTF-8; a zero length reads as absent.
    fn read_string(&mut self, field: &'static str) -> Result<Option<String>> {
        let len = self.read_u32(field)? as usize;
        if len > MAX_ID_LEN {
            return Err(FrameError::FieldTooLong {
                field,
                len,
                max: MAX_ID_LEN,
            });
        }
        if self.buf.remaining() < len {
            return Err(FrameError::TruncatedField { field });
        }
        if len == 0 {
            return Ok(None);
        }
        let (raw, rest) = self.buf.split_at(len);
        self.buf = rest;
        std::str::from_utf8(raw)
            .map(|s| Some(s.to_string()))
            .map_err(|_| FrameError::InvalidUtf8 { field })
    }
}
