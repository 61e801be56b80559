//! Header nibbles.
//!
//! The first header word packs six 4-bit fields:
//!
//! ```text
//! byte 0: version (hi)        | header size in words (lo)
//! byte 1: message type (hi)   | message flags (lo)
//! byte 2: serialization (hi)  | compression (lo)
//! byte 3: reserved (zero)
//! ```

/// The only protocol version this codec speaks.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Smallest accepted header size, in 4-byte words.
pub const MIN_HEADER_WORDS: u8 = 1;

/// Largest accepted header size, in 4-byte words.
pub const MAX_HEADER_WORDS: u8 = 4;

/// Kind of message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client control request with a serialized payload.
    FullClientRequest,
    /// Client request whose payload is raw audio.
    AudioOnlyClientRequest,
    /// Server response with a serialized payload.
    FullServerResponse,
    /// Server response whose payload is synthesized audio.
    AudioOnlyServerResponse,
    /// Server front-end result (intermediate recognition output).
    FrontEndResultServer,
    /// Server error; carries an error code.
    Error,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b0001 => Some(Self::FullClientRequest),
            0b0010 => Some(Self::AudioOnlyClientRequest),
            0b1001 => Some(Self::FullServerResponse),
            0b1011 => Some(Self::AudioOnlyServerResponse),
            0b1100 => Some(Self::FrontEndResultServer),
            0b1111 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::FullClientRequest => 0b0001,
            Self::AudioOnlyClientRequest => 0b0010,
            Self::FullServerResponse => 0b1001,
            Self::AudioOnlyServerResponse => 0b1011,
            Self::FrontEndResultServer => 0b1100,
            Self::Error => 0b1111,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FullClientRequest => "FULL_CLIENT_REQUEST",
            Self::AudioOnlyClientRequest => "AUDIO_ONLY_CLIENT_REQUEST",
            Self::FullServerResponse => "FULL_SERVER_RESPONSE",
            Self::AudioOnlyServerResponse => "AUDIO_ONLY_SERVER_RESPONSE",
            Self::FrontEndResultServer => "FRONT_END_RESULT_SERVER",
            Self::Error => "ERROR",
        }
    }
}

/// The low nibble of header byte 1.
///
/// Bit 0 marks a sequence field, bit 1 marks the last packet, bit 2 marks
/// an event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NO_SEQUENCE: Self = Self(0b0000);
    pub const POSITIVE_SEQUENCE: Self = Self(0b0001);
    pub const LAST_NO_SEQUENCE: Self = Self(0b0010);
    pub const NEGATIVE_SEQUENCE: Self = Self(0b0011);
    pub const WITH_EVENT: Self = Self(0b0100);

    /// Build flags from a nibble; the high bits are discarded.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn has_sequence(self) -> bool {
        self.0 & 0b0001 != 0
    }

    pub fn is_last(self) -> bool {
        self.0 & 0b0010 != 0
    }

    pub fn has_event(self) -> bool {
        self.0 & 0b0100 != 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// How the payload is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serialization {
    /// Opaque bytes (audio).
    Raw,
    /// UTF-8 JSON document.
    Json,
}

impl Serialization {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b0000 => Some(Self::Raw),
            0b0001 => Some(Self::Json),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Raw => 0b0000,
            Self::Json => 0b0001,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Json => "JSON",
        }
    }
}

/// How the payload is compressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b0000 => Some(Self::None),
            0b0001 => Some(Self::Gzip),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::None => 0b0000,
            Self::Gzip => 0b0001,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Gzip => "GZIP",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_bits_roundtrip() {
        for bits in 0u8..16 {
            if let Some(kind) = MessageType::from_bits(bits) {
                assert_eq!(kind.bits(), bits);
            }
        }
        assert_eq!(MessageType::from_bits(0b0000), None);
        assert_eq!(MessageType::from_bits(0b1010), None);
    }

    #[test]
    fn test_flags_bits() {
        assert!(!MessageFlags::NO_SEQUENCE.has_sequence());
        assert!(MessageFlags::POSITIVE_SEQUENCE.has_sequence());
        assert!(MessageFlags::NEGATIVE_SEQUENCE.has_sequence());
        assert!(MessageFlags::NEGATIVE_SEQUENCE.is_last());
        assert!(!MessageFlags::LAST_NO_SEQUENCE.has_sequence());
        assert!(MessageFlags::WITH_EVENT.has_event());

        let both = MessageFlags::WITH_EVENT.union(MessageFlags::POSITIVE_SEQUENCE);
        assert_eq!(both.bits(), 0b0101);
        assert_eq!(MessageFlags::from_bits(0xF4).bits(), 0b0100);
    }

    #[test]
    fn test_unsupported_nibbles() {
        // Thrift and custom serialization are defined by the protocol but not handled here.
        assert_eq!(Serialization::from_bits(0b0011), None);
        assert_eq!(Serialization::from_bits(0b1111), None);
        assert_eq!(Compression::from_bits(0b1111), None);
    }
}
