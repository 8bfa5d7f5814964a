//! Wire format encoding and decoding.
//!
//! Implements the 12-byte header format:
//! ```text
//! ┌──────────┬────────────┬──────────┐
//! │ Length   │ Timestamp  │ Frame ID │
//! │ 2 bytes  │ 8 bytes    │ 2 bytes  │
//! │ uint16 LE│ uint64 LE  │ uint16 LE│
//! └──────────┴────────────┴──────────┘
//! ```
//!
//! `Length` counts everything after itself: the timestamp (8 bytes) plus the
//! payload including its leading frame id. A frame therefore occupies
//! `length + 2` bytes on the wire.
//!
//! All multi-byte integers are Little Endian.

use super::cursor::Reader;
use crate::error::CodecError;

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Size of the `length` field itself.
pub const LENGTH_FIELD_SIZE: usize = 2;

/// Bytes covered by `length` that precede the frame id (the timestamp).
pub const TIMESTAMP_SIZE: usize = 8;

/// Smallest legal `length`: timestamp plus frame id, empty body.
pub const MIN_FRAME_LENGTH: u16 = (TIMESTAMP_SIZE + 2) as u16;

/// Largest possible frame on the wire.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize + LENGTH_FIELD_SIZE;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameId {
    /// Acknowledgement of a command.
    Receipt = 1,
    /// Control command.
    Command = 2,
    /// Address-keyed telemetry parameters.
    AddressTelemetry = 4,
    /// Position telemetry block.
    PositionTelemetry = 5,
    /// Text message (several strings).
    Message = 6,
    /// Log line.
    LogMessage = 7,
}

impl FrameId {
    /// Wire value.
    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for FrameId {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Receipt),
            2 => Ok(Self::Command),
            4 => Ok(Self::AddressTelemetry),
            5 => Ok(Self::PositionTelemetry),
            6 => Ok(Self::Message),
            7 => Ok(Self::LogMessage),
            other => Err(CodecError::UnknownFrameType(other)),
        }
    }
}

/// Command argument type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ArgType {
    /// `u8`
    Byte = 1,
    /// `i8`
    ByteSigned = 2,
    /// `u16`
    Word = 3,
    /// `i16`
    WordSigned = 4,
    /// `u32`
    Dword = 5,
    /// `i32`
    DwordSigned = 6,
    /// `f32`
    Real = 7,
    /// `f64`
    Double = 8,
    /// NUL-terminated UTF-8.
    String = 9,
    /// `u16` length prefix followed by raw bytes.
    MultiByte = 10,
}

impl ArgType {
    /// Wire value.
    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Payload width for fixed-size tags, `None` for variable-size ones.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Byte | Self::ByteSigned => Some(1),
            Self::Word | Self::WordSigned => Some(2),
            Self::Dword | Self::DwordSigned | Self::Real => Some(4),
            Self::Double => Some(8),
            Self::String | Self::MultiByte => None,
        }
    }
}

impl TryFrom<u16> for ArgType {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Byte),
            2 => Ok(Self::ByteSigned),
            3 => Ok(Self::Word),
            4 => Ok(Self::WordSigned),
            5 => Ok(Self::Dword),
            6 => Ok(Self::DwordSigned),
            7 => Ok(Self::Real),
            8 => Ok(Self::Double),
            9 => Ok(Self::String),
            10 => Ok(Self::MultiByte),
            other => Err(CodecError::UnknownArgType(other)),
        }
    }
}

/// Decoded header from wire format.
///
/// The frame id is kept raw so that the header of a frame with an unknown
/// type can still be inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Bytes following the length field.
    pub length: u16,
    /// FILETIME ticks.
    pub timestamp: u64,
    /// Raw frame type identifier.
    pub frame_id: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(length: u16, timestamp: u64, frame_id: u16) -> Self {
        Self {
            length,
            timestamp,
            frame_id,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use kpa_gateway::protocol::Header;
    ///
    /// let header = Header::new(10, 0, 2);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 12);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.length.to_le_bytes());
        buf[2..10].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[10..12].copy_from_slice(&self.frame_id.to_le_bytes());
        buf
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use kpa_gateway::protocol::Header;
    ///
    /// let bytes = [10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2, 0];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.length, 10);
    /// assert_eq!(header.frame_id, 2);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(buf);
        Some(Self {
            length: reader.u16("length").ok()?,
            timestamp: reader.u64("timestamp").ok()?,
            frame_id: reader.u16("frame_id").ok()?,
        })
    }

    /// Total bytes this frame occupies on the wire.
    #[inline]
    pub fn wire_size(&self) -> usize {
        self.length as usize + LENGTH_FIELD_SIZE
    }

    /// Resolve the frame id.
    pub fn frame_type(&self) -> Result<FrameId, CodecError> {
        FrameId::try_from(self.frame_id)
    }
}

/// Read the declared wire size of the frame starting at `buf`.
///
/// Returns `Ok(None)` while fewer than two bytes are available.
pub fn peek_frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    if buf.len() < LENGTH_FIELD_SIZE {
        return Ok(None);
    }
    let length = u16::from_le_bytes([buf[0], buf[1]]);
    if length < MIN_FRAME_LENGTH {
        return Err(CodecError::InvalidLength(length));
    }
    Ok(Some(length as usize + LENGTH_FIELD_SIZE))
}
