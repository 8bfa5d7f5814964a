//! Error types for kpa-gateway.

use std::net::IpAddr;
use std::str::Utf8Error;

use thiserror::Error;

use crate::transport::ConnectionId;

/// Errors produced while encoding or decoding frames.
///
/// All of these are local to one frame: the gateway logs them and drops the
/// frame, the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Buffer is shorter than a field requires.
    #[error("truncated {field}: need {needed} bytes, {available} available")]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Declared byte length disagrees with the actual one.
    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length from the wire.
        declared: usize,
        /// Length actually present.
        actual: usize,
    },

    /// Declared element count disagrees with the decoded one.
    #[error("argument count mismatch: declared {declared}, decoded {actual}")]
    ArgCountMismatch {
        /// Count from the wire.
        declared: u16,
        /// Elements actually decoded.
        actual: usize,
    },

    /// Frame type id is not one of the known variants.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u16),

    /// Command argument tag is not one of the known types.
    #[error("unknown argument type {0}")]
    UnknownArgType(u16),

    /// String bytes are not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] Utf8Error),

    /// Header length is too small to hold the timestamp and frame type.
    #[error("invalid frame length {0}")]
    InvalidLength(u16),

    /// Too many elements for a 16-bit count field.
    #[error("{field} has {count} elements, maximum is 65535")]
    CountOverflow {
        /// Sequence being encoded.
        field: &'static str,
        /// Number of elements.
        count: usize,
    },

    /// A value is longer than its size prefix can describe.
    #[error("{field} is {len} bytes, maximum is {max}")]
    ValueTooLong {
        /// Value being encoded.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum the prefix allows.
        max: usize,
    },

    /// Encoded frame does not fit the 16-bit length field.
    #[error("frame of {0} bytes does not fit the length field")]
    FrameTooLarge(usize),

    /// String contains a NUL byte, which is the wire separator.
    #[error("string contains an embedded NUL byte")]
    EmbeddedNul,
}

/// Main error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error on a socket or the poller.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unencodable frame.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// `start()` called while already running.
    #[error("already running")]
    AlreadyRunning,

    /// Operation requires a running multiplexer.
    #[error("not running")]
    NotRunning,

    /// No open connection with this id.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// No open connection from this address.
    #[error("no connections from {0}")]
    NoConnectionsForIp(IpAddr),

    /// The connection already has the maximum number of items waiting to
    /// be written.
    #[error("outbound queue full for connection {0}")]
    OutboundQueueFull(ConnectionId),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Client writer queue stayed full for too long.
    #[error("backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
