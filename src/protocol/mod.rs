//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary frame codec:
//! - 12-byte little-endian header with FILETIME timestamp
//! - Six tag-driven payload variants
//! - Frame buffer for reassembling frames from a byte stream
//!
//! Everything here is pure: no I/O, no shared state.

mod cursor;
pub mod filetime;
mod frame;
mod frame_buffer;
mod payload;
mod wire_format;

pub use frame::{decode, encode, TransportFrame};
pub use frame_buffer::FrameBuffer;
pub use payload::{
    hex, AddressParameter, AddressTelemetry, Command, CommandArg, LogMessage, Message, Payload,
    PositionTelemetry, Receipt, MAX_ADDRESS_VALUE_SIZE,
};
pub use wire_format::{
    peek_frame_len, ArgType, FrameId, Header, HEADER_SIZE, LENGTH_FIELD_SIZE, MAX_FRAME_SIZE,
    MIN_FRAME_LENGTH, TIMESTAMP_SIZE,
};
