//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForLength`: Need the 2-byte length field
//! - `WaitingForFrame`: Length known, need the rest of the frame
//!
//! A single socket read may carry part of a frame, several frames, or the
//! tail of one frame and the head of the next; `push` handles all three.
//!
//! # Example
//!
//! ```
//! use kpa_gateway::protocol::{FrameBuffer, Receipt, TransportFrame};
//!
//! let bytes = TransportFrame::new(Receipt::ack(2)).encode().unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[5..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0], bytes);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::peek_frame_len;
use crate::error::CodecError;

/// Default initial buffer capacity.
const DEFAULT_CAPACITY: usize = 4 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the length field.
    WaitingForLength,
    /// Length parsed, waiting for `size` bytes in total.
    WaitingForFrame { size: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Extracted frames are returned as raw wire bytes (length field included)
/// so that they can be handed to another thread and decoded there.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl FrameBuffer {
    /// Create a new frame buffer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new frame buffer with a custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForLength,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidLength` when a length field is too small
    /// to describe a frame. The stream cannot be resynchronised after that;
    /// the caller should drop the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>, CodecError> {
        loop {
            match self.state {
                State::WaitingForLength => match peek_frame_len(&self.buffer)? {
                    None => return Ok(None),
                    Some(size) => self.state = State::WaitingForFrame { size },
                },
                State::WaitingForFrame { size } => {
                    if self.buffer.len() < size {
                        return Ok(None);
                    }
                    self.state = State::WaitingForLength;
                    return Ok(Some(self.buffer.split_to(size).freeze()));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        Command, CommandArg, LogMessage, PositionTelemetry, Receipt, TransportFrame,
    };

    fn frame_bytes(n: u32) -> Bytes {
        TransportFrame::new(Command::new(1, n, vec![CommandArg::Dword(n)]))
            .encode()
            .unwrap()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(1);

        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames, vec![bytes]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let parts = [frame_bytes(1), frame_bytes(2), frame_bytes(3)];
        let combined: Vec<u8> = parts.iter().flat_map(|b| b.iter().copied()).collect();

        let frames = buffer.push(&combined).unwrap();

        assert_eq!(frames, parts.to_vec());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_length_field() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(7);

        assert!(buffer.push(&bytes[..1]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForLength");

        let frames = buffer.push(&bytes[1..]).unwrap();
        assert_eq!(frames, vec![bytes]);
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let bytes = TransportFrame::new(LogMessage {
            message_type: 1,
            message: "this is a longer log line that will be fragmented".into(),
        })
        .encode()
        .unwrap();

        assert!(buffer.push(&bytes[..20]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        let frames = buffer.push(&bytes[20..]).unwrap();
        assert_eq!(frames, vec![bytes]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();
        let first = frame_bytes(1);
        let second = frame_bytes(2);

        let mut data = first.to_vec();
        data.extend_from_slice(&second[..5]);

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames, vec![first]);
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        let frames = buffer.push(&second[5..]).unwrap();
        assert_eq!(frames, vec![second]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = TransportFrame::new(Receipt::ack(2)).encode().unwrap();

        let mut all = Vec::new();
        for byte in bytes.iter() {
            all.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all, vec![bytes]);
    }

    #[test]
    fn test_max_length_frame_reassembled() {
        let mut buffer = FrameBuffer::new();
        let bytes = TransportFrame::new(PositionTelemetry {
            telemetry_type: 3,
            data: Bytes::from(vec![7u8; u16::MAX as usize - 14]),
        })
        .encode()
        .unwrap();
        assert_eq!(bytes.len(), u16::MAX as usize + 2);

        let mut frames = Vec::new();
        for chunk in bytes.chunks(1024) {
            frames.extend(buffer.push(chunk).unwrap());
        }

        assert_eq!(frames, vec![bytes]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_invalid_length_rejected() {
        let mut buffer = FrameBuffer::new();
        assert_eq!(
            buffer.push(&[3, 0, 1, 2, 3]),
            Err(CodecError::InvalidLength(3))
        );
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(1);
        buffer.push(&bytes[..5]).unwrap();
        assert_eq!(buffer.len(), 5);

        buffer.clear();

        assert_eq!(buffer.state_name(), "WaitingForLength");
        assert!(buffer.is_empty());
    }
}
