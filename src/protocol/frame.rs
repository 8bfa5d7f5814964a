//! Transport frame: header plus typed payload.
//!
//! # Example
//!
//! ```
//! use kpa_gateway::protocol::{Command, CommandArg, TransportFrame};
//!
//! let frame = TransportFrame::new(Command::new(2, 3, vec![CommandArg::Word(5)]));
//! let bytes = frame.encode().unwrap();
//! assert_eq!(bytes.len(), frame.length().unwrap() as usize + 2);
//!
//! let decoded = TransportFrame::decode(&bytes).unwrap();
//! assert_eq!(decoded.payload, frame.payload);
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::filetime::{from_filetime, to_filetime};
use super::payload::Payload;
use super::wire_format::{FrameId, Header, HEADER_SIZE, LENGTH_FIELD_SIZE};
use crate::error::CodecError;

/// A complete protocol frame.
///
/// The `length` header field is not stored; it is derived from the payload
/// when encoding and validated when decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportFrame {
    /// Send time. Only whole seconds survive encoding.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub payload: Payload,
}

impl TransportFrame {
    /// Create a frame stamped with the current time.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::with_timestamp(payload, Utc::now())
    }

    /// Create a frame with an explicit timestamp.
    pub fn with_timestamp(payload: impl Into<Payload>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }

    /// Frame id of the payload.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.payload.frame_id()
    }

    /// Value of the `length` header field for this frame.
    pub fn length(&self) -> Result<u16, CodecError> {
        let encoded = self.encode()?;
        Ok((encoded.len() - LENGTH_FIELD_SIZE) as u16)
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 32);
        buf.put_u16_le(0);
        buf.put_u64_le(to_filetime(&self.timestamp));
        self.payload.encode_into(&mut buf)?;

        let length = u16::try_from(buf.len() - LENGTH_FIELD_SIZE)
            .map_err(|_| CodecError::FrameTooLarge(buf.len()))?;
        buf[0..LENGTH_FIELD_SIZE].copy_from_slice(&length.to_le_bytes());
        Ok(buf.freeze())
    }

    /// Decode exactly one frame from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let header = Header::decode(buf).ok_or(CodecError::Truncated {
            field: "header",
            needed: HEADER_SIZE,
            available: buf.len(),
        })?;

        if header.wire_size() != buf.len() {
            return Err(CodecError::LengthMismatch {
                declared: header.length as usize,
                actual: buf.len() - LENGTH_FIELD_SIZE,
            });
        }

        let frame_id = header.frame_type()?;
        let payload = Payload::decode(frame_id, &buf[HEADER_SIZE..])?;

        Ok(Self {
            timestamp: from_filetime(header.timestamp),
            payload,
        })
    }
}

impl fmt::Display for TransportFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.payload
        )
    }
}

/// Encode a frame to bytes (standalone function).
#[inline]
pub fn encode(frame: &TransportFrame) -> Result<Bytes, CodecError> {
    frame.encode()
}

/// Decode a frame from bytes (standalone function).
#[inline]
pub fn decode(buf: &[u8]) -> Result<TransportFrame, CodecError> {
    TransportFrame::decode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::filetime::UNIX_EPOCH_AS_FILETIME;
    use crate::protocol::payload::{
        AddressParameter, AddressTelemetry, Command, CommandArg, LogMessage, Message,
        PositionTelemetry, Receipt,
    };
    use chrono::{TimeZone, Timelike};

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 15, 0).unwrap()
    }

    fn all_payloads() -> Vec<Payload> {
        vec![
            Receipt::ack(2).into(),
            Receipt {
                receipt_num: 2,
                return_code: 1,
                strings: vec!["busy".into(), String::new()],
            }
            .into(),
            Command::new(2, 3, vec![CommandArg::Word(5)]).into(),
            Command::new(
                9,
                70_000,
                vec![
                    CommandArg::String("mode".into()),
                    CommandArg::MultiByte(Bytes::from(vec![7u8; 300])),
                    CommandArg::Double(0.1),
                ],
            )
            .into(),
            AddressTelemetry {
                params: vec![
                    AddressParameter::new(1, 10, vec![0xFF; 255]),
                    AddressParameter::new(1, 11, vec![0x01]),
                ],
            }
            .into(),
            AddressTelemetry { params: Vec::new() }.into(),
            PositionTelemetry {
                telemetry_type: 2,
                data: Bytes::from_static(&[1, 2, 3, 4]),
            }
            .into(),
            Message {
                strings: vec!["a".into(), "b".into()],
            }
            .into(),
            LogMessage {
                message_type: 1,
                message: "started".into(),
            }
            .into(),
        ]
    }

    #[test]
    fn test_roundtrip_all_variants() {
        for payload in all_payloads() {
            let frame = TransportFrame::with_timestamp(payload, fixed_time());
            let decoded = TransportFrame::decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_length_invariant() {
        for payload in all_payloads() {
            let mut body = BytesMut::new();
            payload.encode_into(&mut body).unwrap();

            let frame = TransportFrame::with_timestamp(payload, fixed_time());
            let bytes = frame.encode().unwrap();
            let length = u16::from_le_bytes([bytes[0], bytes[1]]);

            assert_eq!(length as usize, body.len() + 8);
            assert_eq!(bytes.len(), length as usize + 2);
            assert_eq!(frame.length().unwrap(), length);
        }
    }

    #[test]
    fn test_header_fields() {
        let frame = TransportFrame::with_timestamp(Receipt::ack(2), DateTime::<Utc>::UNIX_EPOCH);
        let bytes = frame.encode().unwrap();
        let header = Header::decode(&bytes).unwrap();

        assert_eq!(header.timestamp, UNIX_EPOCH_AS_FILETIME);
        assert_eq!(header.frame_id, 1);
        assert_eq!(header.wire_size(), bytes.len());
    }

    #[test]
    fn test_timestamp_is_second_accurate() {
        let precise = fixed_time().with_nanosecond(750_000_000).unwrap();
        let frame = TransportFrame::with_timestamp(Message { strings: Vec::new() }, precise);
        let decoded = TransportFrame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.timestamp, fixed_time());
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut bytes = TransportFrame::with_timestamp(Receipt::ack(2), fixed_time())
            .encode()
            .unwrap()
            .to_vec();
        bytes[10] = 99;
        bytes[11] = 0;
        assert_eq!(
            TransportFrame::decode(&bytes),
            Err(CodecError::UnknownFrameType(99))
        );
    }

    #[test]
    fn test_length_field_disagrees_with_buffer() {
        let mut bytes = TransportFrame::with_timestamp(Receipt::ack(2), fixed_time())
            .encode()
            .unwrap()
            .to_vec();
        bytes.push(0);
        assert!(matches!(
            TransportFrame::decode(&bytes),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_short_buffer() {
        assert!(matches!(
            TransportFrame::decode(&[10, 0, 0]),
            Err(CodecError::Truncated { field: "header", .. })
        ));
    }

    #[test]
    fn test_garbage_never_panics() {
        // Every prefix of a valid frame, and every single-byte corruption of it,
        // must decode to a value or an error.
        let bytes = TransportFrame::with_timestamp(
            Command::new(
                1,
                2,
                vec![
                    CommandArg::String("x".into()),
                    CommandArg::MultiByte(Bytes::from_static(b"abc")),
                ],
            ),
            fixed_time(),
        )
        .encode()
        .unwrap();

        for end in 0..bytes.len() {
            let _ = TransportFrame::decode(&bytes[..end]);
        }
        for i in 0..bytes.len() {
            let mut corrupt = bytes.to_vec();
            corrupt[i] ^= 0xFF;
            let _ = TransportFrame::decode(&corrupt);
        }
    }

    #[test]
    fn test_max_length_frame() {
        // 8 timestamp + 2 frame id + 4 telemetry fields + data = 65535.
        let frame = TransportFrame::with_timestamp(
            PositionTelemetry {
                telemetry_type: 1,
                data: Bytes::from(vec![0xA5; u16::MAX as usize - 14]),
            },
            fixed_time(),
        );
        let bytes = frame.encode().unwrap();

        assert_eq!(frame.length().unwrap(), u16::MAX);
        assert_eq!(bytes.len(), u16::MAX as usize + 2);
        assert_eq!(TransportFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_too_large() {
        let frame = TransportFrame::new(PositionTelemetry {
            telemetry_type: 1,
            data: Bytes::from(vec![0u8; u16::MAX as usize - 10]),
        });
        assert!(matches!(frame.encode(), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_standalone_functions() {
        let frame = TransportFrame::with_timestamp(Receipt::nack(2), fixed_time());
        let bytes = encode(&frame).unwrap();
        assert_eq!(decode(&bytes).unwrap(), frame);
    }
}
