//! Payload variants and their per-type encodings.
//!
//! Every payload starts with its `u16` frame id. Count and size fields are
//! not stored in the structs: they are derived from the sequences when
//! encoding and checked against the decoded elements when decoding.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::cursor::Reader;
use super::wire_format::{ArgType, FrameId};
use crate::error::CodecError;

/// Maximum size of an address-telemetry value (one-byte size field).
pub const MAX_ADDRESS_VALUE_SIZE: usize = u8::MAX as usize;

/// Smallest encoded command argument: a tag and one byte.
const MIN_ARG_SIZE: usize = 3;

/// Smallest encoded address parameter: type, number and size, no value.
const MIN_PARAM_SIZE: usize = 5;

/// Acknowledgement of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Which frame kind is being acknowledged.
    pub receipt_num: u16,
    /// 0 = success, anything else = failure.
    pub return_code: u16,
    /// Optional text attachments.
    pub strings: Vec<String>,
}

impl Receipt {
    /// Successful receipt with no strings.
    pub fn ack(receipt_num: u16) -> Self {
        Self {
            receipt_num,
            return_code: 0,
            strings: Vec::new(),
        }
    }

    /// Failed receipt with no strings.
    pub fn nack(receipt_num: u16) -> Self {
        Self {
            receipt_num,
            return_code: 1,
            strings: Vec::new(),
        }
    }

    /// Whether the return code signals success.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }
}

/// A typed command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    /// Unsigned byte.
    Byte(u8),
    /// Signed byte.
    ByteSigned(i8),
    /// Unsigned 16-bit word.
    Word(u16),
    /// Signed 16-bit word.
    WordSigned(i16),
    /// Unsigned 32-bit double word.
    Dword(u32),
    /// Signed 32-bit double word.
    DwordSigned(i32),
    /// 32-bit float.
    Real(f32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string, NUL-terminated on the wire.
    String(String),
    /// Raw bytes with a `u16` length prefix.
    MultiByte(Bytes),
}

impl CommandArg {
    /// The wire tag for this argument.
    pub fn arg_type(&self) -> ArgType {
        match self {
            Self::Byte(_) => ArgType::Byte,
            Self::ByteSigned(_) => ArgType::ByteSigned,
            Self::Word(_) => ArgType::Word,
            Self::WordSigned(_) => ArgType::WordSigned,
            Self::Dword(_) => ArgType::Dword,
            Self::DwordSigned(_) => ArgType::DwordSigned,
            Self::Real(_) => ArgType::Real,
            Self::Double(_) => ArgType::Double,
            Self::String(_) => ArgType::String,
            Self::MultiByte(_) => ArgType::MultiByte,
        }
    }

    fn encode_into(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        out.put_u16_le(self.arg_type().as_u16());
        match self {
            Self::Byte(v) => out.put_u8(*v),
            Self::ByteSigned(v) => out.put_i8(*v),
            Self::Word(v) => out.put_u16_le(*v),
            Self::WordSigned(v) => out.put_i16_le(*v),
            Self::Dword(v) => out.put_u32_le(*v),
            Self::DwordSigned(v) => out.put_i32_le(*v),
            Self::Real(v) => out.put_f32_le(*v),
            Self::Double(v) => out.put_f64_le(*v),
            Self::String(s) => put_c_str(out, s)?,
            Self::MultiByte(data) => {
                let len = u16::try_from(data.len()).map_err(|_| CodecError::ValueTooLong {
                    field: "multi-byte argument",
                    len: data.len(),
                    max: u16::MAX as usize,
                })?;
                out.put_u16_le(len);
                out.put_slice(data);
            }
        }
        Ok(())
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let tag = ArgType::try_from(reader.u16("argument tag")?)?;
        let arg = match tag {
            ArgType::Byte => Self::Byte(reader.u8("byte argument")?),
            ArgType::ByteSigned => Self::ByteSigned(reader.i8("byte argument")?),
            ArgType::Word => Self::Word(reader.u16("word argument")?),
            ArgType::WordSigned => Self::WordSigned(reader.i16("word argument")?),
            ArgType::Dword => Self::Dword(reader.u32("dword argument")?),
            ArgType::DwordSigned => Self::DwordSigned(reader.i32("dword argument")?),
            ArgType::Real => Self::Real(reader.f32("real argument")?),
            ArgType::Double => Self::Double(reader.f64("double argument")?),
            ArgType::String => Self::String(reader.c_str("string argument")?),
            ArgType::MultiByte => {
                let len = reader.u16("multi-byte length")? as usize;
                Self::MultiByte(reader.bytes("multi-byte argument", len)?)
            }
        };
        Ok(arg)
    }
}

/// Control command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command group.
    pub cmd_type: u16,
    /// Command within the group.
    pub cmd_code: u32,
    /// Typed arguments in wire order.
    pub args: Vec<CommandArg>,
}

impl Command {
    /// Create a command.
    pub fn new(cmd_type: u16, cmd_code: u32, args: Vec<CommandArg>) -> Self {
        Self {
            cmd_type,
            cmd_code,
            args,
        }
    }
}

/// One address-keyed telemetry value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParameter {
    /// Telemetry type, used as the routing key.
    pub telemetry_type: u16,
    /// Parameter number.
    pub arg_num: u16,
    /// Raw value, at most 255 bytes.
    pub value: Bytes,
}

impl AddressParameter {
    /// Create a parameter.
    pub fn new(telemetry_type: u16, arg_num: u16, value: impl Into<Bytes>) -> Self {
        Self {
            telemetry_type,
            arg_num,
            value: value.into(),
        }
    }
}

/// Address-keyed telemetry report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTelemetry {
    /// Parameters in wire order.
    pub params: Vec<AddressParameter>,
}

/// Position telemetry block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionTelemetry {
    /// Telemetry type, used as the routing key.
    pub telemetry_type: u16,
    /// Raw telemetry data.
    pub data: Bytes,
}

/// Text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Strings in wire order.
    pub strings: Vec<String>,
}

/// Log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Severity or category, application-defined.
    pub message_type: u16,
    /// Message text (runs to the end of the frame).
    pub message: String,
}

/// Payload of a transport frame, one case per frame id.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Frame id 1.
    Receipt(Receipt),
    /// Frame id 2.
    Command(Command),
    /// Frame id 4.
    AddressTelemetry(AddressTelemetry),
    /// Frame id 5.
    PositionTelemetry(PositionTelemetry),
    /// Frame id 6.
    Message(Message),
    /// Frame id 7.
    LogMessage(LogMessage),
}

impl Payload {
    /// Frame id of this variant.
    pub fn frame_id(&self) -> FrameId {
        match self {
            Self::Receipt(_) => FrameId::Receipt,
            Self::Command(_) => FrameId::Command,
            Self::AddressTelemetry(_) => FrameId::AddressTelemetry,
            Self::PositionTelemetry(_) => FrameId::PositionTelemetry,
            Self::Message(_) => FrameId::Message,
            Self::LogMessage(_) => FrameId::LogMessage,
        }
    }

    /// Append the frame id and body to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        out.put_u16_le(self.frame_id().as_u16());
        match self {
            Self::Receipt(r) => {
                out.put_u16_le(r.receipt_num);
                out.put_u16_le(r.return_code);
                out.put_u16_le(count("receipt strings", r.strings.len())?);
                put_strings(out, &r.strings)?;
            }
            Self::Command(c) => {
                out.put_u16_le(c.cmd_type);
                out.put_u32_le(c.cmd_code);
                out.put_u16_le(count("command arguments", c.args.len())?);
                for arg in &c.args {
                    arg.encode_into(out)?;
                }
            }
            Self::AddressTelemetry(t) => {
                out.put_u16_le(count("address parameters", t.params.len())?);
                for param in &t.params {
                    let size = u8::try_from(param.value.len()).map_err(|_| {
                        CodecError::ValueTooLong {
                            field: "address parameter value",
                            len: param.value.len(),
                            max: MAX_ADDRESS_VALUE_SIZE,
                        }
                    })?;
                    out.put_u16_le(param.telemetry_type);
                    out.put_u16_le(param.arg_num);
                    out.put_u8(size);
                    out.put_slice(&param.value);
                }
            }
            Self::PositionTelemetry(t) => {
                let size = u16::try_from(t.data.len()).map_err(|_| CodecError::ValueTooLong {
                    field: "position telemetry data",
                    len: t.data.len(),
                    max: u16::MAX as usize,
                })?;
                out.put_u16_le(t.telemetry_type);
                out.put_u16_le(size);
                out.put_slice(&t.data);
            }
            Self::Message(m) => {
                out.put_u16_le(count("message strings", m.strings.len())?);
                put_strings(out, &m.strings)?;
            }
            Self::LogMessage(l) => {
                out.put_u16_le(l.message_type);
                out.put_slice(l.message.as_bytes());
            }
        }
        Ok(())
    }

    /// Decode the body that follows the frame id.
    pub fn decode(frame_id: FrameId, body: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(body);
        let payload = match frame_id {
            FrameId::Receipt => {
                let receipt_num = reader.u16("receipt_num")?;
                let return_code = reader.u16("return_code")?;
                let declared = reader.u16("arg_amount")?;
                let strings = split_strings(reader.rest())?;
                check_count(declared, strings.len())?;
                Self::Receipt(Receipt {
                    receipt_num,
                    return_code,
                    strings,
                })
            }
            FrameId::Command => {
                let cmd_type = reader.u16("cmd_type")?;
                let cmd_code = reader.u32("cmd_code")?;
                let declared = reader.u16("arg_amount")?;
                let mut args = Vec::with_capacity(capacity(declared, &reader, MIN_ARG_SIZE));
                while !reader.is_empty() {
                    args.push(CommandArg::decode(&mut reader)?);
                }
                check_count(declared, args.len())?;
                Self::Command(Command {
                    cmd_type,
                    cmd_code,
                    args,
                })
            }
            FrameId::AddressTelemetry => {
                let declared = reader.u16("arg_amount")?;
                let mut params = Vec::with_capacity(capacity(declared, &reader, MIN_PARAM_SIZE));
                while !reader.is_empty() {
                    let telemetry_type = reader.u16("telemetry_type")?;
                    let arg_num = reader.u16("arg_num")?;
                    let size = reader.u8("parameter size")? as usize;
                    let value = reader.bytes("parameter value", size)?;
                    params.push(AddressParameter {
                        telemetry_type,
                        arg_num,
                        value,
                    });
                }
                check_count(declared, params.len())?;
                Self::AddressTelemetry(AddressTelemetry { params })
            }
            FrameId::PositionTelemetry => {
                let telemetry_type = reader.u16("telemetry_type")?;
                let size = reader.u16("size")? as usize;
                if reader.remaining() != size {
                    return Err(CodecError::LengthMismatch {
                        declared: size,
                        actual: reader.remaining(),
                    });
                }
                Self::PositionTelemetry(PositionTelemetry {
                    telemetry_type,
                    data: Bytes::copy_from_slice(reader.rest()),
                })
            }
            FrameId::Message => {
                let declared = reader.u16("str_amount")?;
                let strings = split_strings(reader.rest())?;
                check_count(declared, strings.len())?;
                Self::Message(Message { strings })
            }
            FrameId::LogMessage => {
                let message_type = reader.u16("message_type")?;
                let message = std::str::from_utf8(reader.rest())?.to_owned();
                Self::LogMessage(LogMessage {
                    message_type,
                    message,
                })
            }
        };
        Ok(payload)
    }
}

impl From<Receipt> for Payload {
    fn from(value: Receipt) -> Self {
        Self::Receipt(value)
    }
}

impl From<Command> for Payload {
    fn from(value: Command) -> Self {
        Self::Command(value)
    }
}

impl From<AddressTelemetry> for Payload {
    fn from(value: AddressTelemetry) -> Self {
        Self::AddressTelemetry(value)
    }
}

impl From<PositionTelemetry> for Payload {
    fn from(value: PositionTelemetry) -> Self {
        Self::PositionTelemetry(value)
    }
}

impl From<Message> for Payload {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

impl From<LogMessage> for Payload {
    fn from(value: LogMessage) -> Self {
        Self::LogMessage(value)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receipt(r) => write!(
                f,
                "Receipt num={} code={} strings={:?}",
                r.receipt_num, r.return_code, r.strings
            ),
            Self::Command(c) => write!(
                f,
                "Command type={} code={} args={:?}",
                c.cmd_type, c.cmd_code, c.args
            ),
            Self::AddressTelemetry(t) => {
                write!(f, "AddressTelemetry params={}", t.params.len())?;
                for p in &t.params {
                    write!(f, " [{}#{}: {}]", p.telemetry_type, p.arg_num, hex(&p.value))?;
                }
                Ok(())
            }
            Self::PositionTelemetry(t) => write!(
                f,
                "PositionTelemetry type={} size={} data={}",
                t.telemetry_type,
                t.data.len(),
                hex(&t.data)
            ),
            Self::Message(m) => write!(f, "Message strings={:?}", m.strings),
            Self::LogMessage(l) => write!(f, "LogMessage type={} msg={:?}", l.message_type, l.message),
        }
    }
}

/// Uppercase space-separated hex, the format used in traffic logs.
pub fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02X}"));
    }
    out
}

fn count(field: &'static str, len: usize) -> Result<u16, CodecError> {
    u16::try_from(len).map_err(|_| CodecError::CountOverflow { field, count: len })
}

/// Preallocation for `declared` elements, bounded by what the body can hold.
fn capacity(declared: u16, reader: &Reader<'_>, min_size: usize) -> usize {
    usize::from(declared).min(reader.remaining() / min_size)
}

fn check_count(declared: u16, actual: usize) -> Result<(), CodecError> {
    if declared as usize != actual {
        return Err(CodecError::ArgCountMismatch { declared, actual });
    }
    Ok(())
}

fn put_c_str(out: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    if s.as_bytes().contains(&0) {
        return Err(CodecError::EmbeddedNul);
    }
    out.put_slice(s.as_bytes());
    out.put_u8(0);
    Ok(())
}

fn put_strings(out: &mut BytesMut, strings: &[String]) -> Result<(), CodecError> {
    for s in strings {
        put_c_str(out, s)?;
    }
    Ok(())
}

/// Split on NUL, dropping the single trailing empty segment a terminator leaves.
fn split_strings(body: &[u8]) -> Result<Vec<String>, CodecError> {
    let mut segments: Vec<&[u8]> = body.split(|&b| b == 0).collect();
    if segments.last().is_some_and(|s| s.is_empty()) {
        segments.pop();
    }
    segments
        .into_iter()
        .map(|s| Ok(std::str::from_utf8(s)?.to_owned()))
        .collect()
}
