//! Bounds-checked little-endian reading over `bytes::Buf`.
//!
//! `Buf::get_*` panics on a short buffer; every read here checks
//! `remaining()` first and reports `CodecError::Truncated` instead.

use bytes::{Buf, Bytes};

use crate::error::CodecError;

/// Cursor over a payload slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                field,
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn i8(&mut self, field: &'static str) -> Result<i8, CodecError> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_i8())
    }

    pub(crate) fn u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_u16_le())
    }

    pub(crate) fn i16(&mut self, field: &'static str) -> Result<i16, CodecError> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_i16_le())
    }

    pub(crate) fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn i32(&mut self, field: &'static str) -> Result<i32, CodecError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_i32_le())
    }

    pub(crate) fn u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn f32(&mut self, field: &'static str) -> Result<f32, CodecError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_f32_le())
    }

    pub(crate) fn f64(&mut self, field: &'static str) -> Result<f64, CodecError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_f64_le())
    }

    /// Take exactly `len` bytes.
    pub(crate) fn bytes(&mut self, field: &'static str, len: usize) -> Result<Bytes, CodecError> {
        self.ensure(field, len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Take bytes up to the next NUL and consume the NUL.
    pub(crate) fn c_str(&mut self, field: &'static str) -> Result<String, CodecError> {
        let Some(end) = self.buf.iter().position(|&b| b == 0) else {
            return Err(CodecError::Truncated {
                field,
                needed: self.buf.len() + 1,
                available: self.buf.len(),
            });
        };
        let text = std::str::from_utf8(&self.buf[..end])?.to_owned();
        self.buf.advance(end + 1);
        Ok(text)
    }

    /// Take everything that is left.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}
