//! Bounded cursor over raw section bytes.
//!
//! All of the byte-level checking is done with this cursor rather than a
//! DWARF library reader: the point is to observe exactly where and how a
//! malformed stream breaks. Every read fails with `Truncated` rather than
//! advancing past the end; there are no partial reads.

use crate::messages::{Categories, Messages, Where};
use gimli::Endianity;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("not enough data")]
    Truncated,
    #[error("variable-length integer does not terminate")]
    Overflow,
}

/// Cursor over a byte slice with a byte order and a hard end.
#[derive(Copy, Clone, Debug)]
pub struct ReadCtx<'a> {
    data: &'a [u8],
    pos: usize,
    endian: gimli::RunTimeEndian,
}

impl<'a> ReadCtx<'a> {
    pub fn new(data: &'a [u8], endian: gimli::RunTimeEndian) -> Self {
        Self { data, pos: 0, endian }
    }

    /// Child cursor bounded to `[begin, end)` of this cursor's data, with its
    /// own zero-based offsets.
    pub fn sub(&self, begin: usize, end: usize) -> Result<ReadCtx<'a>, ReadError> {
        if begin > end || end > self.data.len() {
            return Err(ReadError::Truncated);
        }
        Ok(ReadCtx::new(&self.data[begin..end], self.endian))
    }

    /// Current offset from the start of this cursor's data.
    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    /// Total number of bytes this cursor spans.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn eof(&self) -> bool {
        self.pos == self.data.len()
    }

    /// True when `n` more bytes can be read.
    pub fn need_data(&self, n: usize) -> bool {
        self.data.len() - self.pos >= n
    }

    pub fn skip(&mut self, n: u64) -> Result<(), ReadError> {
        let n = usize::try_from(n).map_err(|_| ReadError::Truncated)?;
        if !self.need_data(n) {
            return Err(ReadError::Truncated);
        }
        self.pos += n;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        if !self.need_data(n) {
            return Err(ReadError::Truncated);
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_ubyte(&mut self) -> Result<u8, ReadError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_2ubyte(&mut self) -> Result<u16, ReadError> {
        Ok(self.endian.read_u16(self.take(2)?))
    }

    pub fn read_4ubyte(&mut self) -> Result<u32, ReadError> {
        Ok(self.endian.read_u32(self.take(4)?))
    }

    pub fn read_8ubyte(&mut self) -> Result<u64, ReadError> {
        Ok(self.endian.read_u64(self.take(8)?))
    }

    /// Reads a 4- or 8-byte quantity, per `is_64`.
    pub fn read_offset(&mut self, is_64: bool) -> Result<u64, ReadError> {
        if is_64 {
            self.read_8ubyte()
        } else {
            Ok(u64::from(self.read_4ubyte()?))
        }
    }

    /// Unsigned LEB128. Fails `Overflow` when payload bits beyond a `u64`
    /// are significant or the encoding runs past 128 bits.
    pub fn read_uleb128(&mut self) -> Result<u64, ReadError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_ubyte()?;
            let payload = u64::from(byte & 0x7f);
            if shift < 64 {
                if shift == 63 && payload > 1 {
                    return Err(ReadError::Overflow);
                }
                value |= payload << shift;
            } else if payload != 0 || shift >= 128 {
                return Err(ReadError::Overflow);
            }
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Signed LEB128, same failure rules as the unsigned variant.
    pub fn read_sleb128(&mut self) -> Result<i64, ReadError> {
        let mut value: i64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_ubyte()?;
            let payload = byte & 0x7f;
            if shift < 63 {
                value |= i64::from(payload) << shift;
            } else if shift == 63 {
                // Only the lowest payload bit still lands in the value; the
                // six above it must agree with the sign it implies.
                if payload != 0 && payload != 0x7f {
                    return Err(ReadError::Overflow);
                }
                value |= i64::from(payload & 1) << 63;
            } else {
                // Pure sign extension from here on.
                let expect = if value < 0 { 0x7f } else { 0x00 };
                if payload != expect || shift >= 128 {
                    return Err(ReadError::Overflow);
                }
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    // Sign-extend.
                    value |= -1i64 << shift;
                }
                return Ok(value);
            }
        }
    }
}

/// Minimal number of bytes an unsigned LEB128 encoding of `value` needs.
fn uleb128_size(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        (64 - value.leading_zeros() as usize + 6) / 7
    }
}

/// Reads a ULEB128 and reports a bloat finding when the encoding spends more
/// bytes than the value needs.
pub fn checked_read_uleb128(
    ctx: &mut ReadCtx<'_>,
    messages: &mut Messages,
    wh: &Where,
    what: &str,
) -> Result<u64, ReadError> {
    let start = ctx.offset();
    let value = ctx.read_uleb128()?;
    let used = (ctx.offset() - start) as usize;
    if used > uleb128_size(value) {
        messages.message(
            Categories::LEB128 | Categories::ACC_BLOAT | Categories::IMPACT_3,
            wh,
            format!("{}: value {:#x} encoded with {} redundant bytes", what, value, used - uleb128_size(value)),
        );
    }
    Ok(value)
}

/// Signed counterpart of [`checked_read_uleb128`].
pub fn checked_read_sleb128(
    ctx: &mut ReadCtx<'_>,
    messages: &mut Messages,
    wh: &Where,
    what: &str,
) -> Result<i64, ReadError> {
    let start = ctx.offset();
    let value = ctx.read_sleb128()?;
    let used = (ctx.offset() - start) as usize;
    let needed = sleb128_size(value);
    if used > needed {
        messages.message(
            Categories::LEB128 | Categories::ACC_BLOAT | Categories::IMPACT_3,
            wh,
            format!("{}: value {} encoded with {} redundant bytes", what, value, used - needed),
        );
    }
    Ok(value)
}

fn sleb128_size(value: i64) -> usize {
    let mut v = value;
    let mut size = 0;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        size += 1;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        if done {
            return size;
        }
    }
}
