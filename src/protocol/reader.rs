//! Bounds-checked cursor over a backend message payload.
//!
//! Every variable-width message (RowDescription, DataRow, ErrorResponse)
//! is decoded through one position that each read advances by exactly
//! its width.

use crate::error::{PgError, PgResult};

/// Cursor over the payload of a single frame.
pub struct MessageReader<'a> {
    tag: u8,
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    /// Create a reader over `data`; `tag` is used in error messages.
    pub fn new(tag: u8, data: &'a [u8]) -> Self {
        Self { tag, data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Consume and return everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn read_u8(&mut self) -> PgResult<u8> {
        let bytes = self.take(1, "byte")?;
        Ok(bytes[0])
    }

    pub fn read_i16(&mut self) -> PgResult<i16> {
        let bytes = self.take(2, "int16")?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32(&mut self) -> PgResult<i32> {
        let bytes = self.take(4, "int32")?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32(&mut self) -> PgResult<u32> {
        let bytes = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> PgResult<&'a [u8]> {
        self.take(len, "bytes")
    }

    /// Read an int32 length followed by that many bytes; `-1` is NULL.
    pub fn read_len_prefixed(&mut self) -> PgResult<Option<&'a [u8]>> {
        let len = self.read_i32()?;
        match len {
            -1 => Ok(None),
            n if n < 0 => Err(PgError::decode(
                self.tag,
                format!("negative value length {} at offset {}", n, self.pos - 4),
            )),
            n => self.take(n as usize, "value").map(Some),
        }
    }

    /// Read a null-terminated string (lossy UTF-8), consuming the terminator.
    pub fn read_cstr(&mut self) -> PgResult<String> {
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .ok_or_else(|| {
                PgError::decode(
                    self.tag,
                    format!("unterminated string at offset {}", start),
                )
            })?;
        self.pos = end + 1;
        Ok(String::from_utf8_lossy(&self.data[start..end]).into_owned())
    }

    fn take(&mut self, len: usize, what: &str) -> PgResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(PgError::decode(
                self.tag,
                format!(
                    "truncated {}: need {} bytes at offset {}, have {}",
                    what,
                    len,
                    self.pos,
                    self.remaining()
                ),
            ));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}
