//! Byte-stream reassembly for backend messages.
//!
//! Backend frames are `[tag: u8][len: i32 BE][payload: len - 4]`, where
//! `len` counts itself but not the tag. Data arrives with arbitrary
//! boundaries, so bytes are accumulated in a `BytesMut` and split off one
//! frame at a time.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{PgError, PgResult};

/// Tag byte plus length field.
pub const HEADER_LEN: usize = 5;

/// Default bound on a single frame (1 GiB, the server's own message limit).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 30;

/// Initial buffer capacity (8KB - typical response size)
const BUFFER_CAPACITY: usize = 8192;

/// One complete backend frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// On-wire width: tag + length field + payload.
    pub fn width(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize back to wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.width());
        buf.push(self.tag);
        buf.extend_from_slice(&((self.payload.len() + 4) as i32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Accumulates incoming bytes and yields complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
            max_frame_len,
        }
    }

    /// Append bytes from a stream read.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mutable access for reading straight from a socket into the buffer.
    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Extract the next complete frame.
    ///
    /// Returns `Ok(None)` without consuming anything while the frame at the
    /// head of the buffer is incomplete.
    pub fn next_frame(&mut self) -> PgResult<Option<Frame>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = self.buffer[0];
        let declared = i32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]);

        if declared < 4 {
            return Err(PgError::InvalidFrameLength {
                tag: tag as char,
                len: declared,
            });
        }
        let declared = declared as usize;
        if declared > self.max_frame_len {
            return Err(PgError::FrameTooLarge {
                tag: tag as char,
                len: declared,
                max: self.max_frame_len,
            });
        }

        let width = 1 + declared;
        if self.buffer.len() < width {
            // Grow by at most one chunk until payload bytes actually arrive.
            self.buffer
                .reserve((width - self.buffer.len()).min(BUFFER_CAPACITY));
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(width);
        frame.advance(HEADER_LEN);
        Ok(Some(Frame {
            tag,
            payload: frame.freeze(),
        }))
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop everything buffered and release the allocation.
    pub fn clear(&mut self) {
        self.buffer = BytesMut::new();
    }
}
