//! Bounds-checked little-endian byte buffers.
//!
//! [`ByteWriter`] appends fixed-width values to a growable buffer and can
//! roll back to an earlier offset or patch a value already written.
//! [`ByteReader`] walks a received slice and fails with
//! [`WireError::UnexpectedEnd`] instead of reading past the end.

use crate::error::WireError;

// ---------------------------------------------------------------------------
// ByteWriter
// ---------------------------------------------------------------------------

/// Appends little-endian values to a borrowed `Vec<u8>`.
pub struct ByteWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> ByteWriter<'a> {
    /// Wraps `buf`; writes append after its current contents.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    /// Current length of the underlying buffer.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Appends one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Appends a `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an `f32`.
    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Appends `count` zero bytes.
    pub fn write_zeros(&mut self, count: usize) {
        self.buf.resize(self.buf.len() + count, 0);
    }

    /// Writes a zero `u16` placeholder and returns its offset for
    /// [`patch_u16`](Self::patch_u16).
    pub fn reserve_u16(&mut self) -> usize {
        let at = self.buf.len();
        self.write_u16(0);
        at
    }

    /// Overwrites a `u16` previously written at `at`.
    ///
    /// Returns `false` (and writes nothing) if `at` is out of range.
    pub fn patch_u16(&mut self, at: usize, value: u16) -> bool {
        match self.buf.get_mut(at..at + 2) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Mutable view of bytes already written, starting at `at`.
    pub fn written_mut(&mut self, at: usize) -> &mut [u8] {
        let at = at.min(self.buf.len());
        &mut self.buf[at..]
    }

    /// Discards everything written after `position`.
    pub fn rollback(&mut self, position: usize) {
        self.buf.truncate(position);
    }
}

// ---------------------------------------------------------------------------
// ByteReader
// ---------------------------------------------------------------------------

/// Reads little-endian values from a received slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Starts reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Offset of the next byte to read.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns `true` when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrows the next `len` bytes and advances past them.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(WireError::UnexpectedEnd {
                needed: len,
                remaining,
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Advances past `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), WireError> {
        self.read_bytes(len).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a `u16`.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Reads an `i32`.
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Reads an `f32`.
    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// The unread tail of the buffer, without advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}
