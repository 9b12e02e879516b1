//! Byte buffer implementation
//!
//! Provides the little-endian byte buffer the world protocol is built on:
//! - Fixed-width integer and float types
//! - Null-terminated and length-prefixed strings
//! - MSB-first bit packing with an explicit flush
//! - Bounds-checked reads that fail instead of reading past the end

use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Maximum packet size (64KB)
pub const MAX_PACKET_SIZE: usize = 65535;

/// Error raised when a read runs past the written data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("attempted to read {requested} bytes at position {pos} of {size}")]
    OutOfBounds {
        pos: usize,
        requested: usize,
        size: usize,
    },

    #[error("unterminated string starting at position {pos}")]
    UnterminatedString { pos: usize },
}

/// Byte buffer for reading and writing world protocol data
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    /// Internal byte buffer
    data: BytesMut,
    /// Current read position
    read_pos: usize,
    /// Bit reader position within `read_bit_value` (8 = exhausted)
    read_bit_pos: u8,
    /// Byte currently being consumed by the bit reader
    read_bit_value: u8,
    /// Bit writer position within `write_bit_value` (8 = nothing pending)
    write_bit_pos: u8,
    /// Byte currently being assembled by the bit writer
    write_bit_value: u8,
}

impl ByteBuffer {
    /// Create a new empty buffer
    pub fn new() -> Self {
        Self::wrap(BytesMut::new())
    }

    /// Create a buffer with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self::wrap(BytesMut::with_capacity(capacity))
    }

    /// Create a buffer from existing bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::wrap(BytesMut::from(bytes))
    }

    /// Create a buffer by wrapping a BytesMut
    pub fn wrap(data: BytesMut) -> Self {
        Self {
            data,
            read_pos: 0,
            read_bit_pos: 8,
            read_bit_value: 0,
            write_bit_pos: 8,
            write_bit_value: 0,
        }
    }

    // ============ Properties ============

    /// Get the current read position
    #[inline]
    pub fn rpos(&self) -> usize {
        self.read_pos
    }

    /// Set the read position, clamped to the written size
    #[inline]
    pub fn set_rpos(&mut self, pos: usize) {
        self.read_pos = pos.min(self.data.len());
        self.reset_bit_reader();
    }

    /// Get the current write position (end of buffer)
    #[inline]
    pub fn wpos(&self) -> usize {
        self.data.len()
    }

    /// Get the total length of the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of bytes remaining to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    /// Get a reference to the underlying bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the underlying BytesMut
    #[inline]
    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    /// Clear the buffer and reset positions
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.reset_bit_reader();
        self.write_bit_pos = 8;
        self.write_bit_value = 0;
    }

    /// Mark the whole buffer as consumed
    pub fn rfinish(&mut self) {
        self.read_pos = self.data.len();
        self.reset_bit_reader();
    }

    /// Skip a number of bytes when reading
    pub fn skip(&mut self, count: usize) -> Result<(), BufferError> {
        self.check_read(count)?;
        self.read_pos += count;
        self.reset_bit_reader();
        Ok(())
    }

    #[inline]
    fn check_read(&self, requested: usize) -> Result<(), BufferError> {
        if requested > self.remaining() {
            return Err(BufferError::OutOfBounds {
                pos: self.read_pos,
                requested,
                size: self.data.len(),
            });
        }
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], BufferError> {
        self.check_read(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.read_pos..self.read_pos + N]);
        self.read_pos += N;
        self.reset_bit_reader();
        Ok(out)
    }

    // ============ Reading Methods ============

    /// Read an unsigned byte
    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a little-endian u16
    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian u32
    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian u64
    pub fn read_u64(&mut self) -> Result<u64, BufferError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian f32
    pub fn read_f32(&mut self) -> Result<f32, BufferError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Peek at the next byte without consuming it
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.read_pos).copied()
    }

    // ============ String Reading ============

    /// Read a null-terminated string
    ///
    /// Fails if no terminator exists before the end of the buffer; the read
    /// position is left untouched in that case.
    pub fn read_cstring(&mut self) -> Result<String, BufferError> {
        let start = self.read_pos;
        let terminator = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(BufferError::UnterminatedString { pos: start })?;
        let value = String::from_utf8_lossy(&self.data[start..start + terminator]).into_owned();
        self.read_pos = start + terminator + 1;
        self.reset_bit_reader();
        Ok(value)
    }

    /// Read a string of exactly `length` bytes (no terminator)
    pub fn read_string(&mut self, length: usize) -> Result<String, BufferError> {
        let bytes = self.read_bytes(length)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a specific number of bytes
    pub fn read_bytes(&mut self, length: usize) -> Result<Vec<u8>, BufferError> {
        self.check_read(length)?;
        let bytes = self.data[self.read_pos..self.read_pos + length].to_vec();
        self.read_pos += length;
        self.reset_bit_reader();
        Ok(bytes)
    }

    /// Borrow every unread byte and mark them consumed
    pub fn read_remaining(&mut self) -> &[u8] {
        let start = self.read_pos;
        self.rfinish();
        &self.data[start..]
    }

    // ============ Writing Methods ============

    /// Write an unsigned byte
    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write a little-endian u16
    pub fn write_u16(&mut self, value: u16) {
        self.data.put_u16_le(value);
    }

    /// Write a little-endian u32
    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    /// Write a little-endian u64
    pub fn write_u64(&mut self, value: u64) {
        self.data.put_u64_le(value);
    }

    /// Write a little-endian f32
    pub fn write_f32(&mut self, value: f32) {
        self.data.put_f32_le(value);
    }

    /// Write a null-terminated string
    pub fn write_cstring(&mut self, value: &str) {
        self.data.put_slice(value.as_bytes());
        self.data.put_u8(0);
    }

    /// Write string bytes without a terminator
    pub fn write_str(&mut self, value: &str) {
        self.data.put_slice(value.as_bytes());
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    // ============ Bit Access ============

    /// Discard any partially consumed byte held by the bit reader
    #[inline]
    pub fn reset_bit_reader(&mut self) {
        self.read_bit_pos = 8;
    }

    /// Read a single bit, most significant bit of each byte first
    pub fn read_bit(&mut self) -> Result<bool, BufferError> {
        if self.read_bit_pos >= 8 {
            self.check_read(1)?;
            self.read_bit_value = self.data[self.read_pos];
            self.read_pos += 1;
            self.read_bit_pos = 0;
        }
        let bit = (self.read_bit_value >> (7 - self.read_bit_pos)) & 1;
        self.read_bit_pos += 1;
        Ok(bit == 1)
    }

    /// Read `count` bits (at most 32) as an unsigned value
    pub fn read_bits(&mut self, count: u32) -> Result<u32, BufferError> {
        let mut value = 0u32;
        for i in (0..count.min(32)).rev() {
            if self.read_bit()? {
                value |= 1 << i;
            }
        }
        Ok(value)
    }

    /// Append a single bit to the pending bit byte
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bit_pos -= 1;
        if bit {
            self.write_bit_value |= 1 << self.write_bit_pos;
        }
        if self.write_bit_pos == 0 {
            self.data.put_u8(self.write_bit_value);
            self.write_bit_pos = 8;
            self.write_bit_value = 0;
        }
    }

    /// Append the low `count` bits of `value`, most significant first
    pub fn write_bits(&mut self, value: u32, count: u32) {
        for i in (0..count.min(32)).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Pad and emit any partially written bit byte
    pub fn flush_bits(&mut self) {
        if self.write_bit_pos == 8 {
            return;
        }
        self.data.put_u8(self.write_bit_value);
        self.write_bit_pos = 8;
        self.write_bit_value = 0;
    }

    // ============ Diagnostics ============

    /// Render the buffer as a hex dump, 16 bytes per line
    pub fn hexlike(&self) -> String {
        let mut out = String::with_capacity(self.data.len() * 3 + 32);
        let _ = write!(out, "STORAGE_SIZE: {}", self.data.len());
        for (i, byte) in self.data.iter().enumerate() {
            if i % 16 == 0 {
                out.push('\n');
            } else if i % 8 == 0 {
                out.push_str("| ");
            }
            let _ = write!(out, "{:02X} ", byte);
        }
        out
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(vec: Vec<u8>) -> Self {
        Self::wrap(BytesMut::from(&vec[..]))
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(slice: &[u8]) -> Self {
        Self::from_bytes(slice)
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_basic_read_write() {
        let mut buf = ByteBuffer::new();

        buf.write_u8(255);
        buf.write_u16(0x1234);
        buf.write_u32(0xDEADBEEF);
        buf.write_u64(123456789012345);
        buf.write_f32(1.5);

        assert_eq!(&buf.as_bytes()[1..3], &[0x34, 0x12]);

        assert_eq!(buf.read_u8().unwrap(), 255);
        assert_eq!(buf.read_u16().unwrap(), 0x1234);
        assert_eq!(buf.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(buf.read_u64().unwrap(), 123456789012345);
        assert_eq!(buf.read_f32().unwrap(), 1.5);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut buf = ByteBuffer::from_bytes(&[1, 2, 3]);

        let err = buf.read_u32().unwrap_err();
        assert_eq!(
            err,
            BufferError::OutOfBounds {
                pos: 0,
                requested: 4,
                size: 3
            }
        );
        // A failed read does not move the cursor
        assert_eq!(buf.rpos(), 0);
        assert_eq!(buf.read_u16().unwrap(), 0x0201);
    }

    #[test]
    fn test_cstring() {
        let mut buf = ByteBuffer::new();
        buf.write_cstring("Blizzard_AuctionUI");
        buf.write_cstring("");

        assert_eq!(buf.read_cstring().unwrap(), "Blizzard_AuctionUI");
        assert_eq!(buf.read_cstring().unwrap(), "");
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_unterminated_cstring() {
        let mut buf = ByteBuffer::from_bytes(b"abc");
        assert_eq!(
            buf.read_cstring().unwrap_err(),
            BufferError::UnterminatedString { pos: 0 }
        );
        assert_eq!(buf.rpos(), 0);
    }

    #[test]
    fn test_bit_access() {
        let mut buf = ByteBuffer::new();

        buf.write_bit(true);
        buf.write_bits(15, 5);
        buf.write_bits(1234, 13);
        buf.flush_bits();
        buf.write_u8(0xAB);

        // 1 + 5 + 13 bits = 19 bits -> 3 bytes, then the plain byte
        assert_eq!(buf.len(), 4);

        assert!(buf.read_bit().unwrap());
        assert_eq!(buf.read_bits(5).unwrap(), 15);
        assert_eq!(buf.read_bits(13).unwrap(), 1234);
        // Byte reads discard the rest of the partially consumed bit byte
        assert_eq!(buf.read_u8().unwrap(), 0xAB);
    }

    #[test]
    fn test_bits_are_msb_first() {
        let mut buf = ByteBuffer::new();
        buf.write_bit(true);
        buf.write_bit(false);
        buf.write_bit(false);
        buf.flush_bits();

        assert_eq!(buf.as_bytes(), &[0b1000_0000]);
    }

    #[test]
    fn test_flush_without_pending_bits() {
        let mut buf = ByteBuffer::new();
        buf.flush_bits();
        assert!(buf.is_empty());

        buf.write_bits(0xFF, 8);
        buf.flush_bits();
        assert_eq!(buf.as_bytes(), &[0xFF]);
    }

    #[test]
    fn test_read_bits_past_end() {
        let mut buf = ByteBuffer::from_bytes(&[0xFF]);
        assert!(buf.read_bits(8).is_ok());
        assert!(buf.read_bit().is_err());
    }

    #[test]
    fn test_skip_and_rfinish() {
        let mut buf = ByteBuffer::from_bytes(&[1, 2, 3, 4, 5]);

        buf.skip(2).unwrap();
        assert_eq!(buf.read_u8().unwrap(), 3);
        assert!(buf.skip(5).is_err());

        buf.rfinish();
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.rpos(), buf.wpos());
    }

    #[test]
    fn test_read_string_fixed_length() {
        let mut buf = ByteBuffer::from_bytes(b"DBMGuild");
        assert_eq!(buf.read_string(3).unwrap(), "DBM");
        assert_eq!(buf.read_string(5).unwrap(), "Guild");
        assert!(buf.read_string(1).is_err());
    }

    #[test]
    fn test_hexlike() {
        let buf = ByteBuffer::from_bytes(&[0x0A, 0xFF]);
        assert_eq!(buf.hexlike(), "STORAGE_SIZE: 2\n0A FF ");
    }
}
