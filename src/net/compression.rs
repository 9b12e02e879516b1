//! Outbound packet compression
//!
//! Each session owns one deflate stream for its whole lifetime. Packets are
//! sync-flushed so the client can inflate every packet as it arrives while
//! the dictionary carries over between packets.

use flate2::{Compress, Compression, FlushCompress, Status};
use thiserror::Error;

/// Set on an opcode to mark its payload as compressed
pub use crate::protocol::opcodes::COMPRESSED_OPCODE_MASK;

/// Default zlib level for outbound packets
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;

/// Compression failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("deflate failed: {0}")]
    Deflate(String),

    #[error("deflate made no progress")]
    Stalled,
}

/// Session-scoped deflate stream
pub struct PacketCompressor {
    stream: Compress,
}

impl std::fmt::Debug for PacketCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCompressor")
            .field("total_in", &self.stream.total_in())
            .field("total_out", &self.stream.total_out())
            .finish()
    }
}

impl PacketCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            stream: Compress::new(Compression::new(level.min(9)), true),
        }
    }

    /// Deflate one packet body, flushed to a byte boundary
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);
        let start_in = self.stream.total_in();

        loop {
            let consumed = (self.stream.total_in() - start_in) as usize;
            if output.len() == output.capacity() {
                output.reserve(input.len().max(64));
            }

            let before_out = self.stream.total_out();
            let status = self
                .stream
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| CompressionError::Deflate(e.to_string()))?;

            let all_consumed = (self.stream.total_in() - start_in) as usize == input.len();
            match status {
                Status::Ok | Status::BufError => {
                    // Output space left over means the flush completed
                    if all_consumed && output.len() < output.capacity() {
                        return Ok(output);
                    }
                    if self.stream.total_out() == before_out && !all_consumed && output.len() < output.capacity() {
                        return Err(CompressionError::Stalled);
                    }
                }
                Status::StreamEnd => return Ok(output),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};

    fn inflate(stream: &mut Decompress, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4096);
        stream
            .decompress_vec(input, &mut out, FlushDecompress::Sync)
            .unwrap();
        out
    }

    #[test]
    fn test_packets_inflate_independently() {
        let mut compressor = PacketCompressor::new(DEFAULT_COMPRESSION_LEVEL);
        let mut inflater = Decompress::new(true);

        let first = b"hello world hello world hello world".to_vec();
        let second = vec![7u8; 1000];

        let c1 = compressor.compress(&first).unwrap();
        assert_eq!(inflate(&mut inflater, &c1), first);

        let c2 = compressor.compress(&second).unwrap();
        assert!(c2.len() < second.len());
        assert_eq!(inflate(&mut inflater, &c2), second);
    }

    #[test]
    fn test_sync_flush_marker() {
        let mut compressor = PacketCompressor::new(6);
        let out = compressor.compress(b"abc").unwrap();
        assert!(out.ends_with(&[0x00, 0x00, 0xFF, 0xFF]));
    }
}
