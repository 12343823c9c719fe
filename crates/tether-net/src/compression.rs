//! LZ4 block compression for baseline payloads.
//!
//! Baselines carry their uncompressed length in the packet header, so the
//! block is stored without a size prefix and decompressed into a buffer of
//! exactly that length.

use lz4_flex::block::{compress, decompress};

/// Compress a baseline payload into a raw LZ4 block.
pub fn compress_block(data: &[u8]) -> Vec<u8> {
    compress(data)
}

/// Decompress a raw LZ4 block whose original size is `uncompressed_len`.
///
/// Fails if the block is malformed or does not expand to exactly
/// `uncompressed_len` bytes.
pub fn decompress_block(data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>, CompressionError> {
    if uncompressed_len == 0 {
        return if data.is_empty() || decompress(data, 0).is_ok_and(|v| v.is_empty()) {
            Ok(Vec::new())
        } else {
            Err(CompressionError::LengthMismatch {
                expected: 0,
                actual: data.len(),
            })
        };
    }
    let out = decompress(data, uncompressed_len)
        .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
    if out.len() != uncompressed_len {
        return Err(CompressionError::LengthMismatch {
            expected: uncompressed_len,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Errors that can occur during block decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// The block expanded to a different size than the header announced.
    #[error("decompressed {actual} bytes, header announced {expected}")]
    LengthMismatch {
        /// Length from the packet header.
        expected: usize,
        /// Length actually produced.
        actual: usize,
    },
}
