//! Errors raised while decoding packets from the wire.

use crate::compression::CompressionError;

/// A received buffer could not be decoded.
///
/// Every variant is recoverable: the caller drops the packet (or the batch)
/// and carries on.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before a fixed-width value could be read.
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// The shared leading header byte did not match.
    #[error("bad header byte 0x{0:02X}")]
    BadHeader(u8),
    /// The packet type byte is not known.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    /// The packet type is valid but not the one expected here.
    #[error("unexpected packet type {0:?}")]
    UnexpectedPacketType(crate::packet::PacketType),
    /// A length field is inconsistent with the data around it.
    #[error("invalid length {length}: {reason}")]
    InvalidLength {
        /// The offending length value.
        length: usize,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// A baseline payload failed to decompress.
    #[error(transparent)]
    Compression(#[from] CompressionError),
    /// A user payload failed to (de)serialize.
    #[error("payload serialization error: {0}")]
    Payload(String),
}
