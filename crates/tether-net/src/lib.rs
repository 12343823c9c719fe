//! Wire-level building blocks for tick-synchronized replication: wrapping
//! tick arithmetic, bounds-checked byte buffers, packet headers, the input
//! delta compressor, baseline block compression and the transport contract.

pub mod bytes;
pub mod compression;
pub mod delta;
pub mod error;
pub mod packet;
pub mod payload;
pub mod sequence;
pub mod transport;

pub use bytes::{ByteReader, ByteWriter};
pub use compression::{CompressionError, compress_block, decompress_block};
pub use delta::DeltaCompressor;
pub use error::WireError;
pub use packet::{
    BaselineHeader, DiffPart, DiffPartHeader, HEADER_BYTE, InputPacketHeader, InputRecordHeader,
    PacketType, PlayerId, SERVER_PLAYER_ID, peek_packet_type,
};
pub use sequence::{Tick, lerp_sequence, sequence_diff, sequence_greater_than, sequence_less_than};
pub use transport::{MemoryTransport, PlayerTransport, SentPacket, Transport};
