//! Packet headers shared by server and client.
//!
//! Every datagram starts with the shared [`HEADER_BYTE`] followed by a
//! [`PacketType`] byte. All multi-byte values are little-endian.
//!
//! ```text
//! Baseline   : 7E 01 | player:u8 | send_rate:u8 | tick:u16 | raw_len:i32 | lz4 block
//! Diff part  : 7E 02 | index:u8 | tick:u16 | [part 0: processed:u16 received:u16] | payload
//! Diff final : 7E 03 | index:u8 | tick:u16 | payload | processed:u16 received:u16 part_size:u16
//! Input      : 7E 04 | start_tick:u16 | { len:u16 | chunk }*
//! ```

use static_assertions::const_assert_eq;

use crate::bytes::{ByteReader, ByteWriter};
use crate::error::WireError;
use crate::sequence::Tick;

/// Player identifier on the wire. `0` is the server.
pub type PlayerId = u8;

/// Owner id used for server-owned entities.
pub const SERVER_PLAYER_ID: PlayerId = 0;

/// Leading byte left on every buffer by the outer transport framing.
pub const HEADER_BYTE: u8 = 0x7E;

/// Size of a baseline header.
pub const BASELINE_HEADER_SIZE: usize = 10;
/// Size of a diff part header (without the part-0 extension).
pub const DIFF_PART_HEADER_SIZE: usize = 5;
/// Extra bytes carried by a non-final part 0.
pub const DIFF_PART_ZERO_EXTRA: usize = 4;
/// Size of the footer appended to the final diff part.
pub const DIFF_FOOTER_SIZE: usize = 6;
/// Size of an input packet header.
pub const INPUT_PACKET_HEADER_SIZE: usize = 4;
/// Size of the header prepended to every encoded input.
pub const INPUT_RECORD_HEADER_SIZE: usize = 8;

const_assert_eq!(BASELINE_HEADER_SIZE, 1 + 1 + 1 + 1 + 2 + 4);
const_assert_eq!(DIFF_FOOTER_SIZE, 3 * 2);

/// Worst-case per-datagram overhead of a diff part.
pub const DIFF_PART_OVERHEAD: usize =
    DIFF_PART_HEADER_SIZE + DIFF_PART_ZERO_EXTRA + DIFF_FOOTER_SIZE;

// ---------------------------------------------------------------------------
// PacketType
// ---------------------------------------------------------------------------

/// Second byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Reliable full-state snapshot.
    Baseline = 1,
    /// Non-final part of a per-tick diff.
    DiffPart = 2,
    /// Terminal part of a per-tick diff, carrying the footer.
    DiffFinal = 3,
    /// Client input batch.
    Input = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Baseline),
            2 => Ok(Self::DiffPart),
            3 => Ok(Self::DiffFinal),
            4 => Ok(Self::Input),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Reads the shared header byte and the packet type.
pub fn read_packet_type(reader: &mut ByteReader<'_>) -> Result<PacketType, WireError> {
    let header = reader.read_u8()?;
    if header != HEADER_BYTE {
        return Err(WireError::BadHeader(header));
    }
    PacketType::try_from(reader.read_u8()?)
}

/// Returns the packet type of `bytes` without consuming anything.
pub fn peek_packet_type(bytes: &[u8]) -> Result<PacketType, WireError> {
    read_packet_type(&mut ByteReader::new(bytes))
}

fn expect_type(reader: &mut ByteReader<'_>, expected: PacketType) -> Result<(), WireError> {
    let found = read_packet_type(reader)?;
    if found != expected {
        return Err(WireError::UnexpectedPacketType(found));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Header of a reliable baseline packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineHeader {
    /// Player the baseline was built for.
    pub player: PlayerId,
    /// Server ticks between state sends.
    pub send_rate: u8,
    /// Server tick the baseline captures.
    pub tick: Tick,
    /// Length of the payload before compression.
    pub uncompressed_len: i32,
}

impl BaselineHeader {
    /// Writes the header, including the shared header byte and type.
    pub fn encode(&self, writer: &mut ByteWriter<'_>) {
        writer.write_u8(HEADER_BYTE);
        writer.write_u8(PacketType::Baseline as u8);
        writer.write_u8(self.player);
        writer.write_u8(self.send_rate);
        writer.write_u16(self.tick);
        writer.write_i32(self.uncompressed_len);
    }

    /// Reads a header written by [`encode`](Self::encode).
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        expect_type(reader, PacketType::Baseline)?;
        let header = Self {
            player: reader.read_u8()?,
            send_rate: reader.read_u8()?,
            tick: reader.read_u16()?,
            uncompressed_len: reader.read_i32()?,
        };
        if header.uncompressed_len < 0 {
            return Err(WireError::InvalidLength {
                length: 0,
                reason: "negative baseline length",
            });
        }
        Ok(header)
    }
}

// ---------------------------------------------------------------------------
// Diff parts
// ---------------------------------------------------------------------------

/// Fields common to every diff part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffPartHeader {
    /// Server tick the diff belongs to.
    pub tick: Tick,
    /// Zero-based index of this part.
    pub index: u8,
    /// Whether this is the terminal part.
    pub is_final: bool,
    /// Last input tick the server processed for this player.
    pub processed_input_tick: Tick,
    /// Last input tick the server received from this player.
    pub received_input_tick: Tick,
    /// Payload bytes per non-final part.
    pub part_size: u16,
}

impl DiffPartHeader {
    /// Encodes one datagram: header, `payload`, and the footer when final.
    pub fn encode(&self, payload: &[u8], out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.write_u8(HEADER_BYTE);
        w.write_u8(if self.is_final {
            PacketType::DiffFinal as u8
        } else {
            PacketType::DiffPart as u8
        });
        w.write_u8(self.index);
        w.write_u16(self.tick);
        if !self.is_final && self.index == 0 {
            w.write_u16(self.processed_input_tick);
            w.write_u16(self.received_input_tick);
        }
        w.write_bytes(payload);
        if self.is_final {
            w.write_u16(self.processed_input_tick);
            w.write_u16(self.received_input_tick);
            w.write_u16(self.part_size);
        }
    }
}

/// A decoded diff datagram borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffPart<'a> {
    /// Server tick the diff belongs to.
    pub tick: Tick,
    /// Zero-based index of this part.
    pub index: u8,
    /// Whether this is the terminal part.
    pub is_final: bool,
    /// `(processed, received)` input ticks, when this part carries them.
    pub input_ticks: Option<(Tick, Tick)>,
    /// Payload bytes per non-final part; only the final part knows it.
    pub part_size: Option<u16>,
    /// The part's slice of the logical per-tick payload.
    pub payload: &'a [u8],
}

impl<'a> DiffPart<'a> {
    /// Decodes a diff datagram (either [`PacketType::DiffPart`] or
    /// [`PacketType::DiffFinal`]).
    pub fn decode(bytes: &'a [u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(bytes);
        let kind = read_packet_type(&mut r)?;
        let is_final = match kind {
            PacketType::DiffPart => false,
            PacketType::DiffFinal => true,
            other => return Err(WireError::UnexpectedPacketType(other)),
        };
        let index = r.read_u8()?;
        let tick = r.read_u16()?;

        if !is_final {
            let input_ticks = if index == 0 {
                Some((r.read_u16()?, r.read_u16()?))
            } else {
                None
            };
            return Ok(Self {
                tick,
                index,
                is_final,
                input_ticks,
                part_size: None,
                payload: r.rest(),
            });
        }

        let rest = r.rest();
        if rest.len() < DIFF_FOOTER_SIZE {
            return Err(WireError::UnexpectedEnd {
                needed: DIFF_FOOTER_SIZE,
                remaining: rest.len(),
            });
        }
        let (payload, footer) = rest.split_at(rest.len() - DIFF_FOOTER_SIZE);
        let mut f = ByteReader::new(footer);
        let processed = f.read_u16()?;
        let received = f.read_u16()?;
        let part_size = f.read_u16()?;
        Ok(Self {
            tick,
            index,
            is_final,
            input_ticks: Some((processed, received)),
            part_size: Some(part_size),
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Header of a client input packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPacketHeader {
    /// Client tick of the first chunk; chunk `i` belongs to `start_tick + i`.
    pub start_tick: Tick,
}

impl InputPacketHeader {
    /// Writes the header, including the shared header byte and type.
    pub fn encode(&self, writer: &mut ByteWriter<'_>) {
        writer.write_u8(HEADER_BYTE);
        writer.write_u8(PacketType::Input as u8);
        writer.write_u16(self.start_tick);
    }

    /// Reads a header written by [`encode`](Self::encode).
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        expect_type(reader, PacketType::Input)?;
        Ok(Self {
            start_tick: reader.read_u16()?,
        })
    }
}

/// Header prepended to every encoded input: the two server states the
/// client was interpolating between and how far along it was.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputRecordHeader {
    /// Older bracketing server tick.
    pub state_a: Tick,
    /// Newer bracketing server tick.
    pub state_b: Tick,
    /// Interpolation fraction between the two, in `[0, 1]`.
    pub fraction: f32,
}

impl InputRecordHeader {
    /// Writes the eight header bytes.
    pub fn encode(&self, writer: &mut ByteWriter<'_>) {
        writer.write_u16(self.state_a);
        writer.write_u16(self.state_b);
        writer.write_f32(self.fraction);
    }

    /// Reads the eight header bytes.
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            state_a: reader.read_u16()?,
            state_b: reader.read_u16()?,
            fraction: reader.read_f32()?,
        })
    }
}
