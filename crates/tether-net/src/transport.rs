//! The send half of the transport contract.
//!
//! The replication core never owns a socket. It hands finished datagrams to
//! a [`Transport`] (one peer) or a [`PlayerTransport`] (the server's view of
//! every connected player). Receiving is the host's job: it calls the
//! engine's `receive` with each buffer it pulls off the wire.

use std::collections::BTreeMap;

use crate::packet::PlayerId;

/// Outbound channel to a single peer.
pub trait Transport {
    /// Fire-and-forget datagram; may be lost, duplicated or reordered.
    fn send_unreliable(&mut self, bytes: &[u8]);

    /// Delivered exactly once, in order relative to other reliable sends.
    fn send_reliable_ordered(&mut self, bytes: &[u8]);

    /// Largest datagram `send_unreliable` accepts.
    fn max_unreliable_packet_size(&self) -> usize;
}

/// Outbound channels to every player, keyed by player id.
pub trait PlayerTransport {
    /// Sends an unreliable datagram to `player`.
    fn send_unreliable(&mut self, player: PlayerId, bytes: &[u8]);

    /// Sends a reliable-ordered message to `player`.
    fn send_reliable_ordered(&mut self, player: PlayerId, bytes: &[u8]);

    /// Largest unreliable datagram deliverable to `player`.
    fn max_unreliable_packet_size(&self, player: PlayerId) -> usize;
}

/// Fallback packet size for players with no registered channel.
const DEFAULT_MAX_PACKET_SIZE: usize = 1200;

impl<T: Transport> PlayerTransport for BTreeMap<PlayerId, T> {
    fn send_unreliable(&mut self, player: PlayerId, bytes: &[u8]) {
        match self.get_mut(&player) {
            Some(t) => t.send_unreliable(bytes),
            None => tracing::debug!(player, "unreliable send to unknown player dropped"),
        }
    }

    fn send_reliable_ordered(&mut self, player: PlayerId, bytes: &[u8]) {
        match self.get_mut(&player) {
            Some(t) => t.send_reliable_ordered(bytes),
            None => tracing::warn!(player, "reliable send to unknown player dropped"),
        }
    }

    fn max_unreliable_packet_size(&self, player: PlayerId) -> usize {
        self.get(&player)
            .map_or(DEFAULT_MAX_PACKET_SIZE, |t| t.max_unreliable_packet_size())
    }
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

/// One datagram captured by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    /// Whether it went through the reliable-ordered path.
    pub reliable: bool,
    /// The datagram.
    pub bytes: Vec<u8>,
}

/// Transport that records every datagram in memory.
///
/// Used by loopback hosts and tests: drain the outbox and feed the buffers
/// to the other side's `receive`, optionally dropping or reordering
/// unreliable ones.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    max_packet_size: usize,
    outbox: Vec<SentPacket>,
}

impl MemoryTransport {
    /// Creates an empty transport accepting datagrams up to `max_packet_size`.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            outbox: Vec::new(),
        }
    }

    /// Datagrams sent since the last drain.
    pub fn sent(&self) -> &[SentPacket] {
        &self.outbox
    }

    /// Takes every recorded datagram, oldest first.
    pub fn drain(&mut self) -> Vec<SentPacket> {
        std::mem::take(&mut self.outbox)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Transport for MemoryTransport {
    fn send_unreliable(&mut self, bytes: &[u8]) {
        if bytes.len() > self.max_packet_size {
            tracing::warn!(
                len = bytes.len(),
                max = self.max_packet_size,
                "oversized unreliable datagram"
            );
        }
        self.outbox.push(SentPacket {
            reliable: false,
            bytes: bytes.to_vec(),
        });
    }

    fn send_reliable_ordered(&mut self, bytes: &[u8]) {
        self.outbox.push(SentPacket {
            reliable: true,
            bytes: bytes.to_vec(),
        });
    }

    fn max_unreliable_packet_size(&self) -> usize {
        self.max_packet_size
    }
}
