//! Per-player server state: acknowledgement, lifecycle and input queue.

use std::collections::VecDeque;

use tether_net::packet::{INPUT_RECORD_HEADER_SIZE, InputRecordHeader};
use tether_net::{
    ByteReader, DeltaCompressor, InputPacketHeader, PlayerId, Tick, WireError,
    sequence_greater_than, sequence_less_than,
};

use crate::lag_compensation::LagWindow;

/// Where a player is in the baseline/diff lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Needs a reliable baseline at the next send.
    RequestBaseline,
    /// A baseline went out; diffs are relative to it until the client's
    /// inputs acknowledge it.
    WaitingForFirstInput { baseline_tick: Tick },
    /// Diffs are relative to the player's reported acknowledgement.
    Active,
}

/// One decoded input waiting to be simulated.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueuedInput {
    pub tick: Tick,
    pub header: InputRecordHeader,
    pub input: Vec<u8>,
}

/// Decodes an input packet into one entry per chunk.
///
/// Chunk `i` belongs to `start_tick + i`. The first chunk is a full record;
/// later ones are delta-encoded against their predecessor when `delta` is
/// set. Any inconsistency fails the whole batch.
pub(crate) fn parse_input_batch(
    bytes: &[u8],
    input_size: usize,
    delta: bool,
) -> Result<Vec<QueuedInput>, WireError> {
    let record_size = INPUT_RECORD_HEADER_SIZE + input_size;
    let mut r = ByteReader::new(bytes);
    let header = InputPacketHeader::decode(&mut r)?;
    let mut codec = DeltaCompressor::new(record_size);
    let mut batch = Vec::new();

    while !r.is_empty() {
        let len = usize::from(r.read_u16()?);
        let chunk = r.read_bytes(len)?;
        if batch.is_empty() || !delta {
            if chunk.len() != record_size {
                return Err(WireError::InvalidLength {
                    length: chunk.len(),
                    reason: "full input record has the wrong size",
                });
            }
            codec.prime(chunk);
        } else if codec.decode(chunk)? != chunk.len() {
            return Err(WireError::InvalidLength {
                length: chunk.len(),
                reason: "trailing bytes after delta input",
            });
        }

        let record = codec.last_full();
        let mut rr = ByteReader::new(record);
        let record_header = InputRecordHeader::decode(&mut rr)?;
        if !record_header.fraction.is_finite() {
            return Err(WireError::InvalidLength {
                length: record.len(),
                reason: "non-finite interpolation fraction",
            });
        }
        let offset = batch.len() as u16;
        batch.push(QueuedInput {
            tick: header.start_tick.wrapping_add(offset),
            header: record_header,
            input: rr.rest().to_vec(),
        });
        if batch.len() > usize::from(u16::MAX) {
            return Err(WireError::InvalidLength {
                length: batch.len(),
                reason: "too many input chunks",
            });
        }
    }
    if batch.is_empty() {
        return Err(WireError::InvalidLength {
            length: 0,
            reason: "input packet without chunks",
        });
    }
    Ok(batch)
}

/// Server-side view of one connected player.
#[derive(Debug)]
pub struct PlayerSession {
    player: PlayerId,
    state: SessionState,
    acked: Option<(Tick, Tick, f32)>,
    processed_input_tick: Option<Tick>,
    received_input_tick: Option<Tick>,
    last_baseline_tick: Option<Tick>,
    inputs: VecDeque<QueuedInput>,
    input_capacity: usize,
    lag_window: Option<LagWindow>,
}

impl PlayerSession {
    pub(crate) fn new(player: PlayerId, input_capacity: usize) -> Self {
        Self {
            player,
            state: SessionState::RequestBaseline,
            acked: None,
            processed_input_tick: None,
            received_input_tick: None,
            last_baseline_tick: None,
            inputs: VecDeque::with_capacity(input_capacity),
            input_capacity: input_capacity.max(1),
            lag_window: None,
        }
    }

    pub fn player(&self) -> PlayerId {
        self.player
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// The two bracketing server ticks from the newest input, if any.
    pub fn reported_states(&self) -> Option<(Tick, Tick)> {
        self.acked.map(|(a, b, _)| (a, b))
    }

    /// Tick that diffs for this player are built against, if any.
    pub fn diff_base(&self) -> Option<Tick> {
        match self.state {
            SessionState::RequestBaseline => None,
            SessionState::WaitingForFirstInput { baseline_tick } => Some(baseline_tick),
            SessionState::Active => self.acked.map(|(_, b, _)| b),
        }
    }

    /// Oldest tick this player may still need; feeds the global minimum.
    pub fn retention_floor(&self) -> Option<Tick> {
        match self.state {
            SessionState::RequestBaseline => None,
            SessionState::WaitingForFirstInput { baseline_tick } => Some(baseline_tick),
            SessionState::Active => self.acked.map(|(a, _, _)| a),
        }
    }

    /// RPCs newer than this go into a baseline for the player.
    pub(crate) fn baseline_rpc_floor(&self, now: Tick) -> Tick {
        match self.acked {
            Some((_, b, _)) if sequence_less_than(b, now) => b,
            _ => now.wrapping_sub(1),
        }
    }

    pub fn processed_input_tick(&self) -> Option<Tick> {
        self.processed_input_tick
    }

    pub fn received_input_tick(&self) -> Option<Tick> {
        self.received_input_tick
    }

    pub fn last_baseline_tick(&self) -> Option<Tick> {
        self.last_baseline_tick
    }

    pub(crate) fn baseline_sent(&mut self, tick: Tick) {
        self.state = SessionState::WaitingForFirstInput {
            baseline_tick: tick,
        };
        self.last_baseline_tick = Some(tick);
    }

    pub fn queued_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Interpolation window of the input most recently simulated, falling
    /// back to the newest acknowledgement.
    pub fn lag_window(&self) -> Option<LagWindow> {
        self.lag_window.or_else(|| {
            self.acked.map(|(state_a, state_b, fraction)| LagWindow {
                state_a,
                state_b,
                fraction,
            })
        })
    }

    /// Queues the inputs of `batch` not seen before and updates the
    /// acknowledgement. Returns how many were accepted.
    pub(crate) fn enqueue(&mut self, batch: Vec<QueuedInput>) -> usize {
        let mut accepted = 0;
        for input in batch {
            let newer = self
                .received_input_tick
                .is_none_or(|last| sequence_greater_than(input.tick, last));
            if !newer {
                continue;
            }
            let h = input.header;
            let ack_newer = self
                .acked
                .is_none_or(|(_, b, _)| !sequence_less_than(h.state_b, b));
            if ack_newer {
                self.acked = Some((h.state_a, h.state_b, h.fraction));
            }
            if self.inputs.len() >= self.input_capacity {
                self.inputs.pop_front();
                tracing::warn!(player = self.player, "input queue full, dropping oldest input");
            }
            self.received_input_tick = Some(input.tick);
            self.inputs.push_back(input);
            accepted += 1;
        }

        if let SessionState::WaitingForFirstInput { baseline_tick } = self.state
            && let Some((_, b, _)) = self.acked
            && !sequence_less_than(b, baseline_tick)
        {
            tracing::debug!(player = self.player, baseline_tick, "baseline acknowledged");
            self.state = SessionState::Active;
        }
        accepted
    }

    /// Pops the next input to simulate.
    pub(crate) fn next_input(&mut self) -> Option<QueuedInput> {
        let input = self.inputs.pop_front()?;
        self.processed_input_tick = Some(input.tick);
        self.lag_window = Some(LagWindow {
            state_a: input.header.state_a,
            state_b: input.header.state_b,
            fraction: input.header.fraction,
        });
        Some(input)
    }
}
