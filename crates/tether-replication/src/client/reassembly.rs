//! Reassembly of per-tick diffs split across unreliable parts.
//!
//! Parts are stored at `index * part_size` in a slot of the state ring
//! chosen by the diff's tick. Only the final part knows how many parts
//! there are; the part size is fixed by whichever part arrives first (a
//! non-final part's length, or the final part's footer). A part that
//! contradicts what the slot already holds, or that belongs to a different
//! tick, resets the slot before it is stored.

use tether_net::{DiffPart, Tick};

use super::preload::Preload;

/// Lifecycle of a ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Empty,
    Partial,
    Ready,
    Preloaded,
    Executed,
}

/// What [`StateRing::insert`] did with a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    /// Stored; more parts are missing.
    Stored,
    /// The part completed the slot.
    Completed,
    /// Already received, or the slot is past reassembly.
    Duplicate,
}

/// Reassembly state for one tick.
#[derive(Debug)]
pub(crate) struct StateSlot {
    tick: Tick,
    status: SlotStatus,
    received: [u64; 4],
    count: u16,
    total: Option<u16>,
    part_size: usize,
    final_len: usize,
    input_ticks: Option<(Tick, Tick)>,
    bytes: Vec<u8>,
    pub(crate) preload: Option<Preload>,
}

impl StateSlot {
    fn new() -> Self {
        Self {
            tick: 0,
            status: SlotStatus::Empty,
            received: [0; 4],
            count: 0,
            total: None,
            part_size: 0,
            final_len: 0,
            input_ticks: None,
            bytes: Vec::new(),
            preload: None,
        }
    }

    fn reset(&mut self, tick: Tick) {
        self.tick = tick;
        self.status = SlotStatus::Empty;
        self.received = [0; 4];
        self.count = 0;
        self.total = None;
        self.part_size = 0;
        self.final_len = 0;
        self.input_ticks = None;
        self.bytes.clear();
        self.preload = None;
    }

    pub(crate) fn tick(&self) -> Tick {
        self.tick
    }

    pub(crate) fn status(&self) -> SlotStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: SlotStatus) {
        self.status = status;
    }

    /// `(processed, received)` input ticks echoed by the server.
    pub(crate) fn input_ticks(&self) -> Option<(Tick, Tick)> {
        self.input_ticks
    }

    /// The reassembled payload; complete once the slot is ready.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn has(&self, index: u8) -> bool {
        self.received[usize::from(index / 64)] & (1 << (index % 64)) != 0
    }

    fn mark(&mut self, index: u8) {
        self.received[usize::from(index / 64)] |= 1 << (index % 64);
        self.count += 1;
    }

    /// Whether `part` agrees with what the slot already knows.
    fn consistent(&self, part: &DiffPart<'_>) -> bool {
        if self.count == 0 {
            return true;
        }
        let len = part.payload.len();
        if part.is_final {
            let footer = part.part_size.map(usize::from);
            footer == Some(self.part_size)
                && len <= self.part_size
                && self.total.is_none()
                && self.highest_index().is_none_or(|i| i < part.index)
        } else {
            len == self.part_size && self.total.is_none_or(|t| u16::from(part.index) + 1 < t)
        }
    }

    fn highest_index(&self) -> Option<u8> {
        (0..=u8::MAX).rev().find(|&i| self.has(i))
    }

    /// First-part bookkeeping: the part size is taken from this part.
    fn begin(&mut self, part: &DiffPart<'_>) -> bool {
        let size = if part.is_final {
            part.part_size.map_or(0, usize::from)
        } else {
            part.payload.len()
        };
        if size == 0 && !(part.is_final && part.index == 0) {
            return false;
        }
        if part.is_final && part.payload.len() > size && part.index > 0 {
            return false;
        }
        self.part_size = size;
        self.status = SlotStatus::Partial;
        true
    }

    fn store(&mut self, part: &DiffPart<'_>) {
        let offset = usize::from(part.index) * self.part_size;
        let end = offset + part.payload.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[offset..end].copy_from_slice(part.payload);
        if part.is_final {
            self.total = Some(u16::from(part.index) + 1);
            self.final_len = part.payload.len();
        }
        if let Some(ticks) = part.input_ticks
            && (part.is_final || self.input_ticks.is_none())
        {
            self.input_ticks = Some(ticks);
        }
        self.mark(part.index);

        if let Some(total) = self.total
            && self.count == total
        {
            let len = usize::from(total - 1) * self.part_size + self.final_len;
            self.bytes.truncate(len);
            self.status = SlotStatus::Ready;
        }
    }
}

// ---------------------------------------------------------------------------
// StateRing
// ---------------------------------------------------------------------------

/// Slots for received diffs, indexed by `tick & (size - 1)`.
#[derive(Debug)]
pub(crate) struct StateRing {
    slots: Vec<StateSlot>,
    mask: usize,
}

impl StateRing {
    /// A ring of `size` slots, rounded up to a power of two.
    pub(crate) fn new(size: u16) -> Self {
        let size = usize::from(size.max(2)).next_power_of_two();
        Self {
            slots: (0..size).map(|_| StateSlot::new()).collect(),
            mask: size - 1,
        }
    }

    fn index(&self, tick: Tick) -> usize {
        usize::from(tick) & self.mask
    }

    /// Stores one part in the slot for its tick.
    pub(crate) fn insert(&mut self, part: &DiffPart<'_>) -> PartOutcome {
        let i = self.index(part.tick);
        let slot = &mut self.slots[i];

        if slot.tick != part.tick || slot.status == SlotStatus::Empty {
            slot.reset(part.tick);
        } else if slot.status != SlotStatus::Partial {
            return PartOutcome::Duplicate;
        } else if slot.has(part.index) {
            return PartOutcome::Duplicate;
        } else if !slot.consistent(part) {
            tracing::debug!(tick = part.tick, index = part.index, "inconsistent diff part, slot reset");
            slot.reset(part.tick);
        }

        if slot.count == 0 && !slot.begin(part) {
            tracing::debug!(tick = part.tick, index = part.index, "unusable first diff part dropped");
            slot.reset(part.tick);
            return PartOutcome::Duplicate;
        }
        slot.store(part);
        if slot.status == SlotStatus::Ready {
            PartOutcome::Completed
        } else {
            PartOutcome::Stored
        }
    }

    pub(crate) fn get(&self, tick: Tick) -> Option<&StateSlot> {
        let slot = &self.slots[self.index(tick)];
        (slot.tick == tick && slot.status != SlotStatus::Empty).then_some(slot)
    }

    pub(crate) fn get_mut(&mut self, tick: Tick) -> Option<&mut StateSlot> {
        let i = self.index(tick);
        let slot = &mut self.slots[i];
        (slot.tick == tick && slot.status != SlotStatus::Empty).then_some(slot)
    }

    /// Ticks of complete, not yet executed slots newer than `applied`,
    /// oldest first.
    pub(crate) fn ready_after(&self, applied: Tick) -> Vec<Tick> {
        let mut ticks: Vec<Tick> = self
            .slots
            .iter()
            .filter(|s| matches!(s.status, SlotStatus::Ready | SlotStatus::Preloaded))
            .map(StateSlot::tick)
            .filter(|&t| tether_net::sequence_greater_than(t, applied))
            .collect();
        ticks.sort_by(|&a, &b| tether_net::sequence_diff(a, b).cmp(&0));
        ticks
    }

    /// Empties every slot.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.reset(0);
        }
    }
}
