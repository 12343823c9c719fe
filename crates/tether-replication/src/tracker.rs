//! Server-side change tracking and record serialization.
//!
//! Each entity owns an [`EntityTracker`]: a shadow copy of its header and
//! field image as last captured, the tick each field last changed, and its
//! RPC queue. Once per update the server [`capture`](EntityTracker::capture)s
//! live state into the shadow. Records are written from the shadow, so every
//! player sees the same state for a given tick.
//!
//! Record layout:
//!
//! ```text
//! u16 (full | size << 1) | u16 entity id
//! full: header (7) + field image   diff: bitmap (1 bit/field) + changed fields
//! u16 rpc count | { rpc_id:u16 sub:u8 tick:u16 len:u16 payload }*
//! ```

use tether_net::{ByteWriter, PlayerId, Tick, sequence_diff};

use crate::entity::{EntityHeader, EntityId};
use crate::rpc::{RPC_ENTRY_HEADER_SIZE, RpcQueue, SyncValues, write_rpc_entry};
use crate::schema::{ClassDescriptor, MAX_RECORD_SIZE, SYNC_RPC_ID};

/// What a player is known to have, as seen by the record writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerView {
    pub player: PlayerId,
    /// Newest tick the player has acknowledged. Fields and RPCs newer than
    /// this are sent.
    pub acked: Tick,
    /// Write full records regardless of `acked` (baselines).
    pub force_full: bool,
}

/// Result of writing one entity's record for one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Written,
    /// Nothing changed since the player's acknowledgement; no bytes written.
    NoChange,
    /// The entity is not visible to the player; no bytes written.
    Skipped,
    /// A diff record would overflow its size field; no bytes written and
    /// the player needs a baseline. Full records never report this: RPC
    /// entries that do not fit are left out instead.
    TooLarge,
}

#[derive(Debug)]
pub struct EntityTracker {
    header: EntityHeader,
    shadow: Vec<u8>,
    field_ticks: Vec<Tick>,
    version_tick: Tick,
    captured: bool,
    pending_destroy: bool,
    destroy_tick: Option<Tick>,
    rpcs: RpcQueue,
    sync: SyncValues,
}

impl EntityTracker {
    pub fn new(header: EntityHeader, class: &ClassDescriptor) -> Self {
        Self {
            header,
            shadow: vec![0; class.data_size()],
            field_ticks: vec![0; class.fields().len()],
            version_tick: 0,
            captured: false,
            pending_destroy: false,
            destroy_tick: None,
            rpcs: RpcQueue::new(),
            sync: SyncValues::default(),
        }
    }

    pub fn header(&self) -> &EntityHeader {
        &self.header
    }

    /// Whether the entity has been captured at least once.
    pub fn is_captured(&self) -> bool {
        self.captured
    }

    pub fn version_tick(&self) -> Tick {
        self.version_tick
    }

    pub fn field_tick(&self, index: usize) -> Option<Tick> {
        self.field_ticks.get(index).copied()
    }

    pub fn destroy_tick(&self) -> Option<Tick> {
        self.destroy_tick
    }

    pub fn rpcs(&self) -> &RpcQueue {
        &self.rpcs
    }

    pub fn rpcs_mut(&mut self) -> &mut RpcQueue {
        &mut self.rpcs
    }

    pub fn sync_mut(&mut self) -> &mut SyncValues {
        &mut self.sync
    }

    /// Stages destruction; the next capture stamps the destroy tick.
    pub fn mark_destroyed(&mut self) {
        self.pending_destroy = true;
    }

    /// True once every player has acknowledged the destruction.
    pub fn is_drained(&self, min_acked: Tick) -> bool {
        self.destroy_tick
            .is_some_and(|t| sequence_diff(min_acked, t) >= 0)
    }

    /// Copies live state into the shadow and timestamps what changed.
    ///
    /// `data` is `None` once the entity's live state is gone. Staged RPCs and
    /// sync values are stamped with `tick`; RPCs older than `min_acked` are
    /// pruned and stale ticks are clamped forward to it.
    pub fn capture(
        &mut self,
        class: &ClassDescriptor,
        tick: Tick,
        data: Option<&[u8]>,
        min_acked: Tick,
    ) {
        if !self.captured {
            self.captured = true;
            self.version_tick = tick;
            self.field_ticks.fill(tick);
            if let Some(data) = data {
                self.shadow.copy_from_slice(data);
            }
        } else if let Some(data) = data {
            for (i, field_tick) in self.field_ticks.iter_mut().enumerate() {
                let range = class.field_range(i);
                if self.shadow[range.clone()] != data[range.clone()] {
                    self.shadow[range.clone()].copy_from_slice(&data[range]);
                    *field_tick = tick;
                }
            }
        }

        if self.pending_destroy && self.destroy_tick.is_none() {
            self.destroy_tick = Some(tick);
            self.header.destroyed = true;
        }

        self.rpcs.flush(tick);
        self.sync.flush(tick, &mut self.rpcs);
        self.rpcs.prune(min_acked);
        self.clamp(min_acked);
    }

    /// Moves ticks older than `min_acked` up to it, so they never look newer
    /// than an acknowledgement after the counter wraps.
    fn clamp(&mut self, min_acked: Tick) {
        for t in self.field_ticks.iter_mut() {
            if sequence_diff(*t, min_acked) < 0 {
                *t = min_acked;
            }
        }
        if sequence_diff(self.version_tick, min_acked) < 0 {
            self.version_tick = min_acked;
        }
    }

    /// Appends this entity's record for `view` to `w`.
    ///
    /// Any outcome other than [`RecordOutcome::Written`] leaves `w` exactly
    /// as it was.
    pub fn write_record(
        &mut self,
        w: &mut ByteWriter<'_>,
        id: EntityId,
        class: &ClassDescriptor,
        view: &PlayerView,
        tick: Tick,
    ) -> RecordOutcome {
        if !self.captured {
            return RecordOutcome::Skipped;
        }
        let owner = self.header.owner;
        if class.flags().owner_only && view.player != owner {
            return RecordOutcome::Skipped;
        }
        let start = w.position();
        let unseen = sequence_diff(self.version_tick, view.acked) > 0;

        if let Some(destroyed_at) = self.destroy_tick {
            // Baselines omit it; players that never saw it or already
            // acknowledged its destruction need nothing.
            if view.force_full || unseen || sequence_diff(destroyed_at, view.acked) <= 0 {
                return RecordOutcome::Skipped;
            }
            let size_at = w.reserve_u16();
            w.write_u16(id.0);
            self.header.encode(w);
            w.write_u16(0);
            let size = w.position() - start;
            w.patch_u16(size_at, ((size as u16) << 1) | 1);
            return RecordOutcome::Written;
        }

        let full = view.force_full || unseen;
        let size_at = w.reserve_u16();
        w.write_u16(id.0);

        let mut changed = false;
        if full {
            self.header.encode(w);
            for (i, field) in class.fields().iter().enumerate() {
                if field.visible_to(view.player, owner) {
                    w.write_bytes(&self.shadow[class.field_range(i)]);
                } else {
                    w.write_zeros(field.size);
                }
            }
        } else {
            let bitmap_at = w.position();
            w.write_zeros(class.bitmap_bytes());
            for (i, field) in class.fields().iter().enumerate() {
                if field.visible_to(view.player, owner)
                    && sequence_diff(self.field_ticks[i], view.acked) > 0
                {
                    w.written_mut(bitmap_at)[i / 8] |= 1 << (i % 8);
                    w.write_bytes(&self.shadow[class.field_range(i)]);
                    changed = true;
                }
            }
        }

        let count_at = w.reserve_u16();
        let mut count: usize = 0;
        // Full records always go out; entries that would overflow are cut.
        let mut cut = 0usize;
        if full {
            let (block, n) = self.sync.block(tick);
            if w.position() - start + block.len() <= MAX_RECORD_SIZE {
                w.write_bytes(block);
                count += usize::from(n);
            } else {
                cut += usize::from(n);
            }
        }
        for rpc in self.rpcs.visible_since(view.player, owner, view.acked) {
            if full && rpc.rpc_id == SYNC_RPC_ID {
                continue;
            }
            let entry = RPC_ENTRY_HEADER_SIZE + rpc.payload.len();
            if full
                && (w.position() - start + entry > MAX_RECORD_SIZE || count == usize::from(u16::MAX))
            {
                cut += 1;
                continue;
            }
            write_rpc_entry(w, rpc.rpc_id, rpc.sub_object, rpc.tick, &rpc.payload);
            count += 1;
        }
        if cut > 0 {
            tracing::warn!(
                player = view.player,
                entity = id.0,
                cut,
                "rpc entries do not fit the full record, dropped"
            );
        }

        if !full && !changed && count == 0 {
            w.rollback(start);
            return RecordOutcome::NoChange;
        }
        let size = w.position() - start;
        if size > MAX_RECORD_SIZE || count > usize::from(u16::MAX) {
            w.rollback(start);
            return RecordOutcome::TooLarge;
        }
        w.patch_u16(count_at, count as u16);
        w.patch_u16(size_at, ((size as u16) << 1) | u16::from(full));
        RecordOutcome::Written
    }
}

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
