//! Per-entity remote-call queue and sync values.
//!
//! RPCs are staged when called and stamped with the tick of the next
//! capture, then kept in a FIFO until every player has acknowledged past
//! them. Payload buffers of pruned records are pooled and reused.
//!
//! Sync values are opaque snapshots of data that cannot be field-diffed
//! (strings, collections). Each update is queued as an RPC under
//! [`SYNC_RPC_ID`] so diffs deliver it, and the full set is resent in every
//! baseline.

use std::collections::{BTreeMap, VecDeque};

use tether_net::{ByteReader, ByteWriter, PlayerId, Tick, WireError, sequence_diff};

use crate::schema::{RpcTarget, SYNC_RPC_ID};

/// Wire value for "no sub-object".
pub const NO_SUB_OBJECT: u8 = 0xFF;

/// Bytes in front of every RPC payload on the wire.
pub const RPC_ENTRY_HEADER_SIZE: usize = 7;

/// One queued remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRecord {
    pub rpc_id: u16,
    /// Sub-object (or sync id) the call addresses.
    pub sub_object: Option<u8>,
    /// Tick the call was captured at.
    pub tick: Tick,
    pub target: RpcTarget,
    pub payload: Vec<u8>,
}

/// Writes one `rpc_id, sub_object, tick, len, payload` entry.
pub(crate) fn write_rpc_entry(
    w: &mut ByteWriter<'_>,
    rpc_id: u16,
    sub_object: Option<u8>,
    tick: Tick,
    payload: &[u8],
) {
    w.write_u16(rpc_id);
    w.write_u8(sub_object.unwrap_or(NO_SUB_OBJECT));
    w.write_u16(tick);
    w.write_u16(payload.len() as u16);
    w.write_bytes(payload);
}

/// An RPC entry as read back from the wire. The payload is located by
/// offset into the buffer it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RpcEntry {
    pub rpc_id: u16,
    pub sub_object: Option<u8>,
    pub tick: Tick,
    pub len: usize,
    pub offset: usize,
}

pub(crate) fn read_rpc_entry(r: &mut ByteReader<'_>, base: usize) -> Result<RpcEntry, WireError> {
    let rpc_id = r.read_u16()?;
    let sub = r.read_u8()?;
    let tick = r.read_u16()?;
    let len = usize::from(r.read_u16()?);
    let offset = base + r.position();
    r.skip(len)?;
    Ok(RpcEntry {
        rpc_id,
        sub_object: (sub != NO_SUB_OBJECT).then_some(sub),
        tick,
        len,
        offset,
    })
}

// ---------------------------------------------------------------------------
// RpcQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RpcQueue {
    records: VecDeque<RpcRecord>,
    staged: Vec<RpcRecord>,
    pool: Vec<Vec<u8>>,
}

impl RpcQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_payload(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut buf = self.pool.pop().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(bytes);
        buf
    }

    /// Stages a call; it gets a tick at the next [`flush`](Self::flush).
    pub fn stage(&mut self, rpc_id: u16, sub_object: Option<u8>, target: RpcTarget, payload: &[u8]) {
        let payload = self.alloc_payload(payload);
        self.staged.push(RpcRecord {
            rpc_id,
            sub_object,
            tick: 0,
            target,
            payload,
        });
    }

    /// Stamps every staged call with `tick` and appends it to the queue.
    pub fn flush(&mut self, tick: Tick) {
        for mut record in self.staged.drain(..) {
            record.tick = tick;
            self.records.push_back(record);
        }
    }

    /// Drops records older than `min_acked`, returning how many went.
    pub fn prune(&mut self, min_acked: Tick) -> usize {
        let mut pruned = 0;
        while self
            .records
            .front()
            .is_some_and(|r| sequence_diff(r.tick, min_acked) < 0)
        {
            if let Some(record) = self.records.pop_front() {
                self.pool.push(record.payload);
                pruned += 1;
            }
        }
        pruned
    }

    /// Records newer than `acked` that `player` may see.
    pub fn visible_since(
        &self,
        player: PlayerId,
        owner: PlayerId,
        acked: Tick,
    ) -> impl Iterator<Item = &RpcRecord> {
        self.records
            .iter()
            .filter(move |r| sequence_diff(r.tick, acked) > 0 && r.target.visible_to(player, owner))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RpcRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Payload buffers waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }
}

// ---------------------------------------------------------------------------
// SyncValues
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SyncBlock {
    tick: Tick,
    count: u16,
    bytes: Vec<u8>,
}

/// Current sync values of one entity plus the memoized baseline block.
#[derive(Debug, Default)]
pub struct SyncValues {
    values: BTreeMap<u8, Vec<u8>>,
    staged: Vec<(u8, Vec<u8>)>,
    block: Option<SyncBlock>,
}

impl SyncValues {
    pub fn stage(&mut self, sync_id: u8, bytes: &[u8]) {
        self.staged.push((sync_id, bytes.to_vec()));
    }

    /// Applies staged values and queues each as a sync RPC at `tick`.
    pub fn flush(&mut self, tick: Tick, queue: &mut RpcQueue) {
        if self.staged.is_empty() {
            return;
        }
        for (sync_id, bytes) in self.staged.drain(..) {
            queue.stage(SYNC_RPC_ID, Some(sync_id), RpcTarget::All, &bytes);
            self.values.insert(sync_id, bytes);
        }
        queue.flush(tick);
        self.block = None;
    }

    pub fn get(&self, sync_id: u8) -> Option<&[u8]> {
        self.values.get(&sync_id).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Every value encoded as sync RPC entries stamped `tick`, with the
    /// entry count. Rebuilt at most once per tick.
    pub fn block(&mut self, tick: Tick) -> (&[u8], u16) {
        let stale = self.block.as_ref().is_none_or(|b| b.tick != tick);
        if stale {
            let mut bytes = Vec::new();
            let mut w = ByteWriter::new(&mut bytes);
            for (&id, value) in &self.values {
                write_rpc_entry(&mut w, SYNC_RPC_ID, Some(id), tick, value);
            }
            self.block = Some(SyncBlock {
                tick,
                count: self.values.len() as u16,
                bytes,
            });
        }
        match &self.block {
            Some(b) => (b.bytes.as_slice(), b.count),
            None => (&[][..], 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_calls_take_flush_tick() {
        let mut q = RpcQueue::new();
        q.stage(1, None, RpcTarget::All, b"a");
        q.stage(2, Some(3), RpcTarget::Owner, b"b");
        assert!(q.is_empty());
        q.flush(40);
        let ticks: Vec<_> = q.iter().map(|r| (r.rpc_id, r.tick)).collect();
        assert_eq!(ticks, [(1, 40), (2, 40)]);
    }

    #[test]
    fn test_prune_recycles_payloads() {
        let mut q = RpcQueue::new();
        for tick in [10, 11, 12] {
            q.stage(1, None, RpcTarget::All, &[tick as u8]);
            q.flush(tick);
        }
        assert_eq!(q.prune(12), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pooled(), 2);

        // A pooled buffer is reused without leaking old contents.
        q.stage(1, None, RpcTarget::All, &[7, 7]);
        q.flush(13);
        assert_eq!(q.pooled(), 1);
        assert_eq!(q.iter().last().unwrap().payload, [7, 7]);
    }

    #[test]
    fn test_prune_across_wrap() {
        let mut q = RpcQueue::new();
        q.stage(1, None, RpcTarget::All, &[]);
        q.flush(65_534);
        q.stage(1, None, RpcTarget::All, &[]);
        q.flush(1);
        assert_eq!(q.prune(0), 1);
        assert_eq!(q.iter().next().unwrap().tick, 1);
    }

    #[test]
    fn test_visibility_and_ack_filter() {
        let mut q = RpcQueue::new();
        q.stage(1, None, RpcTarget::All, &[]);
        q.flush(5);
        q.stage(2, None, RpcTarget::Owner, &[]);
        q.stage(3, None, RpcTarget::Others, &[]);
        q.stage(4, None, RpcTarget::Player(9), &[]);
        q.flush(6);

        let ids = |player, acked| -> Vec<u16> {
            q.visible_since(player, 2, acked).map(|r| r.rpc_id).collect()
        };
        assert_eq!(ids(2, 4), [1, 2]);
        assert_eq!(ids(3, 4), [1, 3]);
        assert_eq!(ids(9, 5), [3, 4]);
    }

    #[test]
    fn test_entry_wire_layout() {
        let mut buf = Vec::new();
        write_rpc_entry(&mut ByteWriter::new(&mut buf), 0x0102, None, 0x0304, &[9, 8]);
        assert_eq!(buf, [0x02, 0x01, 0xFF, 0x04, 0x03, 2, 0, 9, 8]);

        let entry = read_rpc_entry(&mut ByteReader::new(&buf), 100).unwrap();
        assert_eq!(entry.sub_object, None);
        assert_eq!(entry.len, 2);
        assert_eq!(entry.offset, 100 + RPC_ENTRY_HEADER_SIZE);
    }

    #[test]
    fn test_sync_block_memoized_per_tick() {
        let mut queue = RpcQueue::new();
        let mut sync = SyncValues::default();
        sync.stage(1, b"name");
        sync.flush(8, &mut queue);
        assert_eq!(sync.get(1), Some(&b"name"[..]));
        assert_eq!(queue.iter().next().unwrap().rpc_id, SYNC_RPC_ID);

        let (bytes, count) = sync.block(8);
        assert_eq!(count, 1);
        let first = bytes.to_vec();
        let (again, _) = sync.block(8);
        assert_eq!(again, &first[..]);

        let (later, _) = sync.block(9);
        let entry = read_rpc_entry(&mut ByteReader::new(later), 0).unwrap();
        assert_eq!(entry.tick, 9);
        assert_eq!(entry.sub_object, Some(1));
    }
}
