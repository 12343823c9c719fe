//! One pass over a reassembled payload, indexing what apply will touch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tether_net::{ByteReader, PlayerId, Tick, WireError, sequence_greater_than};

use super::apply::ClientEntity;
use crate::entity::{EntityHeader, EntityId};
use crate::rpc::{RpcEntry, read_rpc_entry};
use crate::schema::{ClassDescriptor, SYNC_RPC_ID, SchemaRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Full(EntityHeader),
    Diff,
}

/// A field carried by a record and where its bytes start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldUpdate {
    pub field: usize,
    pub offset: usize,
}

#[derive(Debug)]
pub(crate) struct RecordIndex {
    pub id: EntityId,
    pub kind: RecordKind,
    pub class: Arc<ClassDescriptor>,
    pub fields: Vec<FieldUpdate>,
}

/// An RPC to run once every record of the payload is applied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueuedRpc {
    pub id: EntityId,
    pub entry: RpcEntry,
}

#[derive(Debug, Default)]
pub(crate) struct Preload {
    pub records: Vec<RecordIndex>,
    pub rpcs: Vec<QueuedRpc>,
}

/// Indexes every record of `bytes`.
///
/// Diff records for entities the client does not have are skipped, as are
/// full records of unknown classes. RPCs not newer than `rpc_floor` were
/// already delivered and are dropped. Structural damage fails the whole
/// payload.
pub(crate) fn preload(
    bytes: &[u8],
    registry: &SchemaRegistry,
    entities: &BTreeMap<EntityId, ClientEntity>,
    local_player: PlayerId,
    rpc_floor: Option<Tick>,
) -> Result<Preload, WireError> {
    let mut out = Preload::default();
    let mut r = ByteReader::new(bytes);

    while !r.is_empty() {
        let start = r.position();
        let word = r.read_u16()?;
        let full = word & 1 == 1;
        let size = usize::from(word >> 1);
        if size < 4 || start + size > bytes.len() {
            return Err(WireError::InvalidLength {
                length: size,
                reason: "record size outside payload",
            });
        }
        let id = EntityId(r.read_u16()?);
        let base = start + 4;
        r.skip(size - 4)?;
        let mut rec = ByteReader::new(&bytes[base..start + size]);

        let (kind, class) = if full {
            let header = EntityHeader::decode(&mut rec)?;
            let Some(class) = registry.get(header.class_id) else {
                tracing::warn!(entity = id.0, class = header.class_id, "record of unknown class skipped");
                continue;
            };
            (RecordKind::Full(header), class.clone())
        } else {
            let Some(entity) = entities.get(&id) else {
                tracing::warn!(entity = id.0, "diff for missing entity skipped");
                continue;
            };
            (RecordKind::Diff, entity.state().class().clone())
        };

        let mut fields = Vec::new();
        match kind {
            RecordKind::Full(header) if header.destroyed => {}
            RecordKind::Full(header) => {
                for (i, field) in class.fields().iter().enumerate() {
                    let offset = base + rec.position();
                    rec.skip(field.size)?;
                    if field.visible_to(local_player, header.owner) {
                        fields.push(FieldUpdate { field: i, offset });
                    }
                }
            }
            RecordKind::Diff => {
                let bitmap = rec.read_bytes(class.bitmap_bytes())?;
                for (i, field) in class.fields().iter().enumerate() {
                    if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                        fields.push(FieldUpdate {
                            field: i,
                            offset: base + rec.position(),
                        });
                        rec.skip(field.size)?;
                    }
                }
            }
        }

        let count = rec.read_u16()?;
        for _ in 0..count {
            let entry = read_rpc_entry(&mut rec, base)?;
            if rpc_floor.is_some_and(|floor| !sequence_greater_than(entry.tick, floor)) {
                continue;
            }
            let known = if entry.rpc_id == SYNC_RPC_ID {
                entry.sub_object.is_some()
            } else {
                class.rpc(entry.rpc_id).is_some()
            };
            if !known {
                tracing::warn!(entity = id.0, rpc = entry.rpc_id, class = class.name(), "unknown rpc dropped");
                continue;
            }
            out.rpcs.push(QueuedRpc { id, entry });
        }
        if !rec.is_empty() {
            return Err(WireError::InvalidLength {
                length: size,
                reason: "record size does not match its contents",
            });
        }

        out.records.push(RecordIndex {
            id,
            kind,
            class,
            fields,
        });
    }
    Ok(out)
}
