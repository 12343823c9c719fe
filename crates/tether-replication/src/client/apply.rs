//! Client entities and applying preloaded payloads to them.

use std::collections::BTreeMap;

use tether_net::PlayerId;

use super::preload::{Preload, RecordIndex, RecordKind};
use super::prediction::PredictedEntities;
use crate::entity::{EntityHeader, EntityId, EntityState};
use crate::error::FieldAccessError;
use crate::logic::{ClientCallbacks, RpcCall};
use crate::schema::SYNC_RPC_ID;

/// A replicated entity as the client sees it.
///
/// Besides the live field image it keeps the last server values of its
/// predictable fields (restored on rollback) and the two most recent
/// images of its interpolated fields.
#[derive(Debug, Clone)]
pub struct ClientEntity {
    header: EntityHeader,
    state: EntityState,
    pub(super) authoritative: Vec<u8>,
    interp_prev: Vec<u8>,
    interp_current: Vec<u8>,
    sync: BTreeMap<u8, Vec<u8>>,
}

impl ClientEntity {
    pub(crate) fn new(header: EntityHeader, state: EntityState) -> Self {
        let data = state.data().to_vec();
        Self {
            header,
            authoritative: data.clone(),
            interp_prev: data.clone(),
            interp_current: data,
            state,
            sync: BTreeMap::new(),
        }
    }

    pub fn header(&self) -> &EntityHeader {
        &self.header
    }

    pub fn state(&self) -> &EntityState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut EntityState {
        &mut self.state
    }

    /// Last value received for sync id `sync_id`.
    pub fn sync_value(&self, sync_id: u8) -> Option<&[u8]> {
        self.sync.get(&sync_id).map(Vec::as_slice)
    }

    /// Whether the local player drives this entity with its input.
    pub fn is_locally_controlled(&self, local_player: PlayerId) -> bool {
        self.state.class().flags().controlled && self.header.owner == local_player
    }

    /// Writes field `index` into `out`: blended between the previous and
    /// current images for interpolated fields, the live value otherwise.
    pub fn interpolate_field(
        &self,
        index: usize,
        fraction: f32,
        out: &mut [u8],
    ) -> Result<(), FieldAccessError> {
        let class = self.state.class();
        let field = class.field(index).ok_or(FieldAccessError::NoSuchField {
            index,
            count: class.fields().len(),
        })?;
        if out.len() != field.size {
            return Err(FieldAccessError::SizeMismatch {
                field: field.name,
                expected: field.size,
                actual: out.len(),
            });
        }
        let range = class.field_range(index);
        match field.interpolate {
            Some(interpolate) => interpolate(
                &self.interp_prev[range.clone()],
                &self.interp_current[range],
                fraction.clamp(0.0, 1.0),
                out,
            ),
            None => out.copy_from_slice(&self.state.data()[range]),
        }
        Ok(())
    }

    /// Starts a new interpolation step: the current image becomes the
    /// previous one.
    pub(crate) fn shift_interpolation(&mut self) {
        self.interp_prev.copy_from_slice(&self.interp_current);
    }

    /// Copies the live interpolated fields into the current image.
    pub(crate) fn capture_interpolation(&mut self) {
        let class = self.state.class().clone();
        for (i, field) in class.fields().iter().enumerate() {
            if field.flags.interpolated {
                let range = class.field_range(i);
                self.interp_current[range.clone()].copy_from_slice(&self.state.data()[range]);
            }
        }
    }

    /// Puts the last server values back into the predictable fields.
    pub(crate) fn restore_predicted(&mut self, locally_controlled: bool) {
        let class = self.state.class().clone();
        for (i, field) in class.fields().iter().enumerate() {
            if field.is_predictable(locally_controlled) {
                let range = class.field_range(i);
                self.state.data_mut()[range.clone()].copy_from_slice(&self.authoritative[range]);
            }
        }
    }
}

fn apply_fields(
    id: EntityId,
    entity: &mut ClientEntity,
    record: &RecordIndex,
    bytes: &[u8],
    local_player: PlayerId,
    callbacks: &mut impl ClientCallbacks,
) {
    let class = &record.class;
    let local = entity.is_locally_controlled(local_player);
    let mut changed = Vec::new();
    for update in &record.fields {
        let field = &class.fields()[update.field];
        let range = class.field_range(update.field);
        let incoming = &bytes[update.offset..update.offset + field.size];

        if field.is_predictable(local) {
            entity.authoritative[range.clone()].copy_from_slice(incoming);
        }
        if field.flags.interpolated && !local {
            entity.interp_current[range.clone()].copy_from_slice(incoming);
        }
        if local && field.flags.never_rolled_back {
            continue;
        }
        let live = &mut entity.state.data_mut()[range];
        if *live != *incoming {
            if field.flags.notify_on_change {
                changed.push((update.field, live.to_vec()));
            }
            live.copy_from_slice(incoming);
        }
    }
    // Siblings are all written before anyone is told.
    for (field, old) in changed {
        callbacks.on_field_changed(id, &entity.state, field, &old);
    }
}

/// Applies every record of a preloaded payload, then runs its RPCs.
pub(crate) fn apply(
    bytes: &[u8],
    preload: &Preload,
    entities: &mut BTreeMap<EntityId, ClientEntity>,
    predicted: &mut PredictedEntities,
    local_player: PlayerId,
    callbacks: &mut impl ClientCallbacks,
) {
    for entity in entities.values_mut() {
        if !entity.is_locally_controlled(local_player) {
            entity.shift_interpolation();
        }
    }

    let mut constructed = Vec::new();
    for record in &preload.records {
        let id = record.id;
        match record.kind {
            RecordKind::Full(header) if header.destroyed => {
                if let Some(old) = entities.remove(&id) {
                    tracing::trace!(entity = id.0, "entity destroyed");
                    callbacks.on_destroyed(id, &old.state);
                }
            }
            RecordKind::Full(header) => {
                let replace = entities.get(&id).is_none_or(|e| {
                    e.header.version != header.version || e.header.class_id != header.class_id
                });
                if !replace {
                    if let Some(entity) = entities.get_mut(&id) {
                        entity.header = header;
                        apply_fields(id, entity, record, bytes, local_player, callbacks);
                    }
                    continue;
                }
                if let Some(old) = entities.remove(&id) {
                    callbacks.on_destroyed(id, &old.state);
                }
                let mut state = EntityState::new(record.class.clone());
                for update in &record.fields {
                    let size = record.class.fields()[update.field].size;
                    let range = record.class.field_range(update.field);
                    state.data_mut()[range]
                        .copy_from_slice(&bytes[update.offset..update.offset + size]);
                }
                entities.insert(id, ClientEntity::new(header, state));
                tracing::trace!(entity = id.0, class = record.class.name(), "entity constructed");
                constructed.push(id);
            }
            RecordKind::Diff => {
                if let Some(entity) = entities.get_mut(&id) {
                    apply_fields(id, entity, record, bytes, local_player, callbacks);
                }
            }
        }
    }

    // Constructed callbacks see the whole payload applied.
    for id in constructed {
        let Some(entity) = entities.get(&id) else {
            continue;
        };
        callbacks.on_constructed(id, &entity.state);
        let header = entity.header;
        if header.owner == local_player
            && let Some(confirmed) = predicted.confirm(header.class_id, header.creation_tick)
        {
            tracing::debug!(entity = id.0, local_id = confirmed.local_id(), "predicted entity confirmed");
            callbacks.on_predicted_destroyed(confirmed.local_id(), Some(id));
        }
    }

    for queued in &preload.rpcs {
        let Some(entity) = entities.get_mut(&queued.id) else {
            continue;
        };
        let entry = queued.entry;
        let payload = &bytes[entry.offset..entry.offset + entry.len];
        if entry.rpc_id == SYNC_RPC_ID {
            if let Some(sync_id) = entry.sub_object {
                entity.sync.insert(sync_id, payload.to_vec());
                callbacks.on_sync_value(queued.id, sync_id, payload);
            }
        } else {
            callbacks.on_rpc(
                queued.id,
                &entity.state,
                RpcCall {
                    rpc_id: entry.rpc_id,
                    sub_object: entry.sub_object,
                    tick: entry.tick,
                    payload,
                },
            );
        }
    }
}
