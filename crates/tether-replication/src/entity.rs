//! Entity identity, wire header and field storage.

use std::collections::VecDeque;
use std::sync::Arc;

use bytemuck::Pod;
use tether_net::{ByteReader, ByteWriter, PlayerId, Tick, WireError};

use crate::error::FieldAccessError;
use crate::schema::{ClassDescriptor, ClassId};

/// Size of an encoded [`EntityHeader`].
pub const ENTITY_HEADER_SIZE: usize = 7;

/// Network identifier of a replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u16);

// ---------------------------------------------------------------------------
// EntityHeader
// ---------------------------------------------------------------------------

/// Identity and lifecycle data sent in front of every full record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityHeader {
    /// Bumped every time the id is reused.
    pub version: u8,
    /// Registered class.
    pub class_id: ClassId,
    /// Owning player, or `SERVER_PLAYER_ID`.
    pub owner: PlayerId,
    /// Tick the entity was created at. For entities spawned while the server
    /// processed a player's input, this is that input's tick.
    pub creation_tick: Tick,
    /// The entity has been destroyed and is draining.
    pub destroyed: bool,
}

impl EntityHeader {
    pub fn encode(&self, w: &mut ByteWriter<'_>) {
        w.write_u8(self.version);
        w.write_u16(self.class_id);
        w.write_u8(self.owner);
        w.write_u16(self.creation_tick);
        w.write_u8(u8::from(self.destroyed));
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: r.read_u8()?,
            class_id: r.read_u16()?,
            owner: r.read_u8()?,
            creation_tick: r.read_u16()?,
            destroyed: r.read_u8()? != 0,
        })
    }
}

// ---------------------------------------------------------------------------
// EntityState
// ---------------------------------------------------------------------------

/// The field image of one entity, laid out by its class.
#[derive(Debug, Clone)]
pub struct EntityState {
    class: Arc<ClassDescriptor>,
    data: Vec<u8>,
}

impl EntityState {
    /// A zeroed entity of `class`.
    pub fn new(class: Arc<ClassDescriptor>) -> Self {
        let data = vec![0; class.data_size()];
        Self { class, data }
    }

    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    /// The whole field image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Raw bytes of field `index`.
    pub fn field(&self, index: usize) -> Option<&[u8]> {
        (index < self.class.fields().len()).then(|| &self.data[self.class.field_range(index)])
    }

    /// Mutable raw bytes of field `index`.
    pub fn field_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        if index >= self.class.fields().len() {
            return None;
        }
        let range = self.class.field_range(index);
        Some(&mut self.data[range])
    }

    fn checked_range<T: Pod>(&self, index: usize) -> Result<std::ops::Range<usize>, FieldAccessError> {
        let field = self
            .class
            .field(index)
            .ok_or(FieldAccessError::NoSuchField {
                index,
                count: self.class.fields().len(),
            })?;
        if field.size != size_of::<T>() {
            return Err(FieldAccessError::SizeMismatch {
                field: field.name,
                expected: field.size,
                actual: size_of::<T>(),
            });
        }
        Ok(self.class.field_range(index))
    }

    /// Reads field `index` as a `T` of the same size.
    pub fn read<T: Pod>(&self, index: usize) -> Result<T, FieldAccessError> {
        let range = self.checked_range::<T>(index)?;
        Ok(bytemuck::pod_read_unaligned(&self.data[range]))
    }

    /// Writes `value` into field `index`.
    pub fn write<T: Pod>(&mut self, index: usize, value: T) -> Result<(), FieldAccessError> {
        let range = self.checked_range::<T>(index)?;
        self.data[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EntityIdAllocator
// ---------------------------------------------------------------------------

/// Hands out entity ids from a FIFO free list and tracks each id's version.
///
/// Released ids go to the back of the queue, so a recycled id is reused as
/// late as possible.
#[derive(Debug)]
pub struct EntityIdAllocator {
    free: VecDeque<u16>,
    versions: Vec<u8>,
}

impl EntityIdAllocator {
    pub fn new(capacity: u16) -> Self {
        Self {
            free: (0..capacity).collect(),
            versions: vec![0; usize::from(capacity)],
        }
    }

    pub fn capacity(&self) -> u16 {
        self.versions.len() as u16
    }

    /// Takes the next free id, or `None` when every id is in use.
    pub fn allocate(&mut self) -> Option<EntityId> {
        self.free.pop_front().map(EntityId)
    }

    /// Returns `id` to the pool and bumps its version.
    pub fn release(&mut self, id: EntityId) {
        if let Some(v) = self.versions.get_mut(usize::from(id.0)) {
            *v = v.wrapping_add(1);
            self.free.push_back(id.0);
        }
    }

    /// Current version of `id`.
    pub fn version(&self, id: EntityId) -> u8 {
        self.versions.get(usize::from(id.0)).copied().unwrap_or(0)
    }
}
