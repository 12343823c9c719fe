//! Explicit per-class field schema.
//!
//! Every replicated class is described once at startup by an ordered list of
//! fixed-size fields plus an RPC table. The [`SchemaRegistry`] lays the
//! fields out back to back in a byte image and hands out
//! `Arc<ClassDescriptor>`s that the server and client share read-only.

use std::ops::Range;
use std::sync::Arc;

use bytemuck::Pod;
use tether_net::PlayerId;

use crate::entity::ENTITY_HEADER_SIZE;
use crate::error::SchemaError;
use crate::rpc::RPC_ENTRY_HEADER_SIZE;

/// Index of a class in its [`SchemaRegistry`].
pub type ClassId = u16;

/// Reserved RPC id carrying sync-value updates.
pub const SYNC_RPC_ID: u16 = 0xFFFF;

/// Largest encodable record, in bytes (15-bit size field).
pub const MAX_RECORD_SIZE: usize = 0x7FFF;

/// Size word, entity id, header and rpc count around a full field image.
const FULL_RECORD_OVERHEAD: usize = 2 + 2 + ENTITY_HEADER_SIZE + 2;

/// Blends `from` towards `to` by `t` and writes the result into `out`.
///
/// All three slices have the field's size.
pub type InterpolateFn = fn(from: &[u8], to: &[u8], t: f32, out: &mut [u8]);

// ---------------------------------------------------------------------------
// Built-in interpolators
// ---------------------------------------------------------------------------

fn lerp_lanes(from: &[u8], to: &[u8], t: f32, out: &mut [u8]) {
    let lanes = out
        .chunks_exact_mut(4)
        .zip(from.chunks_exact(4))
        .zip(to.chunks_exact(4));
    for ((o, a), b) in lanes {
        let a: f32 = bytemuck::pod_read_unaligned(a);
        let b: f32 = bytemuck::pod_read_unaligned(b);
        o.copy_from_slice(bytemuck::bytes_of(&(a + (b - a) * t)));
    }
}

/// Linear interpolation of an `f32` field.
pub fn lerp_f32(from: &[u8], to: &[u8], t: f32, out: &mut [u8]) {
    lerp_lanes(from, to, t, out);
}

/// Component-wise linear interpolation of an `[f32; 2]` field.
pub fn lerp_f32x2(from: &[u8], to: &[u8], t: f32, out: &mut [u8]) {
    lerp_lanes(from, to, t, out);
}

/// Component-wise linear interpolation of an `[f32; 3]` field.
pub fn lerp_f32x3(from: &[u8], to: &[u8], t: f32, out: &mut [u8]) {
    lerp_lanes(from, to, t, out);
}

// ---------------------------------------------------------------------------
// FieldDescriptor
// ---------------------------------------------------------------------------

/// Replication behaviour of a single field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldFlags {
    /// Clients blend the field between the two bracketing server states.
    pub interpolated: bool,
    /// The server keeps a history of the field for lag compensation.
    pub lag_compensated: bool,
    /// Only the owning player receives the field.
    pub owner_only: bool,
    /// Every player except the owner receives the field.
    pub others_only: bool,
    /// Restored and re-simulated even on entities the client does not control.
    pub always_predicted: bool,
    /// Never restored by a rollback.
    pub never_rolled_back: bool,
    /// Clients get a callback when an update changes the value.
    pub notify_on_change: bool,
}

/// One fixed-size field of a replicated class.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// Field name, for lookups and diagnostics.
    pub name: &'static str,
    /// Size in bytes.
    pub size: usize,
    /// Replication flags.
    pub flags: FieldFlags,
    /// Interpolator, present iff `flags.interpolated`.
    pub interpolate: Option<InterpolateFn>,
}

impl FieldDescriptor {
    /// A field holding one `T`.
    pub fn new<T: Pod>(name: &'static str) -> Self {
        Self::with_size(name, size_of::<T>())
    }

    /// A raw field of `size` bytes.
    pub fn with_size(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size,
            flags: FieldFlags::default(),
            interpolate: None,
        }
    }

    /// Interpolate the field on clients with `f`.
    pub fn interpolated(mut self, f: InterpolateFn) -> Self {
        self.flags.interpolated = true;
        self.interpolate = Some(f);
        self
    }

    /// Keep a lag-compensation history of the field.
    pub fn lag_compensated(mut self) -> Self {
        self.flags.lag_compensated = true;
        self
    }

    /// Send the field only to the owner.
    pub fn owner_only(mut self) -> Self {
        self.flags.owner_only = true;
        self
    }

    /// Send the field to everyone but the owner.
    pub fn others_only(mut self) -> Self {
        self.flags.others_only = true;
        self
    }

    /// Predict the field on every entity, not only controlled ones.
    pub fn always_predicted(mut self) -> Self {
        self.flags.always_predicted = true;
        self
    }

    /// Exclude the field from rollback.
    pub fn never_rolled_back(mut self) -> Self {
        self.flags.never_rolled_back = true;
        self
    }

    /// Report changes to the field through the client callbacks.
    pub fn notify_on_change(mut self) -> Self {
        self.flags.notify_on_change = true;
        self
    }

    /// Whether a player receives this field of an entity owned by `owner`.
    pub fn visible_to(&self, player: PlayerId, owner: PlayerId) -> bool {
        if self.flags.owner_only && player != owner {
            return false;
        }
        !(self.flags.others_only && player == owner)
    }

    /// Whether a client restores this field on rollback.
    ///
    /// `locally_controlled` is true for entities the client drives with its
    /// own input.
    pub fn is_predictable(&self, locally_controlled: bool) -> bool {
        if self.flags.never_rolled_back {
            return false;
        }
        if locally_controlled {
            !self.flags.others_only
        } else {
            self.flags.always_predicted
        }
    }
}

// ---------------------------------------------------------------------------
// RPCs
// ---------------------------------------------------------------------------

/// Which players receive an RPC record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    /// Every player.
    All,
    /// Only the entity's owner.
    Owner,
    /// Every player except the owner.
    Others,
    /// One specific player.
    Player(PlayerId),
}

impl RpcTarget {
    /// Whether `player` receives a record on an entity owned by `owner`.
    pub fn visible_to(self, player: PlayerId, owner: PlayerId) -> bool {
        match self {
            Self::All => true,
            Self::Owner => player == owner,
            Self::Others => player != owner,
            Self::Player(p) => player == p,
        }
    }
}

/// An entry of a class's RPC table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcDescriptor {
    /// Wire id, unique within the class.
    pub id: u16,
    /// Name, for diagnostics.
    pub name: &'static str,
    /// Default recipients.
    pub target: RpcTarget,
}

// ---------------------------------------------------------------------------
// ClassDescriptor
// ---------------------------------------------------------------------------

/// Class-level capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassFlags {
    /// Runs [`EntityLogic::update`](crate::EntityLogic::update) every tick.
    pub updateable: bool,
    /// Replicated only to its owner.
    pub owner_only: bool,
    /// Driven by its owner's input.
    pub controlled: bool,
}

/// Builder collected before a class is registered.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: &'static str,
    flags: ClassFlags,
    fields: Vec<FieldDescriptor>,
    rpcs: Vec<RpcDescriptor>,
}

impl ClassBuilder {
    /// Starts a class with no fields.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flags: ClassFlags::default(),
            fields: Vec::new(),
            rpcs: Vec::new(),
        }
    }

    /// Mark the class as updated every tick.
    pub fn updateable(mut self) -> Self {
        self.flags.updateable = true;
        self
    }

    /// Replicate the class only to its owner.
    pub fn owner_only(mut self) -> Self {
        self.flags.owner_only = true;
        self
    }

    /// Drive the class with its owner's input.
    pub fn controlled(mut self) -> Self {
        self.flags.controlled = true;
        self
    }

    /// Appends a field.
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Appends an RPC table entry.
    pub fn rpc(mut self, id: u16, name: &'static str, target: RpcTarget) -> Self {
        self.rpcs.push(RpcDescriptor { id, name, target });
        self
    }
}

/// A registered class: fields with their computed byte ranges and the RPC
/// table.
#[derive(Debug)]
pub struct ClassDescriptor {
    id: ClassId,
    name: &'static str,
    flags: ClassFlags,
    fields: Vec<FieldDescriptor>,
    offsets: Vec<usize>,
    data_size: usize,
    rpcs: Vec<RpcDescriptor>,
}

impl ClassDescriptor {
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&FieldDescriptor> {
        self.fields.get(index)
    }

    /// Index of the field called `name`.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Byte range of field `index` inside the data image.
    ///
    /// Callers pass indices below `fields().len()`.
    pub fn field_range(&self, index: usize) -> Range<usize> {
        let start = self.offsets[index];
        start..start + self.fields[index].size
    }

    /// Size of the whole field image.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Bytes of a full record carrying no RPCs.
    pub fn full_record_size(&self) -> usize {
        FULL_RECORD_OVERHEAD + self.data_size
    }

    /// Largest RPC or sync payload a full record of this class can carry.
    pub fn max_call_payload(&self) -> usize {
        MAX_RECORD_SIZE.saturating_sub(self.full_record_size() + RPC_ENTRY_HEADER_SIZE)
    }

    /// Bytes of the per-record change bitmap.
    pub fn bitmap_bytes(&self) -> usize {
        self.fields.len().div_ceil(8)
    }

    pub fn has_lag_compensation(&self) -> bool {
        self.fields.iter().any(|f| f.flags.lag_compensated)
    }

    /// Looks up an RPC by wire id.
    pub fn rpc(&self, id: u16) -> Option<&RpcDescriptor> {
        self.rpcs.iter().find(|r| r.id == id)
    }

    pub fn rpcs(&self) -> &[RpcDescriptor] {
        &self.rpcs
    }
}

// ---------------------------------------------------------------------------
// SchemaRegistry
// ---------------------------------------------------------------------------

/// Every replicated class, indexed by [`ClassId`].
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    classes: Vec<Arc<ClassDescriptor>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a class, returning its id.
    pub fn register(&mut self, builder: ClassBuilder) -> Result<ClassId, SchemaError> {
        let ClassBuilder {
            name,
            flags,
            fields,
            rpcs,
        } = builder;

        if self.classes.iter().any(|c| c.name == name) {
            return Err(SchemaError::DuplicateClass(name));
        }
        let id = ClassId::try_from(self.classes.len()).map_err(|_| SchemaError::TooManyClasses)?;

        let mut offsets = Vec::with_capacity(fields.len());
        let mut data_size = 0usize;
        for field in &fields {
            if field.size == 0 {
                return Err(SchemaError::EmptyField {
                    class: name,
                    field: field.name,
                });
            }
            if field.flags.owner_only && field.flags.others_only {
                return Err(SchemaError::ConflictingVisibility {
                    class: name,
                    field: field.name,
                });
            }
            if field.flags.interpolated != field.interpolate.is_some() {
                return Err(SchemaError::MissingInterpolator {
                    class: name,
                    field: field.name,
                });
            }
            offsets.push(data_size);
            data_size += field.size;
        }

        for (i, rpc) in rpcs.iter().enumerate() {
            if rpc.id == SYNC_RPC_ID {
                return Err(SchemaError::ReservedRpcId { class: name });
            }
            if rpcs[..i].iter().any(|r| r.id == rpc.id) {
                return Err(SchemaError::DuplicateRpc {
                    class: name,
                    id: rpc.id,
                });
            }
        }

        let full_record = FULL_RECORD_OVERHEAD + data_size;
        if full_record > MAX_RECORD_SIZE {
            return Err(SchemaError::RecordTooLarge {
                class: name,
                size: full_record,
            });
        }

        self.classes.push(Arc::new(ClassDescriptor {
            id,
            name,
            flags,
            fields,
            offsets,
            data_size,
            rpcs,
        }));
        tracing::debug!(class = name, id, data_size, "registered replicated class");
        Ok(id)
    }

    pub fn get(&self, id: ClassId) -> Option<&Arc<ClassDescriptor>> {
        self.classes.get(usize::from(id))
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<ClassDescriptor>> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ship() -> ClassBuilder {
        ClassBuilder::new("ship")
            .controlled()
            .field(FieldDescriptor::new::<[f32; 3]>("position").interpolated(lerp_f32x3))
            .field(FieldDescriptor::new::<u16>("health").notify_on_change())
            .field(FieldDescriptor::new::<u8>("ammo").owner_only())
            .rpc(1, "fire", RpcTarget::All)
    }

    #[test]
    fn test_offsets_are_packed() {
        let mut registry = SchemaRegistry::new();
        let id = registry.register(ship()).unwrap();
        let class = registry.get(id).unwrap();
        assert_eq!(class.field_range(0), 0..12);
        assert_eq!(class.field_range(1), 12..14);
        assert_eq!(class.field_range(2), 14..15);
        assert_eq!(class.data_size(), 15);
        assert_eq!(class.bitmap_bytes(), 1);
        assert_eq!(class.field_index("health"), Some(1));
        assert!(class.rpc(1).is_some());
        assert!(class.rpc(2).is_none());
    }

    #[test]
    fn test_class_ids_follow_registration_order() {
        let mut registry = SchemaRegistry::new();
        assert_eq!(registry.register(ship()).unwrap(), 0);
        let rock = ClassBuilder::new("rock").field(FieldDescriptor::new::<f32>("mass"));
        assert_eq!(registry.register(rock).unwrap(), 1);
        assert_eq!(registry.by_name("rock").unwrap().id(), 1);
        assert!(matches!(
            registry.register(ship()),
            Err(SchemaError::DuplicateClass("ship"))
        ));
    }

    #[test]
    fn test_invalid_classes_rejected() {
        let mut registry = SchemaRegistry::new();
        let both = ClassBuilder::new("a")
            .field(FieldDescriptor::new::<u8>("x").owner_only().others_only());
        assert!(matches!(
            registry.register(both),
            Err(SchemaError::ConflictingVisibility { .. })
        ));

        let reserved = ClassBuilder::new("b").rpc(SYNC_RPC_ID, "sync", RpcTarget::All);
        assert!(matches!(
            registry.register(reserved),
            Err(SchemaError::ReservedRpcId { .. })
        ));

        let huge = ClassBuilder::new("c").field(FieldDescriptor::with_size("blob", 40_000));
        assert!(matches!(
            registry.register(huge),
            Err(SchemaError::RecordTooLarge { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_visibility_and_predictability() {
        let owner_only = FieldDescriptor::new::<u8>("a").owner_only();
        assert!(owner_only.visible_to(2, 2));
        assert!(!owner_only.visible_to(3, 2));

        let others = FieldDescriptor::new::<u8>("b").others_only();
        assert!(!others.visible_to(2, 2));
        assert!(others.visible_to(3, 2));
        assert!(!others.is_predictable(true));

        let plain = FieldDescriptor::new::<u8>("c");
        assert!(plain.is_predictable(true));
        assert!(!plain.is_predictable(false));

        let always = FieldDescriptor::new::<u8>("d").always_predicted();
        assert!(always.is_predictable(false));
        assert!(!always.never_rolled_back().is_predictable(true));
    }

    #[test]
    fn test_lerp_f32x2() {
        let from = bytemuck::bytes_of(&[0.0f32, 10.0]).to_vec();
        let to = bytemuck::bytes_of(&[4.0f32, 20.0]).to_vec();
        let mut out = vec![0u8; 8];
        lerp_f32x2(&from, &to, 0.25, &mut out);
        let r: [f32; 2] = bytemuck::pod_read_unaligned(&out);
        assert_eq!(r, [1.0, 12.5]);
    }

    #[test]
    fn test_rpc_targets() {
        assert!(RpcTarget::All.visible_to(1, 2));
        assert!(RpcTarget::Owner.visible_to(2, 2));
        assert!(!RpcTarget::Owner.visible_to(1, 2));
        assert!(RpcTarget::Others.visible_to(1, 2));
        assert!(!RpcTarget::Others.visible_to(2, 2));
        assert!(RpcTarget::Player(5).visible_to(5, 2));
        assert!(!RpcTarget::Player(5).visible_to(2, 2));
    }
}
