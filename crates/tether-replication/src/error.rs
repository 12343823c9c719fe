//! Error types for the replication engines.

use tether_net::{PlayerId, WireError};

use crate::entity::EntityId;
use crate::schema::ClassId;

/// A class was rejected at registration.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("class `{0}` is already registered")]
    DuplicateClass(&'static str),
    #[error("class id space exhausted")]
    TooManyClasses,
    #[error("field `{class}.{field}` has zero size")]
    EmptyField {
        class: &'static str,
        field: &'static str,
    },
    #[error("field `{class}.{field}` cannot be both owner-only and others-only")]
    ConflictingVisibility {
        class: &'static str,
        field: &'static str,
    },
    #[error("field `{class}.{field}` interpolation flag and interpolator disagree")]
    MissingInterpolator {
        class: &'static str,
        field: &'static str,
    },
    #[error("class `{class}` uses the reserved sync rpc id")]
    ReservedRpcId { class: &'static str },
    #[error("class `{class}` declares rpc id {id} twice")]
    DuplicateRpc { class: &'static str, id: u16 },
    #[error("class `{class}` full record is {size} bytes, above the 15-bit record limit")]
    RecordTooLarge { class: &'static str, size: usize },
}

/// Typed access to an entity field failed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FieldAccessError {
    /// The class has no field at that index.
    #[error("no field {index} (class has {count})")]
    NoSuchField { index: usize, count: usize },
    /// The requested type does not have the field's size.
    #[error("field `{field}` is {expected} bytes, accessed as {actual}")]
    SizeMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Errors returned by [`ServerEngine`](crate::ServerEngine) operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("all {0} player slots are taken")]
    PlayerCapacity(u8),
    #[error("player {0} is already connected")]
    PlayerExists(PlayerId),
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),
    #[error("all {0} entity ids are in use")]
    EntityCapacity(u16),
    #[error("unknown class {0}")]
    UnknownClass(ClassId),
    #[error("entity {0:?} does not exist")]
    UnknownEntity(EntityId),
    #[error("class `{class}` has no rpc {rpc}")]
    UnknownRpc { class: &'static str, rpc: u16 },
    #[error("class `{class}` payload of {len} bytes exceeds its {max}-byte limit")]
    PayloadTooLarge {
        class: &'static str,
        len: usize,
        max: usize,
    },
    #[error("lag compensation is already active")]
    LagCompensationActive,
    #[error("malformed input from player {player}: {source}")]
    MalformedInput {
        player: PlayerId,
        #[source]
        source: WireError,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Errors returned by [`ClientEngine`](crate::ClientEngine) operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("entity {0:?} does not exist")]
    UnknownEntity(EntityId),
    #[error("no diff or baseline received yet")]
    NotConnected,
    #[error("input is {actual} bytes, expected {expected}")]
    InputSize { expected: usize, actual: usize },
    #[error("record references unknown class {0}")]
    UnknownClass(ClassId),
    #[error(transparent)]
    Field(#[from] FieldAccessError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
