//! Tick-synchronized state replication.
//!
//! The server side ([`ServerEngine`]) tracks per-field changes of every
//! replicated entity and sends each player a reliable baseline followed by
//! unreliable diffs against the newest tick it acknowledged. The client side
//! ([`ClientEngine`]) reassembles those diffs, interpolates remote entities
//! and predicts its own entities ahead of the server, rolling back and
//! replaying buffered inputs whenever authoritative state arrives.
//!
//! Entity classes are described up front in a [`SchemaRegistry`]; behaviour
//! is plugged in through [`EntityLogic`], shared by both sides so a client
//! replay runs exactly what the server ran.

pub mod client;
pub mod entity;
pub mod error;
pub mod lag_compensation;
pub mod logic;
pub mod rpc;
pub mod schema;
pub mod server;
pub mod timestep;
pub mod tracker;

pub use client::{ClientEngine, ClientEntity, PredictedEntity};
pub use entity::{EntityHeader, EntityId, EntityState};
pub use error::{ClientError, FieldAccessError, SchemaError, ServerError};
pub use logic::{ClientCallbacks, EntityLogic, LogicContext, NoCallbacks, RpcCall};
pub use schema::{
    ClassBuilder, ClassDescriptor, ClassId, FieldDescriptor, FieldFlags, RpcTarget,
    SchemaRegistry, lerp_f32, lerp_f32x2, lerp_f32x3,
};
pub use server::{PlayerSession, ServerEngine, SessionState};
pub use timestep::FixedTimestep;
