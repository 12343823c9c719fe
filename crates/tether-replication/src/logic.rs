//! Hooks the host plugs into the engines.
//!
//! [`EntityLogic`] is the simulation code shared by server and client, so a
//! client replay runs exactly what the server ran. [`ClientCallbacks`]
//! receives the client-side events produced by applying server state.

use tether_net::{PlayerId, Tick};

use crate::entity::{EntityId, EntityState};
use crate::schema::{ClassId, SchemaRegistry};

/// Per-call context handed to [`EntityLogic`].
pub struct LogicContext<'a> {
    registry: &'a SchemaRegistry,
    tick: Tick,
    player: PlayerId,
    replaying: bool,
    spawned: Vec<EntityState>,
}

impl<'a> LogicContext<'a> {
    pub(crate) fn new(registry: &'a SchemaRegistry, tick: Tick, player: PlayerId, replaying: bool) -> Self {
        Self {
            registry,
            tick,
            player,
            replaying,
            spawned: Vec::new(),
        }
    }

    /// The tick being simulated: the server tick in `update`, the input's
    /// tick in `apply_input`.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Player whose input is being applied, or the server id in `update`.
    pub fn player(&self) -> PlayerId {
        self.player
    }

    /// True while the client re-simulates inputs after a correction.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn registry(&self) -> &SchemaRegistry {
        self.registry
    }

    /// Spawns an entity owned by the current player.
    ///
    /// On the server this creates a real entity stamped with the input tick;
    /// on the client it creates a locally predicted entity. Returns `None`
    /// for an unknown class and while replaying, when the spawn already
    /// happened the first time round.
    pub fn spawn(&mut self, class: ClassId) -> Option<&mut EntityState> {
        if self.replaying {
            return None;
        }
        let class = self.registry.get(class)?.clone();
        self.spawned.push(EntityState::new(class));
        self.spawned.last_mut()
    }

    pub(crate) fn take_spawned(&mut self) -> Vec<EntityState> {
        std::mem::take(&mut self.spawned)
    }
}

/// Simulation code for replicated entities.
pub trait EntityLogic {
    /// Applies one tick of the owner's input to a controlled entity.
    fn apply_input(
        &mut self,
        ctx: &mut LogicContext<'_>,
        id: EntityId,
        entity: &mut EntityState,
        input: &[u8],
    );

    /// Advances an updateable entity by one tick.
    fn update(&mut self, ctx: &mut LogicContext<'_>, id: EntityId, entity: &mut EntityState) {
        let _ = (ctx, id, entity);
    }
}

/// One RPC delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcCall<'a> {
    pub rpc_id: u16,
    pub sub_object: Option<u8>,
    /// Server tick the call was made at.
    pub tick: Tick,
    pub payload: &'a [u8],
}

/// Client-side notifications. Every method defaults to doing nothing.
pub trait ClientCallbacks {
    /// An entity appeared, or was replaced by a newer version.
    fn on_constructed(&mut self, id: EntityId, entity: &EntityState) {
        let _ = (id, entity);
    }

    /// An entity was destroyed or dropped by a baseline.
    fn on_destroyed(&mut self, id: EntityId, entity: &EntityState) {
        let _ = (id, entity);
    }

    /// A field flagged `notify_on_change` got a different value.
    /// Sibling fields of the same record are already applied.
    fn on_field_changed(&mut self, id: EntityId, entity: &EntityState, field: usize, old: &[u8]) {
        let _ = (id, entity, field, old);
    }

    /// A remote call from the server.
    fn on_rpc(&mut self, id: EntityId, entity: &EntityState, call: RpcCall<'_>) {
        let _ = (id, entity, call);
    }

    /// A sync value changed.
    fn on_sync_value(&mut self, id: EntityId, sync_id: u8, value: &[u8]) {
        let _ = (id, sync_id, value);
    }

    /// A locally predicted entity was removed: `confirmed` is the server
    /// entity that replaced it, or `None` if the server never created one.
    fn on_predicted_destroyed(&mut self, local_id: u16, confirmed: Option<EntityId>) {
        let _ = (local_id, confirmed);
    }
}

/// Callbacks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl ClientCallbacks for NoCallbacks {}
