//! Client-side prediction: the unacknowledged input buffer, locally
//! predicted spawns, and the forward/replay step shared by both.
//!
//! Forward prediction applies each new input to the locally controlled
//! entities as soon as it is produced. When a newer server state is
//! applied, [`rollback`] restores the predictable fields to the server's
//! values and replays every input the server has not processed yet, so the
//! prediction reconverges on the authoritative state.

use std::collections::{BTreeMap, VecDeque};

use tether_net::packet::INPUT_RECORD_HEADER_SIZE;
use tether_net::{PlayerId, Tick, sequence_diff};

use super::apply::ClientEntity;
use crate::entity::{EntityId, EntityState};
use crate::logic::{EntityLogic, LogicContext};
use crate::schema::{ClassId, SchemaRegistry};

// ---------------------------------------------------------------------------
// InputBuffer
// ---------------------------------------------------------------------------

/// One input kept until the server reports it processed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BufferedInput {
    pub tick: Tick,
    /// Record header followed by the input bytes, as sent on the wire.
    pub record: Vec<u8>,
}

impl BufferedInput {
    pub(crate) fn input(&self) -> &[u8] {
        &self.record[INPUT_RECORD_HEADER_SIZE..]
    }
}

#[derive(Debug)]
pub(crate) struct InputBuffer {
    inputs: VecDeque<BufferedInput>,
    capacity: usize,
}

impl InputBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inputs: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, input: BufferedInput) {
        if self.inputs.len() >= self.capacity {
            if let Some(dropped) = self.inputs.pop_front() {
                tracing::warn!(tick = dropped.tick, "input buffer full, dropping oldest input");
            }
        }
        self.inputs.push_back(input);
    }

    /// Drops inputs the server has processed. Returns how many went.
    pub(crate) fn acknowledge(&mut self, processed: Tick) -> usize {
        let before = self.inputs.len();
        while self
            .inputs
            .front()
            .is_some_and(|i| sequence_diff(i.tick, processed) <= 0)
        {
            self.inputs.pop_front();
        }
        before - self.inputs.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &BufferedInput> {
        self.inputs.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.inputs.len()
    }
}

// ---------------------------------------------------------------------------
// Predicted entities
// ---------------------------------------------------------------------------

/// An entity spawned locally ahead of the server.
#[derive(Debug, Clone)]
pub struct PredictedEntity {
    local_id: u16,
    parent: EntityId,
    creation_tick: Tick,
    state: EntityState,
}

impl PredictedEntity {
    /// Client-local id, reported again when the entity is removed.
    pub fn local_id(&self) -> u16 {
        self.local_id
    }

    /// The entity whose input spawned it.
    pub fn parent(&self) -> EntityId {
        self.parent
    }

    /// Input tick it was spawned at.
    pub fn creation_tick(&self) -> Tick {
        self.creation_tick
    }

    pub fn state(&self) -> &EntityState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EntityState {
        &mut self.state
    }

    pub fn class_id(&self) -> ClassId {
        self.state.class().id()
    }
}

/// Predicted spawns in creation order.
#[derive(Debug, Default)]
pub(crate) struct PredictedEntities {
    entities: VecDeque<PredictedEntity>,
    next_local_id: u16,
}

impl PredictedEntities {
    pub(crate) fn spawn(&mut self, parent: EntityId, creation_tick: Tick, state: EntityState) -> u16 {
        let local_id = self.next_local_id;
        self.next_local_id = self.next_local_id.wrapping_add(1);
        self.entities.push_back(PredictedEntity {
            local_id,
            parent,
            creation_tick,
            state,
        });
        local_id
    }

    /// Removes and returns the oldest prediction a server entity of
    /// `class` created at `creation_tick` stands for.
    pub(crate) fn confirm(&mut self, class: ClassId, creation_tick: Tick) -> Option<PredictedEntity> {
        let i = self
            .entities
            .iter()
            .position(|p| p.class_id() == class && p.creation_tick == creation_tick)?;
        self.entities.remove(i)
    }

    /// Removes predictions the server should have confirmed by `processed`.
    pub(crate) fn expire(&mut self, processed: Tick) -> Vec<PredictedEntity> {
        let mut expired = Vec::new();
        while self
            .entities
            .front()
            .is_some_and(|p| sequence_diff(p.creation_tick, processed) <= 0)
        {
            if let Some(p) = self.entities.pop_front() {
                expired.push(p);
            }
        }
        expired
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PredictedEntity> {
        self.entities.iter()
    }

    pub(crate) fn get_mut(&mut self, local_id: u16) -> Option<&mut PredictedEntity> {
        self.entities.iter_mut().find(|p| p.local_id == local_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entities.len()
    }
}

// ---------------------------------------------------------------------------
// Stepping
// ---------------------------------------------------------------------------

/// Runs one input against every locally controlled entity, as the server
/// does for that player. Returns what the logic spawned, with its parent.
pub(crate) fn predict_step(
    entities: &mut BTreeMap<EntityId, ClientEntity>,
    registry: &SchemaRegistry,
    local_player: PlayerId,
    tick: Tick,
    input: &[u8],
    replaying: bool,
    logic: &mut impl EntityLogic,
) -> Vec<(EntityId, EntityState)> {
    let mut ctx = LogicContext::new(registry, tick, local_player, replaying);
    let mut spawned = Vec::new();
    for (&id, entity) in entities.iter_mut() {
        if !entity.is_locally_controlled(local_player) {
            continue;
        }
        let updateable = entity.state().class().flags().updateable;
        logic.apply_input(&mut ctx, id, entity.state_mut(), input);
        if updateable {
            logic.update(&mut ctx, id, entity.state_mut());
        }
        spawned.extend(ctx.take_spawned().into_iter().map(|s| (id, s)));
    }
    spawned
}

/// Restores predictable fields from the last server values and replays
/// every buffered input. Returns the number of inputs replayed.
pub(crate) fn rollback(
    entities: &mut BTreeMap<EntityId, ClientEntity>,
    inputs: &InputBuffer,
    registry: &SchemaRegistry,
    local_player: PlayerId,
    logic: &mut impl EntityLogic,
) -> usize {
    for entity in entities.values_mut() {
        let local = entity.is_locally_controlled(local_player);
        entity.restore_predicted(local);
    }
    for input in inputs.iter() {
        predict_step(entities, registry, local_player, input.tick, input.input(), true, logic);
    }
    for entity in entities.values_mut() {
        if entity.is_locally_controlled(local_player) {
            entity.capture_interpolation();
        }
    }
    inputs.len()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::entity::EntityHeader;
    use crate::schema::{ClassBuilder, ClassDescriptor, FieldDescriptor};

    const LOCAL: PlayerId = 1;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                ClassBuilder::new("walker")
                    .controlled()
                    .field(FieldDescriptor::new::<i32>("pos"))
                    .field(FieldDescriptor::new::<i32>("steps").never_rolled_back()),
            )
            .unwrap();
        registry
    }

    /// Adds the input to `pos` and counts steps.
    struct Walk;

    impl EntityLogic for Walk {
        fn apply_input(
            &mut self,
            _ctx: &mut LogicContext<'_>,
            _id: EntityId,
            entity: &mut EntityState,
            input: &[u8],
        ) {
            let dx = i32::from(input[0] as i8);
            let pos: i32 = entity.read(0).unwrap();
            entity.write(0, pos + dx).unwrap();
            let steps: i32 = entity.read(1).unwrap();
            entity.write(1, steps + 1).unwrap();
        }
    }

    fn walker(class: &Arc<ClassDescriptor>, owner: PlayerId) -> ClientEntity {
        let header = EntityHeader {
            version: 0,
            class_id: class.id(),
            owner,
            creation_tick: 0,
            destroyed: false,
        };
        ClientEntity::new(header, EntityState::new(class.clone()))
    }

    fn buffered(tick: Tick, dx: i8) -> BufferedInput {
        let mut record = vec![0; INPUT_RECORD_HEADER_SIZE];
        record.push(dx as u8);
        BufferedInput { tick, record }
    }

    #[test]
    fn test_replay_matches_forward_prediction() {
        let registry = registry();
        let class = registry.get(0).unwrap().clone();
        let mut entities = BTreeMap::from([(EntityId(0), walker(&class, LOCAL))]);
        let mut buffer = InputBuffer::new(16);

        for (tick, dx) in [(1u16, 3i8), (2, -1), (3, 5), (4, 2)] {
            let input = buffered(tick, dx);
            predict_step(&mut entities, &registry, LOCAL, tick, input.input(), false, &mut Walk);
            buffer.push(input);
        }
        let forward = entities[&EntityId(0)].state().read::<i32>(0).unwrap();
        assert_eq!(forward, 9);

        // The server confirms the state after tick 2 unchanged.
        assert_eq!(buffer.acknowledge(2), 2);
        let replayed = rollback(&mut entities, &buffer, &registry, LOCAL, &mut Walk);
        assert_eq!(replayed, 2);
        // No server state arrived, so pos restarts from 0 and only the
        // inputs for ticks 3 and 4 are replayed.
        assert_eq!(entities[&EntityId(0)].state().read::<i32>(0).unwrap(), 7);
    }

    #[test]
    fn test_rollback_reconverges_on_server_state() {
        let registry = registry();
        let class = registry.get(0).unwrap().clone();
        let mut predicted = BTreeMap::from([(EntityId(0), walker(&class, LOCAL))]);
        let mut buffer = InputBuffer::new(16);
        let inputs = [(1u16, 3i8), (2, -1), (3, 5), (4, 2)];
        for &(tick, dx) in &inputs {
            let input = buffered(tick, dx);
            predict_step(&mut predicted, &registry, LOCAL, tick, input.input(), false, &mut Walk);
            buffer.push(input);
        }
        let forward = predicted[&EntityId(0)].state().read::<i32>(0).unwrap();

        // Server processed ticks 1..=2: pos = 2. Deliver it as authoritative.
        let mut server_view = walker(&class, LOCAL);
        server_view.state_mut().write(0, 2i32).unwrap();
        let entity = predicted.get_mut(&EntityId(0)).unwrap();
        entity.authoritative.copy_from_slice(server_view.state().data());

        buffer.acknowledge(2);
        rollback(&mut predicted, &buffer, &registry, LOCAL, &mut Walk);
        assert_eq!(predicted[&EntityId(0)].state().read::<i32>(0).unwrap(), forward);
    }

    #[test]
    fn test_never_rolled_back_field_keeps_local_value() {
        let registry = registry();
        let class = registry.get(0).unwrap().clone();
        let mut entities = BTreeMap::from([(EntityId(0), walker(&class, LOCAL))]);
        let mut buffer = InputBuffer::new(16);
        for tick in 1..=3u16 {
            let input = buffered(tick, 1);
            predict_step(&mut entities, &registry, LOCAL, tick, input.input(), false, &mut Walk);
            buffer.push(input);
        }
        rollback(&mut entities, &buffer, &registry, LOCAL, &mut Walk);
        // pos restored to 0 and replayed; steps kept counting.
        let entity = &entities[&EntityId(0)];
        assert_eq!(entity.state().read::<i32>(0).unwrap(), 3);
        assert_eq!(entity.state().read::<i32>(1).unwrap(), 6);
    }

    #[test]
    fn test_remote_entities_untouched_by_replay() {
        let registry = registry();
        let class = registry.get(0).unwrap().clone();
        let mut entities = BTreeMap::from([(EntityId(3), walker(&class, 2))]);
        let mut buffer = InputBuffer::new(4);
        buffer.push(buffered(1, 9));
        rollback(&mut entities, &buffer, &registry, LOCAL, &mut Walk);
        assert_eq!(entities[&EntityId(3)].state().read::<i32>(0).unwrap(), 0);
    }

    #[test]
    fn test_input_buffer_bounds_and_acks() {
        let mut buffer = InputBuffer::new(3);
        for tick in 65_534..=65_535u16 {
            buffer.push(buffered(tick, 0));
        }
        for tick in 0..=1u16 {
            buffer.push(buffered(tick, 0));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.iter().next().unwrap().tick, 65_535);
        assert_eq!(buffer.acknowledge(0), 2);
        assert_eq!(buffer.iter().next().unwrap().tick, 1);
        assert_eq!(buffer.acknowledge(0), 0);
    }

    #[test]
    fn test_predicted_entities_confirm_and_expire() {
        let registry = registry();
        let class = registry.get(0).unwrap().clone();
        let mut predicted = PredictedEntities::default();
        let a = predicted.spawn(EntityId(0), 10, EntityState::new(class.clone()));
        let b = predicted.spawn(EntityId(0), 11, EntityState::new(class.clone()));
        let c = predicted.spawn(EntityId(0), 12, EntityState::new(class));

        assert_eq!(predicted.confirm(0, 11).unwrap().local_id(), b);
        assert!(predicted.confirm(1, 10).is_none());

        let expired: Vec<u16> = predicted.expire(11).iter().map(PredictedEntity::local_id).collect();
        assert_eq!(expired, [a]);
        assert_eq!(predicted.len(), 1);
        assert_eq!(predicted.iter().next().unwrap().local_id(), c);
    }
}
