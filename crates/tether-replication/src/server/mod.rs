//! Authoritative server engine.
//!
//! [`ServerEngine`] owns every replicated entity and player session. The
//! host drives it with three calls:
//!
//! 1. [`receive`](ServerEngine::receive) for every input packet pulled off
//!    the wire,
//! 2. [`update`](ServerEngine::update) once per fixed tick,
//! 3. [`send_updates`](ServerEngine::send_updates) after each update.
//!
//! Each player gets a reliable LZ4-compressed baseline when it joins (or
//! falls too far behind), then unreliable per-tick diffs relative to the
//! newest state it acknowledged.

mod session;

use std::collections::BTreeMap;
use std::sync::Arc;

use tether_config::Config;
use tether_net::packet::DIFF_PART_OVERHEAD;
use tether_net::{
    BaselineHeader, ByteWriter, DiffPartHeader, PlayerId, PlayerTransport, SERVER_PLAYER_ID,
    Tick, compress_block, sequence_diff,
};

pub use session::{PlayerSession, SessionState};
use session::parse_input_batch;

use crate::entity::{EntityHeader, EntityId, EntityIdAllocator, EntityState};
use crate::error::ServerError;
use crate::lag_compensation::{LagCompensation, LagHistory, LagWindow};
use crate::logic::{EntityLogic, LogicContext};
use crate::schema::{ClassDescriptor, ClassId, RpcTarget, SchemaRegistry, SYNC_RPC_ID};
use crate::tracker::{EntityTracker, PlayerView, RecordOutcome};

/// Most parts a single diff may be split into.
const MAX_DIFF_PARTS: usize = 256;

#[derive(Debug)]
struct ServerEntity {
    class: Arc<ClassDescriptor>,
    tracker: EntityTracker,
    /// Live state; `None` once destroyed and draining.
    state: Option<EntityState>,
    history: Option<LagHistory>,
}

/// A built per-player payload.
struct Payload {
    bytes: Vec<u8>,
    too_large: Vec<EntityId>,
}

/// The authoritative simulation and replication state.
pub struct ServerEngine {
    registry: Arc<SchemaRegistry>,
    config: Config,
    tick: Tick,
    ids: EntityIdAllocator,
    entities: Vec<Option<ServerEntity>>,
    sessions: BTreeMap<PlayerId, PlayerSession>,
    lag: LagCompensation,
    send_counter: u8,
}

impl ServerEngine {
    /// Creates an engine with no players and no entities at tick 0.
    pub fn new(registry: Arc<SchemaRegistry>, config: &Config) -> Self {
        let capacity = config.server.max_entities;
        tracing::info!(
            max_players = config.server.max_players,
            max_entities = capacity,
            send_rate = config.server.send_rate,
            "server engine created"
        );
        Self {
            registry,
            config: config.clone(),
            tick: 0,
            ids: EntityIdAllocator::new(capacity),
            entities: (0..capacity).map(|_| None).collect(),
            sessions: BTreeMap::new(),
            lag: LagCompensation::default(),
            send_counter: 0,
        }
    }

    /// The tick of the most recent update.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    // -- Players ----------------------------------------------------------

    /// Connects a new player with the lowest free id. It receives a
    /// baseline at the next send.
    pub fn add_player(&mut self) -> Result<PlayerId, ServerError> {
        let max = self.config.server.max_players;
        let player = (1..=max)
            .find(|id| !self.sessions.contains_key(id))
            .ok_or(ServerError::PlayerCapacity(max))?;
        self.sessions.insert(
            player,
            PlayerSession::new(player, self.config.server.input_queue_len),
        );
        tracing::info!(player, "player added");
        Ok(player)
    }

    /// Disconnects `player` and destroys every entity it owns.
    pub fn remove_player(&mut self, player: PlayerId) -> Result<(), ServerError> {
        self.sessions
            .remove(&player)
            .ok_or(ServerError::UnknownPlayer(player))?;
        let owned: Vec<EntityId> = self
            .live_entities()
            .filter(|(_, e)| e.tracker.header().owner == player)
            .map(|(id, _)| id)
            .collect();
        for id in owned {
            self.destroy_entity(id)?;
        }
        tracing::info!(player, "player removed");
        Ok(())
    }

    pub fn session(&self, player: PlayerId) -> Option<&PlayerSession> {
        self.sessions.get(&player)
    }

    /// Connected player ids in ascending order.
    pub fn players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.sessions.keys().copied()
    }

    /// Forces a baseline for `player` at the next send.
    pub fn request_baseline(&mut self, player: PlayerId) -> Result<(), ServerError> {
        let session = self
            .sessions
            .get_mut(&player)
            .ok_or(ServerError::UnknownPlayer(player))?;
        session.set_state(SessionState::RequestBaseline);
        Ok(())
    }

    // -- Entities ---------------------------------------------------------

    fn live_entities(&self) -> impl Iterator<Item = (EntityId, &ServerEntity)> {
        self.entities.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref()
                .filter(|e| e.state.is_some())
                .map(|e| (EntityId(i as u16), e))
        })
    }

    fn insert_entity(
        &mut self,
        state: EntityState,
        owner: PlayerId,
        creation_tick: Tick,
    ) -> Result<EntityId, ServerError> {
        let id = self
            .ids
            .allocate()
            .ok_or(ServerError::EntityCapacity(self.ids.capacity()))?;
        let class = state.class().clone();
        let header = EntityHeader {
            version: self.ids.version(id),
            class_id: class.id(),
            owner,
            creation_tick,
            destroyed: false,
        };
        let history = LagHistory::new(&class, self.config.server.lag_compensation_depth);
        self.entities[usize::from(id.0)] = Some(ServerEntity {
            tracker: EntityTracker::new(header, &class),
            class,
            state: Some(state),
            history,
        });
        tracing::debug!(entity = id.0, owner, creation_tick, "entity created");
        Ok(id)
    }

    /// Creates a zeroed entity of `class`, replicated from the next update.
    pub fn create_entity(&mut self, class: ClassId, owner: PlayerId) -> Result<EntityId, ServerError> {
        self.create_predicted_entity(class, owner, self.tick.wrapping_add(1))
    }

    /// Creates an entity stamped with `input_tick`, so the owning client can
    /// match it against an entity it predicted for that input.
    pub fn create_predicted_entity(
        &mut self,
        class: ClassId,
        owner: PlayerId,
        input_tick: Tick,
    ) -> Result<EntityId, ServerError> {
        let class = self
            .registry
            .get(class)
            .ok_or(ServerError::UnknownClass(class))?
            .clone();
        self.insert_entity(EntityState::new(class), owner, input_tick)
    }

    /// Destroys an entity. Players keep receiving the destruction until all
    /// of them acknowledge it; only then is the id reused.
    pub fn destroy_entity(&mut self, id: EntityId) -> Result<(), ServerError> {
        let slot = self
            .entities
            .get_mut(usize::from(id.0))
            .ok_or(ServerError::UnknownEntity(id))?;
        let Some(entity) = slot.as_mut().filter(|e| e.state.is_some()) else {
            return Err(ServerError::UnknownEntity(id));
        };
        if !entity.tracker.is_captured() {
            // Never replicated: nothing to drain.
            *slot = None;
            self.ids.release(id);
        } else {
            entity.state = None;
            entity.tracker.mark_destroyed();
        }
        tracing::debug!(entity = id.0, "entity destroyed");
        Ok(())
    }

    fn live_mut(&mut self, id: EntityId) -> Result<&mut ServerEntity, ServerError> {
        self.entities
            .get_mut(usize::from(id.0))
            .and_then(Option::as_mut)
            .filter(|e| e.state.is_some())
            .ok_or(ServerError::UnknownEntity(id))
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities
            .get(usize::from(id.0))?
            .as_ref()?
            .state
            .as_ref()
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut EntityState> {
        self.entities
            .get_mut(usize::from(id.0))?
            .as_mut()?
            .state
            .as_mut()
    }

    /// Header of a live or draining entity.
    pub fn header(&self, id: EntityId) -> Option<&EntityHeader> {
        self.entities
            .get(usize::from(id.0))?
            .as_ref()
            .map(|e| e.tracker.header())
    }

    /// Ids of every live entity.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.live_entities().map(|(id, _)| id).collect()
    }

    /// Queued RPC records of an entity, for inspection.
    pub fn pending_rpcs(&self, id: EntityId) -> usize {
        self.entities
            .get(usize::from(id.0))
            .and_then(Option::as_ref)
            .map_or(0, |e| e.tracker.rpcs().len())
    }

    // -- RPCs and sync values ---------------------------------------------

    /// Calls `rpc_id` on an entity with the target declared by its class.
    pub fn call_rpc(&mut self, id: EntityId, rpc_id: u16, payload: &[u8]) -> Result<(), ServerError> {
        let entity = self.live_mut(id)?;
        let target = entity
            .class
            .rpc(rpc_id)
            .map(|rpc| rpc.target)
            .ok_or(ServerError::UnknownRpc {
                class: entity.class.name(),
                rpc: rpc_id,
            })?;
        check_payload(&entity.class, payload)?;
        entity.tracker.rpcs_mut().stage(rpc_id, None, target, payload);
        Ok(())
    }

    /// Calls `rpc_id` addressed to a sub-object with an explicit target.
    pub fn call_rpc_targeted(
        &mut self,
        id: EntityId,
        rpc_id: u16,
        sub_object: Option<u8>,
        target: RpcTarget,
        payload: &[u8],
    ) -> Result<(), ServerError> {
        let entity = self.live_mut(id)?;
        if rpc_id == SYNC_RPC_ID || entity.class.rpc(rpc_id).is_none() {
            return Err(ServerError::UnknownRpc {
                class: entity.class.name(),
                rpc: rpc_id,
            });
        }
        check_payload(&entity.class, payload)?;
        entity
            .tracker
            .rpcs_mut()
            .stage(rpc_id, sub_object, target, payload);
        Ok(())
    }

    /// Sets sync value `sync_id` of an entity. Every player receives the
    /// update, and every later baseline carries the current value.
    pub fn set_sync_value(&mut self, id: EntityId, sync_id: u8, value: &[u8]) -> Result<(), ServerError> {
        let entity = self.live_mut(id)?;
        check_payload(&entity.class, value)?;
        entity.tracker.sync_mut().stage(sync_id, value);
        Ok(())
    }

    // -- Input ------------------------------------------------------------

    /// Queues an input packet from `player`. Returns the number of new
    /// inputs accepted. A malformed packet is dropped whole.
    pub fn receive(&mut self, player: PlayerId, bytes: &[u8]) -> Result<usize, ServerError> {
        let session = self
            .sessions
            .get_mut(&player)
            .ok_or(ServerError::UnknownPlayer(player))?;
        let sim = &self.config.simulation;
        let batch = parse_input_batch(bytes, sim.input_size, sim.delta_inputs).map_err(|source| {
            tracing::warn!(player, error = %source, "dropping malformed input packet");
            ServerError::MalformedInput { player, source }
        })?;
        let accepted = session.enqueue(batch);
        tracing::trace!(player, accepted, "input received");
        Ok(accepted)
    }

    // -- Lag compensation -------------------------------------------------

    /// Rewinds every lag-compensated entity not owned by `player` to what
    /// that player was seeing when it sent its current input. Returns the
    /// number of entities rewound. Must be paired with
    /// [`disable_lag_compensation`](Self::disable_lag_compensation).
    pub fn enable_lag_compensation(&mut self, player: PlayerId) -> Result<usize, ServerError> {
        let session = self
            .sessions
            .get(&player)
            .ok_or(ServerError::UnknownPlayer(player))?;
        let previous = self.tick.wrapping_sub(1);
        let window = session.lag_window().unwrap_or(LagWindow {
            state_a: previous,
            state_b: previous,
            fraction: 0.0,
        });
        let entities = self.entities.iter_mut().enumerate().filter_map(|(i, slot)| {
            let ServerEntity {
                tracker,
                state,
                history,
                ..
            } = slot.as_mut()?;
            Some((
                EntityId(i as u16),
                tracker.header().owner,
                state.as_mut()?,
                history.as_ref()?,
            ))
        });
        self.lag
            .enable(
                player,
                window,
                self.tick,
                self.config.server.lag_compensation_depth,
                entities,
            )
            .ok_or(ServerError::LagCompensationActive)
    }

    /// Restores the present after
    /// [`enable_lag_compensation`](Self::enable_lag_compensation). A no-op
    /// when not active.
    pub fn disable_lag_compensation(&mut self) {
        let entities = self.entities.iter_mut().enumerate().filter_map(|(i, slot)| {
            let ServerEntity { state, history, .. } = slot.as_mut()?;
            Some((EntityId(i as u16), state.as_mut()?, history.as_ref()?))
        });
        self.lag.disable(entities);
    }

    pub fn is_lag_compensated(&self) -> bool {
        self.lag.is_active()
    }

    // -- Update -----------------------------------------------------------

    /// Oldest tick any player may still diff against. Queued RPCs older
    /// than this are pruned and field ticks are clamped up to it.
    pub fn min_acked_tick(&self) -> Tick {
        self.sessions
            .values()
            .filter_map(PlayerSession::retention_floor)
            .filter(|&t| sequence_diff(t, self.tick) <= 0)
            .min_by(|&a, &b| sequence_diff(a, b).cmp(&0))
            .unwrap_or(self.tick)
    }

    /// Advances the simulation by one tick: applies one queued input per
    /// player, updates updateable entities and captures the result for
    /// replication.
    pub fn update(&mut self, logic: &mut impl EntityLogic) {
        if self.lag.is_active() {
            tracing::warn!("lag compensation left enabled across an update; disabling");
            self.disable_lag_compensation();
        }
        self.record_history();
        self.tick = self.tick.wrapping_add(1);

        self.apply_inputs(logic);
        self.run_updates(logic);
        self.capture();
    }

    fn record_history(&mut self) {
        let tick = self.tick;
        for entity in self.entities.iter_mut().flatten() {
            if let (Some(history), Some(state)) = (entity.history.as_mut(), entity.state.as_ref()) {
                history.record(tick, state);
            }
        }
    }

    fn apply_inputs(&mut self, logic: &mut impl EntityLogic) {
        let players: Vec<PlayerId> = self.sessions.keys().copied().collect();
        for player in players {
            let Some(input) = self.sessions.get_mut(&player).and_then(|s| s.next_input()) else {
                continue;
            };
            let mut ctx = LogicContext::new(&self.registry, input.tick, player, false);
            for (i, slot) in self.entities.iter_mut().enumerate() {
                let Some(entity) = slot.as_mut() else {
                    continue;
                };
                if entity.tracker.header().owner != player || !entity.class.flags().controlled {
                    continue;
                }
                if let Some(state) = entity.state.as_mut() {
                    logic.apply_input(&mut ctx, EntityId(i as u16), state, &input.input);
                }
            }
            let spawned = ctx.take_spawned();
            for state in spawned {
                if let Err(err) = self.insert_entity(state, player, input.tick) {
                    tracing::warn!(player, error = %err, "dropping entity spawned from input");
                }
            }
        }
    }

    fn run_updates(&mut self, logic: &mut impl EntityLogic) {
        let mut ctx = LogicContext::new(&self.registry, self.tick, SERVER_PLAYER_ID, false);
        for (i, slot) in self.entities.iter_mut().enumerate() {
            let Some(entity) = slot.as_mut() else {
                continue;
            };
            if !entity.class.flags().updateable {
                continue;
            }
            if let Some(state) = entity.state.as_mut() {
                logic.update(&mut ctx, EntityId(i as u16), state);
            }
        }
        let spawned = ctx.take_spawned();
        let tick = self.tick;
        for state in spawned {
            if let Err(err) = self.insert_entity(state, SERVER_PLAYER_ID, tick) {
                tracing::warn!(error = %err, "dropping entity spawned from update");
            }
        }
    }

    fn capture(&mut self) {
        let tick = self.tick;
        let min_acked = self.min_acked_tick();
        let mut drained = Vec::new();
        for (i, slot) in self.entities.iter_mut().enumerate() {
            let Some(entity) = slot.as_mut() else {
                continue;
            };
            let data = entity.state.as_ref().map(EntityState::data);
            entity.tracker.capture(&entity.class, tick, data, min_acked);
            if entity.tracker.is_drained(min_acked) {
                drained.push(i);
            }
        }
        for i in drained {
            self.entities[i] = None;
            self.ids.release(EntityId(i as u16));
            tracing::trace!(entity = i, tick, "destroyed entity drained");
        }
    }

    // -- Sending ----------------------------------------------------------

    /// Sends every player its baseline or diff for the current tick.
    /// Does nothing on ticks skipped by `server.send_rate`.
    pub fn send_updates(&mut self, transport: &mut impl PlayerTransport) {
        let due = self.send_counter == 0;
        self.send_counter = (self.send_counter + 1) % self.config.server.send_rate.max(1);
        if !due {
            return;
        }

        let players: Vec<PlayerId> = self.sessions.keys().copied().collect();
        for player in players {
            self.check_ack_lag(player);
            let Some(session) = self.sessions.get(&player) else {
                continue;
            };
            match session.diff_base() {
                None => self.send_baseline(player, transport),
                Some(acked) => self.send_diff(player, acked, transport),
            }
        }
    }

    fn check_ack_lag(&mut self, player: PlayerId) {
        let tick = self.tick;
        let max_lag = i32::from(self.config.server.max_ack_lag);
        let Some(session) = self.sessions.get_mut(&player) else {
            return;
        };
        if let Some(base) = session.diff_base()
            && sequence_diff(tick, base) > max_lag
        {
            tracing::warn!(player, base, tick, "acknowledgement too old, resending baseline");
            session.set_state(SessionState::RequestBaseline);
        }
    }

    fn build_payload(&mut self, view: PlayerView) -> Payload {
        let tick = self.tick;
        let mut bytes = Vec::new();
        let mut too_large = Vec::new();
        let mut w = ByteWriter::new(&mut bytes);
        for (i, slot) in self.entities.iter_mut().enumerate() {
            let Some(entity) = slot.as_mut() else {
                continue;
            };
            let id = EntityId(i as u16);
            if entity.tracker.write_record(&mut w, id, &entity.class, &view, tick)
                == RecordOutcome::TooLarge
            {
                too_large.push(id);
            }
        }
        Payload { bytes, too_large }
    }

    fn send_baseline(&mut self, player: PlayerId, transport: &mut impl PlayerTransport) {
        let tick = self.tick;
        let Some(session) = self.sessions.get(&player) else {
            return;
        };
        let view = PlayerView {
            player,
            acked: session.baseline_rpc_floor(tick),
            force_full: true,
        };
        let payload = self.build_payload(view);
        for id in &payload.too_large {
            tracing::warn!(player, entity = id.0, "entity record too large for baseline, omitted");
        }

        let compressed = compress_block(&payload.bytes);
        let mut packet = Vec::with_capacity(compressed.len() + 10);
        BaselineHeader {
            player,
            send_rate: self.config.server.send_rate,
            tick,
            uncompressed_len: payload.bytes.len() as i32,
        }
        .encode(&mut ByteWriter::new(&mut packet));
        packet.extend_from_slice(&compressed);
        transport.send_reliable_ordered(player, &packet);

        if let Some(session) = self.sessions.get_mut(&player) {
            session.baseline_sent(tick);
        }
        tracing::debug!(
            player,
            tick,
            raw = payload.bytes.len(),
            compressed = compressed.len(),
            "baseline sent"
        );
    }

    fn send_diff(&mut self, player: PlayerId, acked: Tick, transport: &mut impl PlayerTransport) {
        let view = PlayerView {
            player,
            acked,
            force_full: false,
        };
        let payload = self.build_payload(view);
        if let Some(id) = payload.too_large.first() {
            tracing::warn!(player, entity = id.0, "diff record too large, resending baseline");
            self.send_baseline(player, transport);
            return;
        }

        let max = transport.max_unreliable_packet_size(player);
        let part_size = max
            .saturating_sub(DIFF_PART_OVERHEAD)
            .clamp(1, usize::from(u16::MAX));
        let parts = payload.bytes.len().div_ceil(part_size).max(1);
        if parts > MAX_DIFF_PARTS {
            tracing::warn!(player, len = payload.bytes.len(), parts, "diff too large, resending baseline");
            self.send_baseline(player, transport);
            return;
        }

        let Some(session) = self.sessions.get(&player) else {
            return;
        };
        let processed = session.processed_input_tick().unwrap_or(0);
        let received = session.received_input_tick().unwrap_or(0);
        let mut packet = Vec::with_capacity(max);
        for index in 0..parts {
            let start = index * part_size;
            let end = (start + part_size).min(payload.bytes.len());
            packet.clear();
            DiffPartHeader {
                tick: self.tick,
                index: index as u8,
                is_final: index + 1 == parts,
                processed_input_tick: processed,
                received_input_tick: received,
                part_size: part_size as u16,
            }
            .encode(&payload.bytes[start..end], &mut packet);
            transport.send_unreliable(player, &packet);
        }
        tracing::trace!(player, tick = self.tick, acked, parts, len = payload.bytes.len(), "diff sent");
    }
}

/// Rejects payloads that could not fit a full record of `class`.
fn check_payload(class: &ClassDescriptor, payload: &[u8]) -> Result<(), ServerError> {
    let max = class.max_call_payload();
    if payload.len() > max {
        return Err(ServerError::PayloadTooLarge {
            class: class.name(),
            len: payload.len(),
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
