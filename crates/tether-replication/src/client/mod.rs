//! Client engine: reassembles server state, interpolates it, and predicts
//! the locally controlled entities ahead of it.
//!
//! The host feeds every received datagram to [`ClientEngine::receive`] and
//! calls [`ClientEngine::tick`] once per fixed tick with the local input.
//! A tick:
//!
//! 1. applies a baseline received since the last tick, if any,
//! 2. advances the interpolation clock and, when it wraps, applies the next
//!    complete diff, rolling back and replaying unacknowledged inputs,
//! 3. runs the new input against the locally controlled entities,
//! 4. sends every unacknowledged input to the server.

mod apply;
mod preload;
mod prediction;
mod reassembly;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytemuck::Pod;
use tether_config::Config;
use tether_net::packet::INPUT_RECORD_HEADER_SIZE;
use tether_net::{
    BaselineHeader, ByteReader, ByteWriter, DeltaCompressor, DiffPart, InputPacketHeader,
    InputRecordHeader, PacketType, PlayerId, Tick, Transport, decompress_block, peek_packet_type,
    sequence_greater_than,
};

pub use apply::ClientEntity;
pub use prediction::PredictedEntity;
pub use reassembly::{PartOutcome, SlotStatus};

use crate::entity::EntityId;
use crate::error::ClientError;
use crate::logic::{ClientCallbacks, EntityLogic};
use crate::schema::SchemaRegistry;
use prediction::{BufferedInput, InputBuffer, PredictedEntities};
use reassembly::StateRing;

/// Diffs waiting beyond this many make the clock skip to the newest.
const MAX_PENDING_STATES: usize = 2;

/// A decompressed baseline waiting for the next tick.
struct PendingBaseline {
    header: BaselineHeader,
    payload: Vec<u8>,
}

/// The client half of the replication protocol.
pub struct ClientEngine {
    registry: Arc<SchemaRegistry>,
    config: Config,
    local_player: PlayerId,
    send_rate: u8,
    connected: bool,
    client_tick: Tick,
    state_a: Tick,
    state_b: Tick,
    lerp: f32,
    processed_input_tick: Option<Tick>,
    ring: StateRing,
    pending_baseline: Option<PendingBaseline>,
    entities: BTreeMap<EntityId, ClientEntity>,
    predicted: PredictedEntities,
    inputs: InputBuffer,
}

impl ClientEngine {
    pub fn new(registry: Arc<SchemaRegistry>, config: &Config) -> Self {
        tracing::info!(
            state_ring_size = config.client.state_ring_size,
            input_size = config.simulation.input_size,
            "client engine created"
        );
        Self {
            registry,
            config: config.clone(),
            local_player: 0,
            send_rate: 1,
            connected: false,
            client_tick: 0,
            state_a: 0,
            state_b: 0,
            lerp: 0.0,
            processed_input_tick: None,
            ring: StateRing::new(config.client.state_ring_size),
            pending_baseline: None,
            entities: BTreeMap::new(),
            predicted: PredictedEntities::default(),
            inputs: InputBuffer::new(config.client.input_buffer_size),
        }
    }

    /// True once a baseline has been applied.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Player id assigned by the server's baseline.
    pub fn local_player(&self) -> Option<PlayerId> {
        self.connected.then_some(self.local_player)
    }

    /// Tick of the most recent local input.
    pub fn client_tick(&self) -> Tick {
        self.client_tick
    }

    /// The two server ticks currently interpolated between.
    pub fn state_ticks(&self) -> (Tick, Tick) {
        (self.state_a, self.state_b)
    }

    /// How far the remote view has moved from `state_a` towards `state_b`.
    pub fn remote_lerp_fraction(&self) -> f32 {
        self.lerp
    }

    /// Last input tick the server reported processed.
    pub fn processed_input_tick(&self) -> Option<Tick> {
        self.processed_input_tick
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn entity(&self, id: EntityId) -> Option<&ClientEntity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &ClientEntity)> {
        self.entities.iter().map(|(&id, e)| (id, e))
    }

    /// Reads field `field` of entity `id` blended at `fraction`.
    ///
    /// Remote entities blend between the two applied server states (use
    /// [`remote_lerp_fraction`](Self::remote_lerp_fraction)); locally
    /// controlled ones between their last two predicted ticks.
    pub fn interpolated<T: Pod>(&self, id: EntityId, field: usize, fraction: f32) -> Result<T, ClientError> {
        let entity = self.entities.get(&id).ok_or(ClientError::UnknownEntity(id))?;
        let mut value: T = bytemuck::Zeroable::zeroed();
        entity.interpolate_field(field, fraction, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    pub fn predicted_entities(&self) -> impl Iterator<Item = &PredictedEntity> {
        self.predicted.iter()
    }

    /// Mutable access to a predicted entity, for hosts that advance it.
    pub fn predicted_entity_mut(&mut self, local_id: u16) -> Option<&mut PredictedEntity> {
        self.predicted.get_mut(local_id)
    }

    /// Inputs sent but not yet processed by the server.
    pub fn buffered_inputs(&self) -> usize {
        self.inputs.len()
    }

    // -- Receive ----------------------------------------------------------

    /// Takes one datagram from the server.
    ///
    /// Baselines are decompressed and applied at the next tick. Diff parts
    /// are stored for reassembly; stale ones are dropped silently.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        match peek_packet_type(bytes)? {
            PacketType::Baseline => self.receive_baseline(bytes),
            PacketType::DiffPart | PacketType::DiffFinal => {
                self.receive_diff_part(bytes)?;
                Ok(())
            }
            other => Err(tether_net::WireError::UnexpectedPacketType(other).into()),
        }
    }

    fn receive_baseline(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut r = ByteReader::new(bytes);
        let header = BaselineHeader::decode(&mut r)?;
        let payload = decompress_block(r.rest(), header.uncompressed_len as usize)
            .map_err(tether_net::WireError::from)?;
        tracing::debug!(
            tick = header.tick,
            player = header.player,
            len = payload.len(),
            "baseline received"
        );
        self.ring.clear();
        self.pending_baseline = Some(PendingBaseline { header, payload });
        Ok(())
    }

    fn receive_diff_part(&mut self, bytes: &[u8]) -> Result<PartOutcome, ClientError> {
        let part = DiffPart::decode(bytes)?;
        let newest = match &self.pending_baseline {
            Some(pending) => pending.header.tick,
            None if self.connected => self.state_b,
            None => {
                tracing::trace!(tick = part.tick, "diff before baseline dropped");
                return Ok(PartOutcome::Duplicate);
            }
        };
        if !sequence_greater_than(part.tick, newest) {
            tracing::trace!(tick = part.tick, newest, "stale diff part dropped");
            return Ok(PartOutcome::Duplicate);
        }
        let outcome = self.ring.insert(&part);
        if outcome == PartOutcome::Completed {
            tracing::trace!(tick = part.tick, "diff reassembled");
        }
        Ok(outcome)
    }

    // -- Tick -------------------------------------------------------------

    /// Advances the client by one fixed tick with the local `input`.
    pub fn tick(
        &mut self,
        input: &[u8],
        logic: &mut impl EntityLogic,
        callbacks: &mut impl ClientCallbacks,
        transport: &mut impl Transport,
    ) -> Result<(), ClientError> {
        let expected = self.config.simulation.input_size;
        if input.len() != expected {
            return Err(ClientError::InputSize {
                expected,
                actual: input.len(),
            });
        }
        if let Some(pending) = self.pending_baseline.take() {
            self.apply_baseline(pending, logic, callbacks)?;
        }
        if !self.connected {
            return Err(ClientError::NotConnected);
        }

        self.advance_interpolation(logic, callbacks);
        self.predict(input, logic);
        self.send_inputs(transport);
        Ok(())
    }

    fn apply_baseline(
        &mut self,
        pending: PendingBaseline,
        logic: &mut impl EntityLogic,
        callbacks: &mut impl ClientCallbacks,
    ) -> Result<(), ClientError> {
        let PendingBaseline { header, payload } = pending;
        let floor = self.connected.then_some(self.state_b);
        let index = preload::preload(&payload, &self.registry, &self.entities, header.player, floor)?;

        self.local_player = header.player;
        self.send_rate = header.send_rate.max(1);
        apply::apply(
            &payload,
            &index,
            &mut self.entities,
            &mut self.predicted,
            self.local_player,
            callbacks,
        );

        let present: BTreeSet<EntityId> = index.records.iter().map(|r| r.id).collect();
        let absent: Vec<EntityId> = self
            .entities
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        for id in absent {
            if let Some(old) = self.entities.remove(&id) {
                callbacks.on_destroyed(id, old.state());
            }
        }

        if !self.connected {
            self.client_tick = header.tick;
        }
        self.connected = true;
        self.state_a = header.tick;
        self.state_b = header.tick;
        self.lerp = 0.0;
        tracing::info!(
            tick = header.tick,
            player = self.local_player,
            entities = self.entities.len(),
            "baseline applied"
        );
        prediction::rollback(
            &mut self.entities,
            &self.inputs,
            &self.registry,
            self.local_player,
            logic,
        );
        Ok(())
    }

    fn advance_interpolation(&mut self, logic: &mut impl EntityLogic, callbacks: &mut impl ClientCallbacks) {
        self.lerp += 1.0 / f32::from(self.send_rate);
        if self.lerp < 1.0 {
            return;
        }
        let ready = self.ring.ready_after(self.state_b);
        let next = if ready.len() > MAX_PENDING_STATES {
            ready.last()
        } else {
            ready.first()
        };
        match next {
            Some(&tick) => {
                if self.apply_state(tick, logic, callbacks) {
                    self.lerp = 0.0;
                } else {
                    self.lerp = 1.0;
                }
            }
            None => self.lerp = 1.0,
        }
    }

    /// Applies the reassembled diff for `tick`. Returns false when the
    /// payload was unusable and skipped.
    fn apply_state(
        &mut self,
        tick: Tick,
        logic: &mut impl EntityLogic,
        callbacks: &mut impl ClientCallbacks,
    ) -> bool {
        let Some(slot) = self.ring.get_mut(tick) else {
            return false;
        };
        if slot.status() == SlotStatus::Ready {
            match preload::preload(
                slot.bytes(),
                &self.registry,
                &self.entities,
                self.local_player,
                Some(self.state_b),
            ) {
                Ok(index) => {
                    slot.preload = Some(index);
                    slot.set_status(SlotStatus::Preloaded);
                }
                Err(e) => {
                    tracing::warn!(tick, error = %e, "damaged diff skipped");
                    slot.set_status(SlotStatus::Executed);
                    return false;
                }
            }
        }
        let Some(index) = slot.preload.take() else {
            return false;
        };
        apply::apply(
            slot.bytes(),
            &index,
            &mut self.entities,
            &mut self.predicted,
            self.local_player,
            callbacks,
        );
        slot.set_status(SlotStatus::Executed);
        let input_ticks = slot.input_ticks();

        self.state_a = self.state_b;
        self.state_b = tick;
        tracing::trace!(state_a = self.state_a, state_b = self.state_b, "state applied");

        // Zero in both means the server had no input from us yet.
        if let Some((processed, received)) = input_ticks
            && (processed, received) != (0, 0)
        {
            self.processed_input_tick = Some(processed);
            self.inputs.acknowledge(processed);
        }
        prediction::rollback(
            &mut self.entities,
            &self.inputs,
            &self.registry,
            self.local_player,
            logic,
        );
        if let Some(processed) = self.processed_input_tick {
            for expired in self.predicted.expire(processed) {
                tracing::debug!(
                    local_id = expired.local_id(),
                    creation_tick = expired.creation_tick(),
                    "predicted entity not confirmed"
                );
                callbacks.on_predicted_destroyed(expired.local_id(), None);
            }
        }
        true
    }

    fn predict(&mut self, input: &[u8], logic: &mut impl EntityLogic) {
        self.client_tick = self.client_tick.wrapping_add(1);
        let mut record = Vec::with_capacity(INPUT_RECORD_HEADER_SIZE + input.len());
        let mut w = ByteWriter::new(&mut record);
        InputRecordHeader {
            state_a: self.state_a,
            state_b: self.state_b,
            fraction: self.lerp.clamp(0.0, 1.0),
        }
        .encode(&mut w);
        w.write_bytes(input);

        for entity in self.entities.values_mut() {
            if entity.is_locally_controlled(self.local_player) {
                entity.shift_interpolation();
            }
        }
        let spawned = prediction::predict_step(
            &mut self.entities,
            &self.registry,
            self.local_player,
            self.client_tick,
            input,
            false,
            logic,
        );
        for entity in self.entities.values_mut() {
            if entity.is_locally_controlled(self.local_player) {
                entity.capture_interpolation();
            }
        }
        for (parent, state) in spawned {
            let local_id = self.predicted.spawn(parent, self.client_tick, state);
            tracing::trace!(local_id, parent = parent.0, tick = self.client_tick, "entity predicted");
        }
        self.inputs.push(BufferedInput {
            tick: self.client_tick,
            record,
        });
    }

    /// Sends every buffered input, packing as many chunks per datagram as
    /// fit. The first chunk of each datagram is a full record so datagrams
    /// decode independently.
    fn send_inputs(&self, transport: &mut impl Transport) {
        let max = transport.max_unreliable_packet_size();
        let delta = self.config.simulation.delta_inputs;
        let codec = DeltaCompressor::new(INPUT_RECORD_HEADER_SIZE + self.config.simulation.input_size);

        let mut packet = Vec::new();
        let mut chunks = 0usize;
        let mut prev: Option<&[u8]> = None;
        let mut chunk = Vec::new();
        for input in self.inputs.iter() {
            chunk.clear();
            match prev {
                Some(prev) if delta && chunks > 0 => {
                    codec.encode(prev, &input.record, &mut chunk);
                }
                _ => chunk.extend_from_slice(&input.record),
            }
            if chunks > 0 && packet.len() + 2 + chunk.len() > max {
                transport.send_unreliable(&packet);
                packet.clear();
                chunks = 0;
                chunk.clear();
                chunk.extend_from_slice(&input.record);
            }
            let mut w = ByteWriter::new(&mut packet);
            if chunks == 0 {
                InputPacketHeader {
                    start_tick: input.tick,
                }
                .encode(&mut w);
            }
            w.write_u16(chunk.len() as u16);
            w.write_bytes(&chunk);
            chunks += 1;
            prev = Some(input.record.as_slice());
        }
        if chunks > 0 {
            transport.send_unreliable(&packet);
        }
    }
}

impl std::fmt::Debug for ClientEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEngine")
            .field("local_player", &self.local_player)
            .field("connected", &self.connected)
            .field("client_tick", &self.client_tick)
            .field("state_a", &self.state_a)
            .field("state_b", &self.state_b)
            .field("entities", &self.entities.len())
            .field("predicted", &self.predicted.len())
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
