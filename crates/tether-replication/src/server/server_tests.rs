//! Unit tests for the server engine.

use std::collections::BTreeMap;

use tether_net::packet::INPUT_RECORD_HEADER_SIZE;
use tether_net::{
    ByteReader, DiffPart, InputPacketHeader, MemoryTransport, PacketType, decompress_block,
};
use tether_net::packet::{InputRecordHeader, peek_packet_type};

use super::*;
use crate::entity::ENTITY_HEADER_SIZE;
use crate::rpc::RPC_ENTRY_HEADER_SIZE;
use crate::schema::{ClassBuilder, FieldDescriptor, MAX_RECORD_SIZE, lerp_f32};

const INPUT_SIZE: usize = 4;

struct Fixture {
    avatar: ClassId,
    shot: ClassId,
    target: ClassId,
    blob: ClassId,
    registry: Arc<SchemaRegistry>,
}

fn fixture() -> Fixture {
    let mut registry = SchemaRegistry::new();
    let avatar = registry
        .register(
            ClassBuilder::new("avatar")
                .controlled()
                .field(FieldDescriptor::new::<f32>("x").interpolated(lerp_f32))
                .rpc(1, "hit", RpcTarget::All),
        )
        .unwrap();
    let shot = registry
        .register(ClassBuilder::new("shot").field(FieldDescriptor::new::<u16>("fuse")))
        .unwrap();
    let target = registry
        .register(
            ClassBuilder::new("target")
                .updateable()
                .field(FieldDescriptor::new::<f32>("x").interpolated(lerp_f32).lag_compensated()),
        )
        .unwrap();
    let blob = registry
        .register(ClassBuilder::new("blob").field(FieldDescriptor::with_size("data", 3_000)))
        .unwrap();
    Fixture {
        avatar,
        shot,
        target,
        blob,
        registry: Arc::new(registry),
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.simulation.input_size = INPUT_SIZE;
    config.server.max_players = 4;
    config.server.max_entities = 16;
    config.server.lag_compensation_depth = 8;
    config
}

fn engine(fx: &Fixture, config: &Config) -> ServerEngine {
    ServerEngine::new(fx.registry.clone(), config)
}

/// Moves controlled entities by the input's `f32`, spawns a shot when it is
/// negative, and drifts updateable entities by one per tick.
struct Sim {
    shot: ClassId,
}

impl EntityLogic for Sim {
    fn apply_input(
        &mut self,
        ctx: &mut LogicContext<'_>,
        _id: EntityId,
        entity: &mut EntityState,
        input: &[u8],
    ) {
        let dx = f32::from_le_bytes(input[..4].try_into().unwrap());
        let x: f32 = entity.read(0).unwrap();
        entity.write(0, x + dx).unwrap();
        if dx < 0.0
            && let Some(shot) = ctx.spawn(self.shot)
        {
            shot.write(0, 30u16).unwrap();
        }
    }

    fn update(&mut self, _ctx: &mut LogicContext<'_>, _id: EntityId, entity: &mut EntityState) {
        let x: f32 = entity.read(0).unwrap();
        entity.write(0, x + 1.0).unwrap();
    }
}

fn input_packet(start: Tick, state_b: Tick, dx: f32) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut w = ByteWriter::new(&mut buf);
    InputPacketHeader { start_tick: start }.encode(&mut w);
    w.write_u16((INPUT_RECORD_HEADER_SIZE + INPUT_SIZE) as u16);
    InputRecordHeader {
        state_a: state_b.wrapping_sub(1),
        state_b,
        fraction: 0.0,
    }
    .encode(&mut w);
    w.write_f32(dx);
    buf
}

fn transports(players: &[PlayerId]) -> BTreeMap<PlayerId, MemoryTransport> {
    players
        .iter()
        .map(|&p| (p, MemoryTransport::new(1200)))
        .collect()
}

fn decode_baseline(bytes: &[u8]) -> (BaselineHeader, Vec<u8>) {
    let header = BaselineHeader::decode(&mut ByteReader::new(bytes)).unwrap();
    let payload = decompress_block(&bytes[10..], header.uncompressed_len as usize).unwrap();
    (header, payload)
}

/// (entity id, is_full) of every record in a payload.
fn records(payload: &[u8]) -> Vec<(u16, bool)> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < payload.len() {
        let word = u16::from_le_bytes([payload[at], payload[at + 1]]);
        let id = u16::from_le_bytes([payload[at + 2], payload[at + 3]]);
        out.push((id, word & 1 == 1));
        at += usize::from(word >> 1);
    }
    out
}

#[test]
fn test_player_capacity() {
    let fx = fixture();
    let mut config = config();
    config.server.max_players = 2;
    let mut server = engine(&fx, &config);
    assert_eq!(server.add_player().unwrap(), 1);
    assert_eq!(server.add_player().unwrap(), 2);
    assert!(matches!(server.add_player(), Err(ServerError::PlayerCapacity(2))));

    server.remove_player(1).unwrap();
    assert_eq!(server.add_player().unwrap(), 1);
    assert!(matches!(server.remove_player(9), Err(ServerError::UnknownPlayer(9))));
}

#[test]
fn test_entity_capacity() {
    let fx = fixture();
    let mut config = config();
    config.server.max_entities = 2;
    let mut server = engine(&fx, &config);
    server.create_entity(fx.shot, SERVER_PLAYER_ID).unwrap();
    server.create_entity(fx.shot, SERVER_PLAYER_ID).unwrap();
    assert!(matches!(
        server.create_entity(fx.shot, SERVER_PLAYER_ID),
        Err(ServerError::EntityCapacity(2))
    ));
    assert!(matches!(
        server.create_entity(99, SERVER_PLAYER_ID),
        Err(ServerError::UnknownClass(99))
    ));
}

#[test]
fn test_baseline_then_diff() {
    let fx = fixture();
    let mut server = engine(&fx, &config());
    let mut sim = Sim { shot: fx.shot };
    let player = server.add_player().unwrap();
    let id = server.create_entity(fx.avatar, player).unwrap();
    server.update(&mut sim);

    let mut net = transports(&[player]);
    server.send_updates(&mut net);
    let sent = net.get_mut(&player).unwrap().drain();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].reliable);
    let (header, payload) = decode_baseline(&sent[0].bytes);
    assert_eq!((header.player, header.tick, header.send_rate), (player, 1, 1));
    assert_eq!(records(&payload), [(id.0, true)]);
    assert_eq!(
        payload.len(),
        2 + 2 + ENTITY_HEADER_SIZE + 4 + 2,
        "one full avatar record"
    );
    assert_eq!(
        server.session(player).unwrap().state(),
        SessionState::WaitingForFirstInput { baseline_tick: 1 }
    );

    // Until acknowledged, diffs are relative to the baseline: nothing changed.
    server.update(&mut sim);
    server.send_updates(&mut net);
    let sent = net.get_mut(&player).unwrap().drain();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].reliable);
    let part = DiffPart::decode(&sent[0].bytes).unwrap();
    assert!(part.is_final);
    assert_eq!(part.tick, 2);
    assert!(part.payload.is_empty());

    server.receive(player, &input_packet(7, 1, 2.5)).unwrap();
    assert_eq!(server.session(player).unwrap().state(), SessionState::Active);
    server.update(&mut sim);
    assert_eq!(server.entity(id).unwrap().read::<f32>(0).unwrap(), 2.5);

    server.send_updates(&mut net);
    let sent = net.get_mut(&player).unwrap().drain();
    let part = DiffPart::decode(&sent[0].bytes).unwrap();
    assert_eq!(part.input_ticks, Some((7, 7)));
    assert_eq!(records(part.payload), [(id.0, false)]);
}

#[test]
fn test_malformed_input_rejected_per_player() {
    let fx = fixture();
    let mut server = engine(&fx, &config());
    let a = server.add_player().unwrap();
    let b = server.add_player().unwrap();

    let mut truncated = input_packet(1, 0, 1.0);
    truncated.pop();
    assert!(matches!(
        server.receive(a, &truncated),
        Err(ServerError::MalformedInput { player, .. }) if player == a
    ));
    assert!(server.receive(a, &[0x7E, 9, 0, 0]).is_err());
    assert_eq!(server.session(a).unwrap().queued_inputs(), 0);

    assert_eq!(server.receive(b, &input_packet(1, 0, 1.0)).unwrap(), 1);
    // A repeated packet adds nothing.
    assert_eq!(server.receive(b, &input_packet(1, 0, 1.0)).unwrap(), 0);
    assert_eq!(server.session(b).unwrap().queued_inputs(), 1);
}

#[test]
fn test_spawn_from_input_takes_input_tick() {
    let fx = fixture();
    let mut server = engine(&fx, &config());
    let mut sim = Sim { shot: fx.shot };
    let player = server.add_player().unwrap();
    server.create_entity(fx.avatar, player).unwrap();
    server.update(&mut sim);

    server.receive(player, &input_packet(40, 1, -1.0)).unwrap();
    server.update(&mut sim);

    let shots: Vec<EntityId> = server
        .entity_ids()
        .into_iter()
        .filter(|&id| server.header(id).unwrap().class_id == fx.shot)
        .collect();
    assert_eq!(shots.len(), 1);
    let header = server.header(shots[0]).unwrap();
    assert_eq!((header.owner, header.creation_tick), (player, 40));
    assert_eq!(server.entity(shots[0]).unwrap().read::<u16>(0).unwrap(), 30);
    assert_eq!(server.session(player).unwrap().processed_input_tick(), Some(40));
}

#[test]
fn test_destroyed_entity_drains_then_recycles() {
    let fx = fixture();
    let mut config = config();
    config.server.max_entities = 1;
    let mut server = engine(&fx, &config);
    let mut sim = Sim { shot: fx.shot };
    let player = server.add_player().unwrap();
    let mut net = transports(&[player]);

    let id = server.create_entity(fx.shot, SERVER_PLAYER_ID).unwrap();
    server.update(&mut sim);
    server.send_updates(&mut net);
    server.receive(player, &input_packet(1, 1, 0.0)).unwrap();

    server.destroy_entity(id).unwrap();
    assert!(server.entity(id).is_none());
    server.update(&mut sim);
    // The player has not acknowledged the destruction yet.
    assert!(server.header(id).unwrap().destroyed);
    assert!(matches!(
        server.create_entity(fx.shot, SERVER_PLAYER_ID),
        Err(ServerError::EntityCapacity(1))
    ));
    server.send_updates(&mut net);
    let sent = net.get_mut(&player).unwrap().drain();
    let part = DiffPart::decode(&sent.last().unwrap().bytes).unwrap();
    assert_eq!(records(part.payload), [(id.0, true)]);

    server.receive(player, &input_packet(2, 2, 0.0)).unwrap();
    server.update(&mut sim);
    assert!(server.header(id).is_some());
    // Acknowledging tick 3 moves the player's older state past the destroy.
    server.receive(player, &input_packet(3, 3, 0.0)).unwrap();
    server.update(&mut sim);
    assert!(server.header(id).is_none());

    let reused = server.create_entity(fx.shot, SERVER_PLAYER_ID).unwrap();
    assert_eq!(reused, id);
    assert_eq!(server.header(reused).unwrap().version, 1);
}

#[test]
fn test_entity_never_replicated_is_freed_at_once() {
    let fx = fixture();
    let mut config = config();
    config.server.max_entities = 1;
    let mut server = engine(&fx, &config);
    let id = server.create_entity(fx.shot, SERVER_PLAYER_ID).unwrap();
    server.destroy_entity(id).unwrap();
    assert!(matches!(server.destroy_entity(id), Err(ServerError::UnknownEntity(_))));
    server.create_entity(fx.shot, SERVER_PLAYER_ID).unwrap();
}

#[test]
fn test_multi_part_diff() {
    let fx = fixture();
    let mut server = engine(&fx, &config());
    let mut sim = Sim { shot: fx.shot };
    let player = server.add_player().unwrap();
    let mut net = transports(&[player]);
    let id = server.create_entity(fx.blob, SERVER_PLAYER_ID).unwrap();
    server.update(&mut sim);
    server.send_updates(&mut net);
    net.get_mut(&player).unwrap().drain();
    server.receive(player, &input_packet(1, 1, 0.0)).unwrap();

    server.entity_mut(id).unwrap().data_mut().fill(0x55);
    server.update(&mut sim);
    server.send_updates(&mut net);
    let sent = net.get_mut(&player).unwrap().drain();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|p| !p.reliable && p.bytes.len() <= 1200));

    let parts: Vec<DiffPart<'_>> = sent.iter().map(|p| DiffPart::decode(&p.bytes).unwrap()).collect();
    assert_eq!(peek_packet_type(&sent[0].bytes).unwrap(), PacketType::DiffPart);
    assert_eq!(peek_packet_type(&sent[2].bytes).unwrap(), PacketType::DiffFinal);
    let part_size = usize::from(parts[2].part_size.unwrap());
    assert_eq!(parts[0].payload.len(), part_size);
    assert_eq!(parts[1].payload.len(), part_size);

    let payload: Vec<u8> = parts.iter().flat_map(|p| p.payload.iter().copied()).collect();
    assert_eq!(records(&payload), [(id.0, false)]);
}

#[test]
fn test_stale_acknowledgement_triggers_baseline() {
    let fx = fixture();
    let mut config = config();
    config.server.max_ack_lag = 4;
    let mut server = engine(&fx, &config);
    let mut sim = Sim { shot: fx.shot };
    let player = server.add_player().unwrap();
    let mut net = transports(&[player]);

    server.update(&mut sim);
    server.send_updates(&mut net);
    server.receive(player, &input_packet(1, 1, 0.0)).unwrap();
    for _ in 0..4 {
        server.update(&mut sim);
        server.send_updates(&mut net);
    }
    assert!(net.get_mut(&player).unwrap().drain().iter().skip(1).all(|p| !p.reliable));

    server.update(&mut sim);
    server.send_updates(&mut net);
    let sent = net.get_mut(&player).unwrap().drain();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].reliable);
    assert_eq!(server.session(player).unwrap().last_baseline_tick(), Some(6));
}

#[test]
fn test_send_rate_skips_ticks() {
    let fx = fixture();
    let mut config = config();
    config.server.send_rate = 3;
    let mut server = engine(&fx, &config);
    let mut sim = Sim { shot: fx.shot };
    let player = server.add_player().unwrap();
    let mut net = transports(&[player]);
    for _ in 0..6 {
        server.update(&mut sim);
        server.send_updates(&mut net);
    }
    let sent = net.get_mut(&player).unwrap().drain();
    assert_eq!(sent.len(), 2);
    assert_eq!(decode_baseline(&sent[0].bytes).0.send_rate, 3);
}

#[test]
fn test_rpc_validation() {
    let fx = fixture();
    let mut server = engine(&fx, &config());
    let id = server.create_entity(fx.avatar, SERVER_PLAYER_ID).unwrap();
    server.call_rpc(id, 1, b"ouch").unwrap();
    assert!(matches!(
        server.call_rpc(id, 2, b""),
        Err(ServerError::UnknownRpc { rpc: 2, .. })
    ));
    assert!(server
        .call_rpc_targeted(id, SYNC_RPC_ID, None, RpcTarget::All, b"")
        .is_err());
    server.set_sync_value(id, 0, b"name").unwrap();

    server.update(&mut Sim { shot: fx.shot });
    // The call and the sync update, pruned once nobody needs them.
    assert_eq!(server.pending_rpcs(id), 2);
    server.update(&mut Sim { shot: fx.shot });
    assert_eq!(server.pending_rpcs(id), 0);
}

#[test]
fn test_lag_compensation_rewinds_and_restores() {
    let fx = fixture();
    let mut server = engine(&fx, &config());
    let mut sim = Sim { shot: fx.shot };
    let player = server.add_player().unwrap();
    let target = server.create_entity(fx.target, SERVER_PLAYER_ID).unwrap();
    // History holds x == t for every recorded tick t.
    for _ in 0..6 {
        server.update(&mut sim);
    }
    let now: f32 = server.entity(target).unwrap().read(0).unwrap();

    // The player reports it was seeing ticks 2..3 at fraction 0.5.
    let mut packet = input_packet(1, 3, 0.0);
    packet[10..14].copy_from_slice(&0.5f32.to_le_bytes());
    server.receive(player, &packet).unwrap();

    assert_eq!(server.enable_lag_compensation(player).unwrap(), 1);
    let rewound: f32 = server.entity(target).unwrap().read(0).unwrap();
    assert_eq!(rewound, 2.5);
    assert!(matches!(
        server.enable_lag_compensation(player),
        Err(ServerError::LagCompensationActive)
    ));

    server.disable_lag_compensation();
    assert_eq!(server.entity(target).unwrap().read::<f32>(0).unwrap(), now);
    server.disable_lag_compensation();

    // Left enabled, the next update restores the present before simulating.
    server.enable_lag_compensation(player).unwrap();
    server.update(&mut sim);
    assert!(!server.is_lag_compensated());
    assert_eq!(server.entity(target).unwrap().read::<f32>(0).unwrap(), now + 1.0);
}

#[test]
fn test_oversize_diff_resends_baseline_with_entity() {
    let fx = fixture();
    let mut server = engine(&fx, &config());
    let mut sim = Sim { shot: fx.shot };
    let player = server.add_player().unwrap();
    let id = server.create_entity(fx.avatar, SERVER_PLAYER_ID).unwrap();
    let mut net = transports(&[player]);
    server.update(&mut sim);
    server.send_updates(&mut net);
    server.receive(player, &input_packet(1, 1, 0.0)).unwrap();
    server.update(&mut sim);
    server.send_updates(&mut net);
    assert_eq!(server.session(player).unwrap().state(), SessionState::Active);
    net.get_mut(&player).unwrap().drain();

    server.call_rpc(id, 1, &[3; 20_000]).unwrap();
    server.call_rpc(id, 1, &[4; 20_000]).unwrap();
    server.update(&mut sim);
    server.send_updates(&mut net);
    let sent = net.get_mut(&player).unwrap().drain();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].reliable);
    let (header, payload) = decode_baseline(&sent[0].bytes);
    assert_eq!(header.tick, server.tick());
    // The entity stays; only the call that no longer fits is cut.
    assert_eq!(records(&payload), [(id.0, true)]);
    assert_eq!(
        payload.len(),
        2 + 2 + ENTITY_HEADER_SIZE + 4 + 2 + RPC_ENTRY_HEADER_SIZE + 20_000
    );
    assert_eq!(
        server.session(player).unwrap().state(),
        SessionState::WaitingForFirstInput {
            baseline_tick: server.tick()
        }
    );
}

#[test]
fn test_payloads_bounded_by_record_size() {
    let fx = fixture();
    let mut server = engine(&fx, &config());
    let id = server.create_entity(fx.avatar, SERVER_PLAYER_ID).unwrap();
    let class = fx.registry.get(fx.avatar).unwrap();
    let max = class.max_call_payload();
    assert_eq!(max, MAX_RECORD_SIZE - class.full_record_size() - RPC_ENTRY_HEADER_SIZE);

    server.call_rpc(id, 1, &vec![0; max]).unwrap();
    let over = vec![0; max + 1];
    assert!(matches!(
        server.call_rpc(id, 1, &over),
        Err(ServerError::PayloadTooLarge { len, .. }) if len == max + 1
    ));
    assert!(matches!(
        server.call_rpc_targeted(id, 1, Some(0), RpcTarget::Owner, &over),
        Err(ServerError::PayloadTooLarge { .. })
    ));
    assert!(matches!(
        server.set_sync_value(id, 0, &over),
        Err(ServerError::PayloadTooLarge { .. })
    ));
}
