//! Integration tests for the world session engine
//!
//! These tests drive a `WorldSession` end to end through its public API:
//! - Status gating and deferral of early packets
//! - Flood protection under each policy
//! - Addon negotiation, query callbacks and logout

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use realmcore_server::auth::{AccountInfo, BanMode, InMemoryAccountBans};
use realmcore_server::db::callback::{CallbackSlot, QueryCompletion, QueryParam};
use realmcore_server::db::{MemoryDatabase, Statement};
use realmcore_server::game::{PlayerEntity, WorldHandlers};
use realmcore_server::net::buffer::{BufferError, ByteBuffer};
use realmcore_server::net::filter::UpdateFilter;
use realmcore_server::net::flood::{FloodPolicy, FloodSettings};
use realmcore_server::net::manager::SessionManager;
use realmcore_server::net::packet::WorldPacket;
use realmcore_server::net::session::{unix_now, SessionServices, SessionSettings, WorldSession};
use realmcore_server::net::transport::{MemoryTransport, Transport};
use realmcore_server::protocol::addon::{AddonRegistry, ADDON_PUBLIC_KEY, STANDARD_ADDON_CRC};
use realmcore_server::protocol::opcodes::*;

const ACCOUNT_ID: u32 = 9;

// ============ Fixtures ============

/// Handlers that record what reached them
#[derive(Default)]
struct RecordingHandlers {
    handled: Mutex<Vec<u16>>,
    completed: Mutex<Vec<CallbackSlot>>,
}

impl RecordingHandlers {
    fn handled(&self) -> Vec<u16> {
        self.handled.lock().clone()
    }

    fn count(&self, opcode: u16) -> usize {
        self.handled.lock().iter().filter(|&&op| op == opcode).count()
    }
}

impl WorldHandlers for RecordingHandlers {
    fn handle(&self, _session: &mut WorldSession, packet: &mut WorldPacket) -> Result<(), BufferError> {
        self.handled.lock().push(packet.opcode());
        packet.rfinish();
        Ok(())
    }

    fn on_query_complete(&self, _session: &mut WorldSession, completion: QueryCompletion) {
        self.completed.lock().push(completion.slot);
    }
}

struct TestPlayer {
    in_world: bool,
    pending_teleports: Arc<AtomicU32>,
    logged_out: Arc<AtomicBool>,
}

impl TestPlayer {
    fn in_world() -> Self {
        Self {
            in_world: true,
            pending_teleports: Arc::new(AtomicU32::new(0)),
            logged_out: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl PlayerEntity for TestPlayer {
    fn guid_low(&self) -> u32 {
        1001
    }

    fn name(&self) -> &str {
        "Thrall"
    }

    fn is_in_world(&self) -> bool {
        self.in_world
    }

    fn is_being_teleported_far(&self) -> bool {
        self.pending_teleports.load(Ordering::SeqCst) > 0
    }

    fn finish_far_teleport(&mut self) -> bool {
        self.pending_teleports.fetch_sub(1, Ordering::SeqCst);
        true
    }

    fn on_logout(&mut self, _save: bool, _socket_alive: bool) {
        self.logged_out.store(true, Ordering::SeqCst);
    }
}

struct Harness {
    session: WorldSession,
    transport: Arc<MemoryTransport>,
    handlers: Arc<RecordingHandlers>,
    bans: Arc<InMemoryAccountBans>,
    database: Arc<MemoryDatabase>,
}

impl Harness {
    fn new(settings: SessionSettings) -> Self {
        let transport = Arc::new(MemoryTransport::new("192.0.2.7:51000"));
        let handlers = Arc::new(RecordingHandlers::default());
        let bans = Arc::new(InMemoryAccountBans::new());
        let database = Arc::new(MemoryDatabase::new());
        bans.register_account(ACCOUNT_ID, "tester");

        let services = SessionServices {
            opcodes: Arc::new(OpcodeTable::standard().unwrap()),
            handlers: handlers.clone(),
            database: database.clone(),
            bans: bans.clone(),
            addons: Arc::new(AddonRegistry::new()),
            settings: Arc::new(settings),
        };
        let session = WorldSession::new(AccountInfo::new(ACCOUNT_ID), transport.clone(), services);

        Self {
            session,
            transport,
            handlers,
            bans,
            database,
        }
    }

    fn with_policy(policy: FloodPolicy) -> Self {
        Self::new(SessionSettings {
            flood: Arc::new(FloodSettings {
                policy,
                ban_mode: BanMode::Account,
                ban_duration: None,
            }),
            ..Default::default()
        })
    }

    fn push(&self, opcode: u16, now: u64) {
        self.session.inbox().queue_packet(WorldPacket::from_payload(opcode, &[]), now);
    }

    fn queued(&self) -> usize {
        self.session.inbox().queue().len()
    }
}

fn addon_blob(entries: &[(&str, u32)]) -> ByteBuffer {
    let mut raw = ByteBuffer::new();
    raw.write_u32(entries.len() as u32);
    for (name, crc) in entries {
        raw.write_cstring(name);
        raw.write_u8(1);
        raw.write_u32(*crc);
        raw.write_u32(0);
    }
    let raw = raw.as_bytes().to_vec();

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut blob = ByteBuffer::new();
    blob.write_u32(raw.len() as u32);
    blob.write_bytes(&compressed);
    blob
}

// ============ Status gating ============

#[test]
fn test_never_allowed_and_unhandled_never_reach_handlers() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();

    h.push(CMSG_AUTH_SESSION, now);
    h.push(SMSG_CHAR_ENUM, now);
    h.push(CMSG_WARDEN_DATA, now);
    h.push(0x1234, now);
    h.push(CMSG_BUG, now);

    assert!(h.session.update_at(UpdateFilter::World, now));
    assert_eq!(h.handlers.handled(), vec![CMSG_BUG]);
    assert_eq!(h.queued(), 0);
    assert!(!h.transport.is_closed());
}

#[test]
fn test_authed_only_dropped_while_queued() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();
    h.session.set_in_queue(true);

    h.push(CMSG_CHAR_ENUM, now);
    h.session.update_at(UpdateFilter::World, now);

    assert!(h.handlers.handled().is_empty());
    assert_eq!(h.queued(), 0);
}

#[test]
fn test_authed_only_handled_while_in_world() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();
    h.session.set_player(Box::new(TestPlayer::in_world()));

    h.push(CMSG_BUG, now);
    h.push(CMSG_UPDATE_ACCOUNT_DATA, now);
    h.session.update_at(UpdateFilter::World, now);

    assert_eq!(h.handlers.handled(), vec![CMSG_BUG, CMSG_UPDATE_ACCOUNT_DATA]);
    assert_eq!(h.queued(), 0);
}

#[test]
fn test_early_packet_deferred_until_character_arrives() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();

    h.push(CMSG_WHO, now);
    h.push(CMSG_BUG, now);
    h.session.update_at(UpdateFilter::World, now);

    // The deferred packet does not block the ones behind it
    assert_eq!(h.handlers.handled(), vec![CMSG_BUG]);
    assert_eq!(h.queued(), 1);

    h.session.set_player(Box::new(TestPlayer::in_world()));
    h.session.update_at(UpdateFilter::World, now + 1);

    assert_eq!(h.handlers.handled(), vec![CMSG_BUG, CMSG_WHO]);
    assert_eq!(h.queued(), 0);
}

#[test]
fn test_deferred_packet_eventually_dropped() {
    let mut h = Harness::new(SessionSettings {
        max_packet_deferrals: 3,
        ..Default::default()
    });
    let now = unix_now();
    h.push(CMSG_WHO, now);

    for tick in 0..3 {
        h.session.update_at(UpdateFilter::World, now + tick);
        assert_eq!(h.queued(), 1);
    }
    h.session.update_at(UpdateFilter::World, now + 3);

    assert_eq!(h.queued(), 0);
    assert!(h.handlers.handled().is_empty());
}

#[test]
fn test_recently_logged_out_grace() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();
    h.session.set_player(Box::new(TestPlayer::in_world()));
    h.session.logout_player(true);
    assert!(h.session.player_recently_logged_out());

    // Logged-in-only packets are dropped, not deferred
    h.push(CMSG_WHO, now);
    h.push(CMSG_NAME_QUERY, now);
    h.session.update_at(UpdateFilter::World, now);
    assert_eq!(h.handlers.handled(), vec![CMSG_NAME_QUERY]);
    assert_eq!(h.queued(), 0);

    h.push(CMSG_CHAR_ENUM, now);
    h.session.update_at(UpdateFilter::World, now);
    assert!(!h.session.player_recently_logged_out());
}

#[test]
fn test_transfer_only_opcode_needs_character_off_map() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();
    let mut player = TestPlayer::in_world();
    player.in_world = false;
    h.session.set_player(Box::new(player));

    h.push(MSG_MOVE_WORLDPORT_ACK, now);
    h.push(CMSG_WHO, now);
    h.session.update_at(UpdateFilter::World, now);

    assert_eq!(h.handlers.handled(), vec![MSG_MOVE_WORLDPORT_ACK]);
    assert_eq!(h.queued(), 0);
}

// ============ Flood protection ============

#[test]
fn test_flood_ceiling_kick() {
    let mut h = Harness::with_policy(FloodPolicy::Kick);
    let now = unix_now();
    for _ in 0..4 {
        h.push(CMSG_CHAR_CREATE, now);
    }

    assert!(!h.session.update_at(UpdateFilter::World, now));
    assert_eq!(h.handlers.count(CMSG_CHAR_CREATE), 3);
    assert!(h.transport.is_closed());
    assert!(h.bans.bans().is_empty());
}

#[test]
fn test_flood_ceiling_log() {
    let mut h = Harness::with_policy(FloodPolicy::Log);
    let now = unix_now();
    for _ in 0..4 {
        h.push(CMSG_CHAR_CREATE, now);
    }

    assert!(h.session.update_at(UpdateFilter::World, now));
    assert_eq!(h.handlers.count(CMSG_CHAR_CREATE), 4);
    assert!(!h.transport.is_closed());
}

#[test]
fn test_flood_ceiling_ban() {
    let mut h = Harness::with_policy(FloodPolicy::Ban);
    let now = unix_now();
    for _ in 0..4 {
        h.push(CMSG_CHAR_CREATE, now);
    }

    h.session.update_at(UpdateFilter::World, now);
    assert_eq!(h.handlers.count(CMSG_CHAR_CREATE), 3);
    assert!(h.transport.is_closed());
    assert!(h.bans.is_banned("TESTER"));
}

#[test]
fn test_flood_window_resets_each_second() {
    let mut h = Harness::with_policy(FloodPolicy::Kick);
    let now = unix_now();

    for second in 0..4 {
        h.push(CMSG_CHAR_CREATE, now + second);
        h.push(CMSG_CHAR_CREATE, now + second);
        h.push(CMSG_CHAR_CREATE, now + second);
        assert!(h.session.update_at(UpdateFilter::World, now + second));
    }

    assert_eq!(h.handlers.count(CMSG_CHAR_CREATE), 12);
    assert!(!h.transport.is_closed());
}

#[test]
fn test_unlimited_opcode_never_floods() {
    let mut h = Harness::with_policy(FloodPolicy::Kick);
    let now = unix_now();
    h.session.set_player(Box::new(TestPlayer::in_world()));

    for _ in 0..500 {
        h.push(CMSG_LOGOUT_REQUEST, now);
    }
    assert!(h.session.update_at(UpdateFilter::World, now));

    assert_eq!(h.handlers.count(CMSG_LOGOUT_REQUEST), 500);
    assert!(!h.transport.is_closed());
}

// ============ Update filters ============

#[test]
fn test_map_and_world_updates_split_the_queue() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();
    h.session.set_player(Box::new(TestPlayer::in_world()));

    h.push(MSG_MOVE_HEARTBEAT, now);
    h.push(CMSG_WHO, now);
    h.push(CMSG_QUERY_TIME, now);

    assert!(h.session.update_at(UpdateFilter::Map, now));
    assert_eq!(h.handlers.handled(), vec![MSG_MOVE_HEARTBEAT, CMSG_QUERY_TIME]);
    assert_eq!(h.queued(), 1);

    h.session.update_at(UpdateFilter::World, now);
    assert_eq!(h.handlers.handled(), vec![MSG_MOVE_HEARTBEAT, CMSG_QUERY_TIME, CMSG_WHO]);
}

#[test]
fn test_deferral_bounded_across_map_and_world_updates() {
    let h = Harness::new(SessionSettings {
        max_packet_deferrals: 4,
        ..Default::default()
    });
    h.push(CMSG_TIME_SYNC_RESP, unix_now());
    let handlers = Arc::clone(&h.handlers);

    let manager = SessionManager::default();
    let handle = manager.add_session(h.session);

    // One map update plus one world update is one tick: one deferral
    for _ in 0..4 {
        manager.update_map_sessions();
        manager.update_sessions();
        assert_eq!(handle.lock().inbox().queue().len(), 1);
    }
    manager.update_map_sessions();
    manager.update_sessions();

    assert_eq!(handle.lock().inbox().queue().len(), 0);
    assert!(handlers.handled().is_empty());
    assert_eq!(manager.count(), 1);
}

#[test]
fn test_map_update_skips_sessions_off_map() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();
    let mut player = TestPlayer::in_world();
    player.in_world = false;
    h.session.set_player(Box::new(player));
    h.push(CMSG_QUERY_TIME, now);
    let handlers = Arc::clone(&h.handlers);

    let manager = SessionManager::default();
    let handle = manager.add_session(h.session);

    manager.update_map_sessions();
    assert!(handlers.handled().is_empty());
    assert_eq!(handle.lock().inbox().queue().len(), 1);

    manager.update_sessions();
    assert_eq!(handlers.handled(), vec![CMSG_QUERY_TIME]);
}

#[test]
fn test_map_update_drains_in_world_sessions() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();
    h.session.set_player(Box::new(TestPlayer::in_world()));
    h.push(MSG_MOVE_HEARTBEAT, now);
    h.push(CMSG_WHO, now);
    let handlers = Arc::clone(&h.handlers);

    let manager = SessionManager::default();
    let handle = manager.add_session(h.session);

    manager.update_map_sessions();
    assert_eq!(handlers.handled(), vec![MSG_MOVE_HEARTBEAT]);
    assert_eq!(handle.lock().inbox().queue().len(), 1);
}

#[test]
fn test_only_world_update_tears_down() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();
    h.transport.close();

    assert!(h.session.update_at(UpdateFilter::Map, now));
    assert!(!h.session.update_at(UpdateFilter::World, now));
}

#[test]
fn test_idle_session_disconnected() {
    let mut h = Harness::new(SessionSettings {
        idle_timeout_secs: 10,
        ..Default::default()
    });
    let now = unix_now();

    assert!(h.session.update_at(UpdateFilter::World, now + 5));
    assert!(!h.session.update_at(UpdateFilter::World, now + 11));
    assert!(h.transport.is_closed());
}

// ============ Addons ============

#[test]
fn test_addon_key_sent_only_for_mismatch() {
    let mut h = Harness::new(SessionSettings::default());
    let mut blob = addon_blob(&[("Blizzard_AuctionUI", STANDARD_ADDON_CRC), ("DBM-Core", 0xDEAD_BEEF)]);

    h.session.read_addons_info(&mut blob);
    assert_eq!(h.session.addons().len(), 2);

    h.session.send_addons_info();
    assert!(h.session.addons().is_empty());

    let frames = h.transport.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode, SMSG_ADDON_INFO);

    let payload = &frames[0].payload;
    let key_hits = payload
        .windows(ADDON_PUBLIC_KEY.len())
        .filter(|w| *w == &ADDON_PUBLIC_KEY[..])
        .count();
    assert_eq!(key_hits, 1);
    // Two entries of state, flag, key flag, crc and url plus one key and the trailing count
    assert_eq!(payload.len(), 2 * 8 + ADDON_PUBLIC_KEY.len() + 4);
}

#[test]
fn test_bad_addon_blobs_leave_list_empty() {
    let mut h = Harness::new(SessionSettings::default());

    let mut empty = ByteBuffer::new();
    empty.write_u32(0);
    h.session.read_addons_info(&mut empty);
    assert!(h.session.addons().is_empty());

    let mut oversized = ByteBuffer::new();
    oversized.write_u32(2 * 1024 * 1024);
    oversized.write_bytes(&[0x78, 0x9C, 0x03, 0x00]);
    h.session.read_addons_info(&mut oversized);
    assert!(h.session.addons().is_empty());

    // Count claims more entries than the inflated data can hold
    let mut raw = ByteBuffer::new();
    raw.write_u32(1_000);
    raw.write_cstring("A");
    let raw = raw.as_bytes().to_vec();
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).unwrap();
    let mut over_count = ByteBuffer::new();
    over_count.write_u32(raw.len() as u32);
    over_count.write_bytes(&encoder.finish().unwrap());
    h.session.read_addons_info(&mut over_count);
    assert!(h.session.addons().is_empty());
}

#[test]
fn test_addon_prefix_registration() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();

    let mut packet = WorldPacket::new(CMSG_ADDON_REGISTERED_PREFIXES, 16);
    packet.write_bits(2, 25);
    packet.write_bits(3, 5);
    packet.write_bits(4, 5);
    packet.flush_bits();
    packet.write_str("DBM");
    packet.write_str("BigW");
    h.session.inbox().queue_packet(packet, now);
    h.session.update_at(UpdateFilter::World, now);

    assert!(h.session.is_addon_registered("DBM"));
    assert!(h.session.is_addon_registered("BigW"));

    h.push(CMSG_UNREGISTER_ALL_ADDON_PREFIXES, now);
    h.session.update_at(UpdateFilter::World, now);
    assert!(h.session.addon_prefixes().is_empty());
    assert!(!h.session.is_addon_registered("DBM"));
}

// ============ Query callbacks ============

#[test]
fn test_query_callback_delivered_once() {
    let mut h = Harness::new(SessionSettings::default());
    let now = unix_now();

    h.session
        .issue_query(
            CallbackSlot::CharEnum,
            Statement::SelCharEnum { account_id: ACCOUNT_ID },
            QueryParam::None,
        )
        .unwrap();
    assert!(h
        .session
        .issue_query(
            CallbackSlot::CharEnum,
            Statement::SelCharEnum { account_id: ACCOUNT_ID },
            QueryParam::None,
        )
        .is_err());

    h.session.update_at(UpdateFilter::World, now);
    h.session.update_at(UpdateFilter::World, now);

    assert_eq!(*h.handlers.completed.lock(), vec![CallbackSlot::CharEnum]);

    // The slot is free again once delivered
    assert!(h
        .session
        .issue_query(
            CallbackSlot::CharEnum,
            Statement::SelCharEnum { account_id: ACCOUNT_ID },
            QueryParam::None,
        )
        .is_ok());
}

// ============ Logout ============

#[test]
fn test_logout_drains_pending_teleports() {
    let mut h = Harness::new(SessionSettings::default());
    let player = TestPlayer::in_world();
    let pending = player.pending_teleports.clone();
    let logged_out = player.logged_out.clone();
    pending.store(3, Ordering::SeqCst);
    h.session.set_player(Box::new(player));

    h.session.logout_player(true);

    assert_eq!(pending.load(Ordering::SeqCst), 0);
    assert!(logged_out.load(Ordering::SeqCst));
    assert!(h.session.player().is_none());
    assert_eq!(h.transport.sent_opcodes(), vec![SMSG_LOGOUT_COMPLETE]);
    assert!(h
        .database
        .executed()
        .iter()
        .any(|s| matches!(s, Statement::UpdCharacterAccountOffline { account_id } if *account_id == ACCOUNT_ID)));
}

#[test]
fn test_delayed_logout_runs_on_world_update() {
    let mut h = Harness::new(SessionSettings {
        logout_delay_secs: 20,
        ..Default::default()
    });
    let now = unix_now();
    h.session.set_player(Box::new(TestPlayer::in_world()));
    h.session.logout_request(now);

    h.session.update_at(UpdateFilter::World, now + 19);
    assert!(h.session.player().is_some());

    h.session.update_at(UpdateFilter::Map, now + 20);
    assert!(h.session.player().is_some());

    h.session.update_at(UpdateFilter::World, now + 20);
    assert!(h.session.player().is_none());
    assert!(!h.session.is_logging_out());
}

#[test]
fn test_closed_connection_logs_player_out() {
    let mut h = Harness::new(SessionSettings::default());
    let player = TestPlayer::in_world();
    let logged_out = player.logged_out.clone();
    h.session.set_player(Box::new(player));

    h.transport.close();
    assert!(!h.session.update_at(UpdateFilter::World, unix_now()));
    assert!(logged_out.load(Ordering::SeqCst));
}

// ============ Sending ============

#[test]
fn test_disabled_opcode_not_sent_unless_forced() {
    let h = Harness::new(SessionSettings::default());
    let packet = WorldPacket::new(SMSG_VOICE_SESSION_ROSTER_UPDATE, 0);

    assert!(!h.session.send_packet(&packet, false));
    assert!(h.transport.sent_opcodes().is_empty());

    assert!(h.session.send_packet(&packet, true));
    assert_eq!(h.transport.sent_opcodes(), vec![SMSG_VOICE_SESSION_ROSTER_UPDATE]);
}
