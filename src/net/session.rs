//! World session module
//!
//! A `WorldSession` is the server side of one authenticated client:
//! - drains the inbound queue under an [`UpdateFilter`] and dispatches each
//!   packet according to its opcode's status
//! - applies per-opcode flood protection
//! - delivers finished asynchronous queries
//! - drives login, in-world, logout and teardown
//!
//! Sessions are owned by the [`SessionManager`](crate::net::manager::SessionManager)
//! behind a mutex, so only one updater ever drains a session at a time.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use crate::auth::{AccountBans, AccountInfo};
use crate::db::callback::{CallbackSlot, QueryCallbacks, QueryParam, SlotBusy};
use crate::db::{
    Database, QueryResult, Statement, Transaction, MAX_ACCOUNT_TUTORIAL_VALUES, NUM_ACCOUNT_DATA_TYPES,
};
use crate::error::DatabaseError;
use crate::game::{PlayerEntity, WorldHandlers};
use crate::net::buffer::ByteBuffer;
use crate::net::compression::{PacketCompressor, DEFAULT_COMPRESSION_LEVEL};
use crate::net::filter::UpdateFilter;
use crate::net::flood::{FloodContext, FloodProtection, FloodSettings, ThrottleSettings};
use crate::net::packet::WorldPacket;
use crate::net::queue::{eligibility, PacketInbox};
use crate::net::transport::Transport;
use crate::protocol::addon::{decode_manifest, encode_addon_info, AddonCheck, AddonError, AddonInfo, AddonPrefixFilter, AddonRegistry};
use crate::protocol::opcodes::{
    opcode_name_for_logging, Handler, OpcodeDescriptor, OpcodeTable, Status, AUTH_OK, AUTH_WAIT_QUEUE,
    CMSG_CHAR_ENUM, COMPRESSED_OPCODE_MASK, NULL_OPCODE, SMSG_ACCOUNT_DATA_TIMES, SMSG_AUTH_RESPONSE,
    SMSG_LOGOUT_COMPLETE, SMSG_NOTIFICATION, SMSG_TUTORIAL_FLAGS, UNKNOWN_OPCODE,
};

/// Account data types stored per account
pub const GLOBAL_CACHE_MASK: u32 = 0x15;

/// Account data types stored per character
pub const PER_CHARACTER_CACHE_MASK: u32 = 0xEA;

/// Upper bound on far teleports completed while logging out
const MAX_PENDING_TELEPORTS: usize = 8;

/// Current wall-clock second
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Session tunables shared by every session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Seconds without client activity before disconnect (0 = never)
    pub idle_timeout_secs: u64,
    /// Handlers slower than this are recorded (0 = never)
    pub slow_opcode_threshold_ms: u64,
    /// Seconds between a logout request and the logout itself
    pub logout_delay_secs: u64,
    /// Times a packet may be deferred before it is dropped (0 = unlimited)
    pub max_packet_deferrals: u32,
    pub compression_level: u32,
    pub flood: Arc<FloodSettings>,
    pub throttle: Arc<ThrottleSettings>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 900,
            slow_opcode_threshold_ms: 50,
            logout_delay_secs: 20,
            max_packet_deferrals: 100,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            flood: Arc::new(FloodSettings::default()),
            throttle: Arc::new(ThrottleSettings::default()),
        }
    }
}

/// Process-wide collaborators handed to every session
#[derive(Clone)]
pub struct SessionServices {
    pub opcodes: Arc<OpcodeTable>,
    pub handlers: Arc<dyn WorldHandlers>,
    pub database: Arc<dyn Database>,
    pub bans: Arc<dyn AccountBans>,
    pub addons: Arc<AddonRegistry>,
    pub settings: Arc<SessionSettings>,
}

/// Session phase, derived from session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Waiting in the login queue
    Queued,
    /// Authenticated, no character in the world
    Authenticated,
    /// Character attached and in the world
    InWorld,
    /// Character attached but between maps
    Transferring,
    /// Logout requested or in progress
    LoggingOut,
    /// Transport closed
    Closed,
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Queued => "Queued",
            SessionPhase::Authenticated => "Authenticated",
            SessionPhase::InWorld => "InWorld",
            SessionPhase::Transferring => "Transferring",
            SessionPhase::LoggingOut => "LoggingOut",
            SessionPhase::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One cached account data blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountData {
    pub time: u64,
    pub data: String,
}

/// Server side of one authenticated client connection
pub struct WorldSession {
    account: AccountInfo,
    services: SessionServices,
    transport: Arc<dyn Transport>,
    inbox: Arc<PacketInbox>,

    player: Option<Box<dyn PlayerEntity>>,
    guid_low: u32,
    in_queue: bool,
    player_loading: bool,
    player_logout: bool,
    player_recently_logout: bool,
    player_save: bool,
    logout_time: u64,

    flood: FloodProtection,
    callbacks: QueryCallbacks,
    addons: Vec<AddonInfo>,
    addon_prefixes: AddonPrefixFilter,
    compressor: PacketCompressor,

    account_data: [AccountData; NUM_ACCOUNT_DATA_TYPES],
    tutorials: [u32; MAX_ACCOUNT_TUTORIAL_VALUES],
    tutorials_changed: bool,
    tutorials_stored: bool,

    /// Incremented once per drain; tags packets deferred during that drain
    generation: u64,
    /// Second captured at the start of the current drain
    tick_time: u64,
}

impl WorldSession {
    /// Create a session for a freshly authenticated connection
    pub fn new(account: AccountInfo, transport: Arc<dyn Transport>, services: SessionServices) -> Self {
        let now = unix_now();
        let settings = Arc::clone(&services.settings);
        let inbox = Arc::new(PacketInbox::new(
            account.id,
            transport.remote_address(),
            Arc::clone(&settings.throttle),
            now,
        ));

        services.database.execute(Statement::UpdAccountOnline {
            account_id: account.id,
            online: true,
        });

        debug!(
            account_id = account.id,
            address = %transport.remote_address(),
            "World session created"
        );

        Self {
            account,
            transport,
            inbox,
            player: None,
            guid_low: 0,
            in_queue: false,
            player_loading: false,
            player_logout: false,
            player_recently_logout: false,
            player_save: false,
            logout_time: 0,
            flood: FloodProtection::new(Arc::clone(&settings.flood)),
            callbacks: QueryCallbacks::new(),
            addons: Vec::new(),
            addon_prefixes: AddonPrefixFilter::new(),
            compressor: PacketCompressor::new(settings.compression_level),
            account_data: Default::default(),
            tutorials: [0; MAX_ACCOUNT_TUTORIAL_VALUES],
            tutorials_changed: false,
            tutorials_stored: false,
            generation: 0,
            tick_time: now,
            services,
        }
    }

    // ============ Accessors ============

    pub fn account(&self) -> &AccountInfo {
        &self.account
    }

    #[inline]
    pub fn account_id(&self) -> u32 {
        self.account.id
    }

    pub fn remote_address(&self) -> &str {
        self.transport.remote_address()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Producer end for the connection reader
    pub fn inbox(&self) -> Arc<PacketInbox> {
        Arc::clone(&self.inbox)
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub fn player(&self) -> Option<&dyn PlayerEntity> {
        self.player.as_deref()
    }

    pub fn player_mut(&mut self) -> Option<&mut (dyn PlayerEntity + 'static)> {
        self.player.as_deref_mut()
    }

    /// Attach a character; the session takes ownership of it
    pub fn set_player(&mut self, player: Box<dyn PlayerEntity>) {
        self.guid_low = player.guid_low();
        self.player = Some(player);
        self.player_loading = false;
    }

    pub fn guid_low(&self) -> u32 {
        self.guid_low
    }

    pub fn set_player_loading(&mut self, loading: bool) {
        self.player_loading = loading;
    }

    pub fn is_player_loading(&self) -> bool {
        self.player_loading
    }

    pub fn set_in_queue(&mut self, in_queue: bool) {
        self.in_queue = in_queue;
    }

    pub fn in_queue(&self) -> bool {
        self.in_queue
    }

    pub fn player_recently_logged_out(&self) -> bool {
        self.player_recently_logout
    }

    pub fn is_logging_out(&self) -> bool {
        self.logout_time > 0 || self.player_logout
    }

    /// Second captured at the start of the current drain
    pub fn now(&self) -> u64 {
        self.tick_time
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn flood(&self) -> &FloodProtection {
        &self.flood
    }

    pub fn phase(&self) -> SessionPhase {
        if self.transport.is_closed() {
            SessionPhase::Closed
        } else if self.is_logging_out() {
            SessionPhase::LoggingOut
        } else if self.in_queue {
            SessionPhase::Queued
        } else {
            match &self.player {
                Some(player) if player.is_in_world() => SessionPhase::InWorld,
                Some(_) => SessionPhase::Transferring,
                None => SessionPhase::Authenticated,
            }
        }
    }

    /// Diagnostic description of the account and attached character
    pub fn player_info(&self) -> String {
        match &self.player {
            Some(player) => format!(
                "[Player: {} (Guid: {}, Account: {})]",
                player.name(),
                player.guid_low(),
                self.account.id
            ),
            None => format!("[Player: Account: {}]", self.account.id),
        }
    }

    // ============ Update loop ============

    /// Drain the inbound queue using the current wall clock
    pub fn update(&mut self, filter: UpdateFilter) -> bool {
        self.update_at(filter, unix_now())
    }

    /// Drain the inbound queue at second `now`
    ///
    /// Returns `false` once the session should be removed.
    pub fn update_at(&mut self, filter: UpdateFilter, now: u64) -> bool {
        self.tick_time = now;

        let idle_timeout = self.services.settings.idle_timeout_secs;
        if idle_timeout > 0
            && !self.in_queue
            && !self.transport.is_closed()
            && now.saturating_sub(self.inbox.last_activity()) > idle_timeout
        {
            info!(
                target: "network",
                account_id = self.account.id,
                address = %self.transport.remote_address(),
                idle_secs = now.saturating_sub(self.inbox.last_activity()),
                "Disconnecting idle session"
            );
            self.transport.close();
        }

        self.generation += 1;
        let generation = self.generation;
        let opcodes = Arc::clone(&self.services.opcodes);
        let inbox = Arc::clone(&self.inbox);

        while !self.transport.is_closed() {
            let in_world = self.player.as_ref().map(|p| p.is_in_world());
            let eligible = eligibility(&opcodes, filter, in_world);

            // Everything left was already deferred during this drain
            match inbox.queue().peek(&eligible) {
                None => break,
                Some(mark) if mark.deferred_in == Some(generation) => break,
                Some(_) => {}
            }

            let Some(packet) = inbox.queue().drain_next(&eligible) else {
                break;
            };
            self.process_packet(&opcodes, packet, now);
        }

        self.process_query_callbacks();

        if filter.process_logout() {
            if self.should_log_out(now) && !self.player_loading {
                self.logout_player(true);
            }

            if self.transport.is_closed() {
                if self.player.is_some() {
                    self.logout_player(true);
                }
                return false;
            }
        }

        true
    }

    fn process_packet(&mut self, opcodes: &OpcodeTable, packet: WorldPacket, now: u64) {
        let opcode = packet.opcode();
        let Some(descriptor) = opcodes.lookup(opcode).copied() else {
            error!(
                target: "network",
                account_id = self.account.id,
                address = %self.transport.remote_address(),
                opcode = %opcode_name_for_logging(opcode),
                "Received unknown opcode"
            );
            return;
        };

        let in_world = self.player.as_ref().map(|p| p.is_in_world());

        match descriptor.status {
            Status::LoggedInOnly => match in_world {
                None if !self.player_recently_logout => self.defer_packet(packet),
                // Delayed by network lag after a logout
                None => debug!(
                    target: "opcodes",
                    account_id = self.account.id,
                    opcode = %opcode_name_for_logging(opcode),
                    "Dropping packet received after logout"
                ),
                Some(true) => {
                    self.admit_and_dispatch(&descriptor, packet, now);
                }
                Some(false) => self.log_unexpected(&packet, descriptor.status, "the player is not in world yet"),
            },
            Status::LoggedInOrRecentlyOut => {
                if self.player.is_none() && !self.player_recently_logout && !self.player_logout {
                    self.log_unexpected(
                        &packet,
                        descriptor.status,
                        "the player has not logged in yet and not recently logout",
                    );
                } else {
                    self.admit_and_dispatch(&descriptor, packet, now);
                }
            }
            Status::DuringTransferOnly => match in_world {
                None => self.log_unexpected(&packet, descriptor.status, "the player has not logged in yet"),
                Some(true) => self.log_unexpected(&packet, descriptor.status, "the player is still in world"),
                Some(false) => {
                    self.admit_and_dispatch(&descriptor, packet, now);
                }
            },
            Status::AuthedOnly => {
                if self.in_queue {
                    self.log_unexpected(&packet, descriptor.status, "the player not pass queue yet");
                } else if self.admit_and_dispatch(&descriptor, packet, now) && opcode == CMSG_CHAR_ENUM {
                    // Back at the character screen: the grace period is over
                    self.player_recently_logout = false;
                }
            }
            Status::NeverAllowed => {
                error!(
                    target: "bad_opcode",
                    account_id = self.account.id,
                    address = %self.transport.remote_address(),
                    opcode = %opcode_name_for_logging(opcode),
                    "Received not allowed opcode"
                );
            }
            Status::Unhandled => {
                debug!(
                    target: "bad_opcode",
                    account_id = self.account.id,
                    address = %self.transport.remote_address(),
                    opcode = %opcode_name_for_logging(opcode),
                    "Received not handled opcode"
                );
            }
        }
    }

    /// Re-queue a packet that arrived before its character
    fn defer_packet(&mut self, mut packet: WorldPacket) {
        let max = self.services.settings.max_packet_deferrals;
        if max > 0 && packet.deferrals() >= max {
            warn!(
                target: "network",
                account_id = self.account.id,
                address = %self.transport.remote_address(),
                opcode = %opcode_name_for_logging(packet.opcode()),
                deferrals = packet.deferrals(),
                "Dropping stale packet, no character was ever attached"
            );
            return;
        }

        debug!(
            target: "network",
            account_id = self.account.id,
            opcode = %opcode_name_for_logging(packet.opcode()),
            "Re-enqueueing packet, the player has not logged in yet"
        );
        packet.mark_deferred(self.generation);
        self.inbox.queue().push(packet);
    }

    fn log_unexpected(&self, packet: &WorldPacket, status: Status, reason: &str) {
        error!(
            target: "opcodes",
            account_id = self.account.id,
            address = %self.transport.remote_address(),
            opcode = %opcode_name_for_logging(packet.opcode()),
            status = %status,
            reason,
            "Received unexpected opcode"
        );
    }

    /// Flood check, then dispatch; returns whether the handler ran
    fn admit_and_dispatch(&mut self, descriptor: &OpcodeDescriptor, packet: WorldPacket, now: u64) -> bool {
        let ctx = FloodContext {
            account_id: self.account.id,
            transport: self.transport.as_ref(),
            bans: self.services.bans.as_ref(),
        };
        if !self.flood.evaluate(descriptor, now, &ctx).is_admit() {
            return false;
        }

        self.dispatch(descriptor, packet);
        true
    }

    fn dispatch(&mut self, descriptor: &OpcodeDescriptor, mut packet: WorldPacket) {
        let started = Instant::now();

        let result = match descriptor.handler {
            Handler::World => {
                let handlers = Arc::clone(&self.services.handlers);
                handlers.handle(self, &mut packet)
            }
            Handler::AddonRegisteredPrefixes => self.addon_prefixes.register(&mut packet),
            Handler::UnregisterAddonPrefixes => {
                self.addon_prefixes.clear();
                Ok(())
            }
            Handler::Ignore => {
                packet.rfinish();
                Ok(())
            }
            Handler::Null | Handler::EarlyProcess | Handler::ServerSide | Handler::Deprecated => {
                error!(
                    target: "bad_opcode",
                    account_id = self.account.id,
                    opcode = %opcode_name_for_logging(packet.opcode()),
                    handler = ?descriptor.handler,
                    "Received opcode the session cannot handle"
                );
                packet.rfinish();
                Ok(())
            }
        };

        match result {
            Ok(()) => self.log_unprocessed_tail(&packet),
            Err(e) => {
                error!(
                    target: "network",
                    account_id = self.account.id,
                    address = %self.transport.remote_address(),
                    opcode = %opcode_name_for_logging(packet.opcode()),
                    error = %e,
                    "Malformed packet, dropped"
                );
                trace!(target: "network", dump = %packet.hexlike(), "Malformed packet contents");
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let threshold = self.services.settings.slow_opcode_threshold_ms;
        if threshold > 0 && elapsed_ms > threshold {
            warn!(
                target: "network",
                account_id = self.account.id,
                opcode = %opcode_name_for_logging(descriptor.opcode),
                elapsed_ms,
                "Slow opcode handler"
            );
            self.services.database.execute(Statement::InsSlowOpcode {
                account_id: self.account.id,
                opcode: descriptor.opcode,
                elapsed_ms,
            });
        }
    }

    fn log_unprocessed_tail(&self, packet: &WorldPacket) {
        if packet.remaining() == 0 {
            return;
        }
        trace!(
            target: "network",
            account_id = self.account.id,
            opcode = %opcode_name_for_logging(packet.opcode()),
            read = packet.rpos(),
            size = packet.wpos(),
            "Unprocessed tail data"
        );
    }

    // ============ Asynchronous queries ============

    /// Start a query whose result is delivered to the world handlers later
    pub fn issue_query(&mut self, slot: CallbackSlot, statement: Statement, param: QueryParam) -> Result<(), SlotBusy> {
        if self.callbacks.is_pending(slot) {
            return Err(SlotBusy(slot));
        }
        let future = self.services.database.async_query(statement);
        self.callbacks.issue(slot, future, param)
    }

    pub fn callbacks_mut(&mut self) -> &mut QueryCallbacks {
        &mut self.callbacks
    }

    fn process_query_callbacks(&mut self) {
        let completed = self.callbacks.poll();
        if completed.is_empty() {
            return;
        }
        let handlers = Arc::clone(&self.services.handlers);
        for completion in completed {
            handlers.on_query_complete(self, completion);
        }
    }

    // ============ Logout ============

    /// Schedule a logout at second `time` (0 cancels)
    pub fn logout_request(&mut self, time: u64) {
        self.logout_time = time;
    }

    /// Whether a requested logout is due
    pub fn should_log_out(&self, now: u64) -> bool {
        self.logout_time > 0 && now >= self.logout_time + self.services.settings.logout_delay_secs
    }

    /// Remove the character from the world
    pub fn logout_player(&mut self, save: bool) {
        self.player_logout = true;
        self.player_save = save;

        if let Some(mut player) = self.player.take() {
            // A character caught between maps must land before it can leave
            for _ in 0..MAX_PENDING_TELEPORTS {
                if !player.is_being_teleported_far() || !player.finish_far_teleport() {
                    break;
                }
            }

            let socket_alive = !self.transport.is_closed();
            player.on_logout(self.player_save, socket_alive);

            info!(
                account_id = self.account.id,
                address = %self.transport.remote_address(),
                character = %player.name(),
                guid = player.guid_low(),
                "Logout Character"
            );

            let packet = WorldPacket::new(SMSG_LOGOUT_COMPLETE, 0);
            self.send_packet(&packet, false);

            self.services.database.execute(Statement::UpdCharacterAccountOffline {
                account_id: self.account.id,
            });
        }

        self.guid_low = 0;
        self.player_logout = false;
        self.player_save = false;
        self.player_recently_logout = true;
        self.logout_time = 0;
    }

    /// Disconnect the client
    pub fn kick_player(&self, reason: &str) {
        info!(
            target: "kick",
            account_id = self.account.id,
            address = %self.transport.remote_address(),
            player = %self.player_info(),
            reason,
            "Kicking session"
        );
        self.transport.close();
    }

    // ============ Sending ============

    fn may_send(&self, opcode: u16, forced: bool) -> bool {
        if opcode == NULL_OPCODE || opcode == UNKNOWN_OPCODE {
            error!(
                target: "network",
                account_id = self.account.id,
                opcode = %opcode_name_for_logging(opcode),
                "Prevented sending of a reserved opcode"
            );
            return false;
        }

        if !forced {
            match self.services.opcodes.lookup(opcode) {
                Some(descriptor) if descriptor.status != Status::Unhandled => {}
                _ => {
                    error!(
                        target: "network",
                        account_id = self.account.id,
                        opcode = %opcode_name_for_logging(opcode),
                        "Prevented sending disabled opcode"
                    );
                    return false;
                }
            }
        }

        true
    }

    fn deliver(&self, opcode: u16, payload: &[u8]) -> bool {
        match self.transport.send(opcode, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    target: "network",
                    account_id = self.account.id,
                    opcode = %opcode_name_for_logging(opcode),
                    error = %e,
                    "Send failed, closing connection"
                );
                self.transport.close();
                false
            }
        }
    }

    /// Send a packet; `forced` skips the disabled-opcode check
    pub fn send_packet(&self, packet: &WorldPacket, forced: bool) -> bool {
        self.may_send(packet.opcode(), forced) && self.deliver(packet.opcode(), packet.as_bytes())
    }

    /// Send a packet deflated through the session's stream
    ///
    /// `[u32 uncompressed size][deflate bytes]` under `opcode | 0x8000`.
    pub fn send_compressed(&mut self, packet: &WorldPacket, forced: bool) -> bool {
        let opcode = packet.opcode();
        if !self.may_send(opcode, forced) {
            return false;
        }

        let compressed = match self.compressor.compress(packet.as_bytes()) {
            Ok(compressed) => compressed,
            Err(e) => {
                error!(
                    target: "network",
                    account_id = self.account.id,
                    opcode = %opcode_name_for_logging(opcode),
                    error = %e,
                    "Packet compression failed"
                );
                return false;
            }
        };

        let mut body = ByteBuffer::with_capacity(4 + compressed.len());
        body.write_u32(packet.size() as u32);
        body.write_bytes(&compressed);
        self.deliver(opcode | COMPRESSED_OPCODE_MASK, body.as_bytes())
    }

    /// Show a text notification on the client
    pub fn send_notification(&self, text: &str) {
        let mut packet = WorldPacket::new(SMSG_NOTIFICATION, 2 + text.len());
        packet.write_bits(text.len() as u32, 13);
        packet.flush_bits();
        packet.write_str(text);
        self.send_packet(&packet, false);
    }

    /// Answer the auth session: accepted, or waiting at `position`
    pub fn send_auth_wait_queue(&self, position: u32) {
        let mut packet = WorldPacket::new(SMSG_AUTH_RESPONSE, 6);
        if position == 0 {
            packet.write_bit(false); // queue info
            packet.write_bit(false); // account info
            packet.flush_bits();
            packet.write_u8(AUTH_OK);
        } else {
            packet.write_bit(true); // queue info
            packet.write_bit(false); // free character migration
            packet.write_bit(false); // account info
            packet.flush_bits();
            packet.write_u8(AUTH_WAIT_QUEUE);
            packet.write_u32(position);
        }
        self.send_packet(&packet, false);
    }

    // ============ Account data ============

    /// Replace the cached entries selected by `mask` with `result`
    ///
    /// Rows are `(type, time, data)`.
    pub fn load_account_data(&mut self, result: &QueryResult, mask: u32) -> Result<(), DatabaseError> {
        for (i, entry) in self.account_data.iter_mut().enumerate() {
            if mask & (1 << i) != 0 {
                *entry = AccountData::default();
            }
        }

        for row in result.rows() {
            let data_type = row.u32_at(0)? as usize;
            if data_type >= NUM_ACCOUNT_DATA_TYPES {
                error!(account_id = self.account.id, data_type, "Invalid account data type");
                continue;
            }
            if mask & (1 << data_type) == 0 {
                error!(
                    account_id = self.account.id,
                    data_type,
                    mask = format_args!("{:#x}", mask),
                    "Account data type does not match the requested cache"
                );
                continue;
            }
            self.account_data[data_type] = AccountData {
                time: row.u64_at(1)?,
                data: row.str_at(2)?.to_string(),
            };
        }

        Ok(())
    }

    pub fn account_data(&self, data_type: usize) -> Option<&AccountData> {
        self.account_data.get(data_type)
    }

    /// Update a cached entry and persist it
    pub fn set_account_data(&mut self, data_type: usize, time: u64, data: String) {
        if data_type >= NUM_ACCOUNT_DATA_TYPES {
            warn!(account_id = self.account.id, data_type, "Ignoring invalid account data type");
            return;
        }

        let statement = if (1 << data_type) & GLOBAL_CACHE_MASK != 0 {
            Statement::RepAccountData {
                account_id: self.account.id,
                data_type: data_type as u8,
                time,
                data: data.clone(),
            }
        } else {
            // Per-character data needs a character
            if self.guid_low == 0 {
                return;
            }
            Statement::RepPlayerAccountData {
                guid: self.guid_low,
                data_type: data_type as u8,
                time,
                data: data.clone(),
            }
        };

        self.services.database.execute(statement);
        self.account_data[data_type] = AccountData { time, data };
    }

    /// Tell the client the timestamps of the cached account data
    pub fn send_account_data_times(&self, mask: u32) {
        let mut packet = WorldPacket::new(SMSG_ACCOUNT_DATA_TIMES, 4 + 1 + 4 + NUM_ACCOUNT_DATA_TYPES * 4);
        packet.write_u32(unix_now() as u32);
        packet.write_u8(1);
        packet.write_u32(mask);
        for (i, entry) in self.account_data.iter().enumerate() {
            if mask & (1 << i) != 0 {
                packet.write_u32(entry.time as u32);
            }
        }
        self.send_packet(&packet, false);
    }

    // ============ Tutorials ============

    /// Load tutorial flags from a `(flag0, .., flag7)` row
    pub fn load_tutorials_data(&mut self, result: &QueryResult) -> Result<(), DatabaseError> {
        self.tutorials = [0; MAX_ACCOUNT_TUTORIAL_VALUES];
        self.tutorials_stored = false;

        if let Some(row) = result.first() {
            for (i, flag) in self.tutorials.iter_mut().enumerate() {
                *flag = row.u32_at(i)?;
            }
            self.tutorials_stored = true;
        }

        self.tutorials_changed = false;
        Ok(())
    }

    pub fn send_tutorials_data(&self) {
        let mut packet = WorldPacket::new(SMSG_TUTORIAL_FLAGS, 4 * MAX_ACCOUNT_TUTORIAL_VALUES);
        for flag in self.tutorials {
            packet.write_u32(flag);
        }
        self.send_packet(&packet, false);
    }

    /// Append changed tutorial flags to `transaction`
    pub fn save_tutorials_data(&mut self, transaction: &mut Transaction) {
        if !self.tutorials_changed {
            return;
        }

        let account_id = self.account.id;
        let flags = self.tutorials;
        transaction.append(if self.tutorials_stored {
            Statement::UpdTutorials { account_id, flags }
        } else {
            Statement::InsTutorials { account_id, flags }
        });

        self.tutorials_stored = true;
        self.tutorials_changed = false;
    }

    pub fn tutorial_int(&self, index: usize) -> u32 {
        self.tutorials.get(index).copied().unwrap_or(0)
    }

    pub fn set_tutorial_int(&mut self, index: usize, value: u32) {
        if let Some(flag) = self.tutorials.get_mut(index) {
            if *flag != value {
                *flag = value;
                self.tutorials_changed = true;
            }
        }
    }

    // ============ Addons ============

    /// Decode the addon manifest carried by the auth session packet
    pub fn read_addons_info(&mut self, data: &mut ByteBuffer) {
        let manifest = match decode_manifest(data) {
            Ok(manifest) => manifest,
            Err(AddonError::Missing) | Err(AddonError::Empty) => {
                debug!(target: "addon", account_id = self.account.id, "Client sent no addon info");
                return;
            }
            Err(e) => {
                warn!(
                    target: "addon",
                    account_id = self.account.id,
                    address = %self.transport.remote_address(),
                    error = %e,
                    "Rejected addon info"
                );
                return;
            }
        };

        for addon in manifest.addons {
            match self.services.addons.check(&addon) {
                AddonCheck::Matched => {}
                AddonCheck::Learned => {
                    debug!(target: "addon", name = %addon.name, crc = format_args!("{:#x}", addon.crc), "Addon learned");
                }
                AddonCheck::Mismatched { known } => {
                    warn!(
                        target: "addon",
                        account_id = self.account.id,
                        name = %addon.name,
                        crc = format_args!("{:#x}", addon.crc),
                        known = format_args!("{:#x}", known),
                        "Addon CRC differs from the one previously seen"
                    );
                }
            }
            self.addons.push(addon);
        }

        if let Some(client_time) = manifest.client_time {
            debug!(target: "addon", account_id = self.account.id, client_time, "Addon list read");
        }
        if manifest.unread > 0 {
            debug!(target: "addon", account_id = self.account.id, unread = manifest.unread, "Unknown data after addon list");
        }
    }

    /// Addons announced by the client and not yet answered
    pub fn addons(&self) -> &[AddonInfo] {
        &self.addons
    }

    /// Answer the addon manifest; the announced list is not kept afterwards
    pub fn send_addons_info(&mut self) {
        let packet = encode_addon_info(&self.addons);
        self.addons.clear();
        self.send_packet(&packet, false);
    }

    pub fn addon_prefixes(&self) -> &AddonPrefixFilter {
        &self.addon_prefixes
    }

    /// Whether addon messages with `prefix` should reach this client
    pub fn is_addon_registered(&self, prefix: &str) -> bool {
        self.addon_prefixes.is_registered(prefix)
    }
}

impl Drop for WorldSession {
    fn drop(&mut self) {
        if self.player.is_some() {
            self.logout_player(true);
        }

        self.transport.close();
        let dropped = self.inbox.queue().clear();
        self.callbacks.clear();

        self.services.database.execute(Statement::UpdAccountOnline {
            account_id: self.account.id,
            online: false,
        });

        debug!(account_id = self.account.id, dropped, "World session destroyed");
    }
}
