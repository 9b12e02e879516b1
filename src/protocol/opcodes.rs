//! Opcode registry
//!
//! Every opcode the server knows about is described once, at startup, by an
//! [`OpcodeDescriptor`]:
//! - `Status`: which session phases may invoke it
//! - `ProcessingPlace`: which updater (world or map) may run it
//! - `Handler`: the closed set of dispatch targets
//! - the per-second flood ceiling enforced by the session's flood protection
//!
//! The table is built through [`OpcodeTableBuilder`] and never mutated after
//! `build()`, so lookups need no locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use tracing::error;

use crate::error::ProtocolError;

/// Reserved "no opcode" value, never sent
pub const NULL_OPCODE: u16 = 0x0000;

/// Marker for opcodes the server does not know how to name
pub const UNKNOWN_OPCODE: u16 = 0xFFFF;

/// High bit set on outbound opcodes whose payload is deflate-compressed
pub const COMPRESSED_OPCODE_MASK: u16 = 0x8000;

/// Auth response codes
pub const AUTH_OK: u8 = 0x0C;
pub const AUTH_WAIT_QUEUE: u8 = 0x1B;

/// Maximum number of quests in a quest log
pub const MAX_QUEST_LOG_SIZE: u32 = 25;

/// Number of inventory, bank and buyback slots on a character
pub const PLAYER_SLOTS_COUNT: u32 = 86;

macro_rules! opcodes {
    ($($name:ident = $value:literal),* $(,)?) => {
        $(pub const $name: u16 = $value;)*

        /// Symbolic name of an opcode, if it is known
        pub fn opcode_name(opcode: u16) -> Option<&'static str> {
            match opcode {
                $($value => Some(stringify!($name)),)*
                _ => None,
            }
        }
    };
}

opcodes! {
    // Connection and authentication
    CMSG_AUTH_SESSION = 0x0449,
    CMSG_KEEP_ALIVE = 0x0015,
    CMSG_PING = 0x444D,
    CMSG_WARDEN_DATA = 0x3A04,

    // Character screen
    CMSG_CHAR_ENUM = 0x0502,
    CMSG_CHAR_CREATE = 0x4A36,
    CMSG_CHAR_DELETE = 0x62A0,
    CMSG_CHAR_RENAME = 0x2327,
    CMSG_PLAYER_LOGIN = 0x05B1,
    CMSG_READY_FOR_ACCOUNT_DATA_TIMES = 0x2B16,
    CMSG_REQUEST_ACCOUNT_DATA = 0x6505,
    CMSG_UPDATE_ACCOUNT_DATA = 0x4736,
    CMSG_ADDON_REGISTERED_PREFIXES = 0x0156,
    CMSG_UNREGISTER_ALL_ADDON_PREFIXES = 0x3D54,
    CMSG_VOICE_SESSION_ENABLE = 0x0B13,

    // Logout
    CMSG_LOGOUT_REQUEST = 0x0A25,
    CMSG_LOGOUT_CANCEL = 0x0E04,
    CMSG_PLAYER_LOGOUT = 0x2005,

    // Queries
    CMSG_NAME_QUERY = 0x2224,
    CMSG_QUERY_TIME = 0x1A3C,
    CMSG_TIME_SYNC_RESP = 0x3B0C,
    CMSG_WHO = 0x6C15,
    CMSG_QUEST_POI_QUERY = 0x4037,
    CMSG_ITEM_REFUND_INFO = 0x6F25,
    CMSG_GUILD_BANK_QUERY_TAB = 0x4D06,

    // Social
    CMSG_CONTACT_LIST = 0x0D14,
    CMSG_ADD_FRIEND = 0x6527,
    CMSG_DEL_FRIEND = 0x6A15,
    CMSG_ADD_IGNORE = 0x4726,
    CMSG_SET_CONTACT_NOTES = 0x6E35,
    CMSG_MESSAGECHAT_ADDON_WHISPER = 0x2146,
    CMSG_GROUP_SET_LEADER = 0x7B21,
    CMSG_GUILD_INVITE = 0x2D36,
    CMSG_ARENA_TEAM_ROSTER = 0x2A07,
    CMSG_CALENDAR_ADD_EVENT = 0x2E36,

    // World interaction
    CMSG_TUTORIAL_FLAG = 0x7C17,
    CMSG_GAMEOBJ_USE = 0x4827,
    CMSG_SPELLCLICK = 0x2B24,
    CMSG_QUESTGIVER_ACCEPT_QUEST = 0x5A10,
    MSG_MOVE_START_FORWARD = 0x7814,
    MSG_MOVE_HEARTBEAT = 0x7B24,
    MSG_MOVE_WORLDPORT_ACK = 0x2411,

    // Support
    CMSG_GMTICKET_CREATE = 0x1F25,
    CMSG_GM_REPORT_LAG = 0x3B74,
    CMSG_BUG = 0x6906,
    CMSG_MEETINGSTONE_INFO = 0x6A05,
    CMSG_SET_FACTION_CHEAT = 0x0C13,

    // Server to client
    SMSG_AUTH_RESPONSE = 0x5DB6,
    SMSG_ADDON_INFO = 0x2C14,
    SMSG_CHAR_ENUM = 0x10B0,
    SMSG_LOGOUT_COMPLETE = 0x2137,
    SMSG_NOTIFICATION = 0x14A0,
    SMSG_ACCOUNT_DATA_TIMES = 0x4B05,
    SMSG_TUTORIAL_FLAGS = 0x0B35,
    SMSG_PONG = 0x4D42,
    SMSG_VOICE_SESSION_ROSTER_UPDATE = 0x330C,
}

/// Format an opcode for diagnostics, e.g. `[CMSG_CHAR_ENUM 0x0502 (1282)]`
pub fn opcode_name_for_logging(opcode: u16) -> String {
    let name = opcode_name(opcode & !COMPRESSED_OPCODE_MASK).unwrap_or("UNKNOWN OPCODE");
    format!("[{} 0x{:04X} ({})]", name, opcode, opcode)
}

/// Session phases in which an opcode may be invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Never valid from a client (server-side or socket-level opcodes)
    NeverAllowed,
    /// Known but not implemented
    Unhandled,
    /// After authentication, before entering the world
    AuthedOnly,
    /// With a character attached, or within the grace period after logout
    LoggedInOrRecentlyOut,
    /// Only with a character attached and in the world
    LoggedInOnly,
    /// Only while the attached character is between maps
    DuringTransferOnly,
}

impl Status {
    /// Get a human-readable name for the status
    pub fn name(&self) -> &'static str {
        match self {
            Status::NeverAllowed => "STATUS_NEVER",
            Status::Unhandled => "STATUS_UNHANDLED",
            Status::AuthedOnly => "STATUS_AUTHED",
            Status::LoggedInOrRecentlyOut => "STATUS_LOGGEDIN_OR_RECENTLY_LOGGEDOUT",
            Status::LoggedInOnly => "STATUS_LOGGEDIN",
            Status::DuringTransferOnly => "STATUS_TRANSFER",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which updater is allowed to run an opcode's handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingPlace {
    /// Safe on any thread; handled by whichever updater reaches it first
    AnywhereSafe,
    /// Only ever handled by the world (main) updater
    MainThreadOnly,
    /// Handled by the map updater while the character is in the world,
    /// otherwise by the world updater
    MapThreadSafe,
}

/// Closed set of dispatch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    /// No handler exists
    Null,
    /// Consumed without side effects
    Ignore,
    /// Handled by the connection reader before the session sees it
    EarlyProcess,
    /// Only ever sent by the server
    ServerSide,
    /// Retired by the client
    Deprecated,
    /// Clear the registered addon message prefixes
    UnregisterAddonPrefixes,
    /// Replace the registered addon message prefixes
    AddonRegisteredPrefixes,
    /// Game logic, delegated to the world handlers
    World,
}

/// Immutable description of one opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeDescriptor {
    pub opcode: u16,
    pub name: &'static str,
    pub status: Status,
    pub place: ProcessingPlace,
    pub handler: Handler,
    /// Invocations admitted per wall-clock second (0 = unlimited)
    pub flood_limit: u32,
}

/// Per-second ceiling for an opcode, tiered by measured handler cost
pub fn default_flood_limit(opcode: u16) -> u32 {
    match opcode {
        // Cheap lookups and state toggles
        CMSG_PLAYER_LOGIN
        | CMSG_NAME_QUERY
        | CMSG_QUERY_TIME
        | CMSG_PLAYER_LOGOUT
        | CMSG_LOGOUT_REQUEST
        | CMSG_LOGOUT_CANCEL
        | CMSG_READY_FOR_ACCOUNT_DATA_TIMES
        | CMSG_TIME_SYNC_RESP => 0,

        CMSG_CONTACT_LIST | CMSG_WHO | MSG_MOVE_HEARTBEAT | CMSG_QUESTGIVER_ACCEPT_QUEST => 200,

        CMSG_SET_CONTACT_NOTES | CMSG_GUILD_BANK_QUERY_TAB | CMSG_GAMEOBJ_USE => 50,

        CMSG_QUEST_POI_QUERY => MAX_QUEST_LOG_SIZE,

        CMSG_GM_REPORT_LAG | CMSG_SPELLCLICK => 20,

        CMSG_ADD_FRIEND
        | CMSG_DEL_FRIEND
        | CMSG_ADD_IGNORE
        | CMSG_CHAR_RENAME
        | CMSG_CHAR_DELETE
        | CMSG_BUG
        | CMSG_GROUP_SET_LEADER => 10,

        // Each of these hits the character database
        CMSG_CHAR_CREATE
        | CMSG_CHAR_ENUM
        | CMSG_GMTICKET_CREATE
        | CMSG_CALENDAR_ADD_EVENT
        | CMSG_ARENA_TEAM_ROSTER
        | CMSG_GUILD_INVITE => 3,

        CMSG_ITEM_REFUND_INFO => PLAYER_SLOTS_COUNT,

        _ => 100,
    }
}

use Handler as H;
use ProcessingPlace as P;
use Status as S;

/// Opcodes registered by [`OpcodeTableBuilder::standard`]
const STANDARD_OPCODES: &[(u16, Status, ProcessingPlace, Handler)] = &[
    (CMSG_AUTH_SESSION, S::NeverAllowed, P::AnywhereSafe, H::EarlyProcess),
    (CMSG_KEEP_ALIVE, S::NeverAllowed, P::AnywhereSafe, H::EarlyProcess),
    (CMSG_PING, S::NeverAllowed, P::AnywhereSafe, H::EarlyProcess),
    (CMSG_WARDEN_DATA, S::Unhandled, P::MainThreadOnly, H::Null),
    (CMSG_CHAR_ENUM, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_CHAR_CREATE, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_CHAR_DELETE, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_CHAR_RENAME, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_PLAYER_LOGIN, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_READY_FOR_ACCOUNT_DATA_TIMES, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_REQUEST_ACCOUNT_DATA, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_UPDATE_ACCOUNT_DATA, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_ADDON_REGISTERED_PREFIXES, S::AuthedOnly, P::MainThreadOnly, H::AddonRegisteredPrefixes),
    (CMSG_UNREGISTER_ALL_ADDON_PREFIXES, S::AuthedOnly, P::MainThreadOnly, H::UnregisterAddonPrefixes),
    (CMSG_VOICE_SESSION_ENABLE, S::AuthedOnly, P::AnywhereSafe, H::Ignore),
    (CMSG_LOGOUT_REQUEST, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_LOGOUT_CANCEL, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_PLAYER_LOGOUT, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_NAME_QUERY, S::LoggedInOrRecentlyOut, P::MainThreadOnly, H::World),
    (CMSG_QUERY_TIME, S::LoggedInOrRecentlyOut, P::AnywhereSafe, H::World),
    (CMSG_TIME_SYNC_RESP, S::LoggedInOnly, P::AnywhereSafe, H::World),
    (CMSG_WHO, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_QUEST_POI_QUERY, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_ITEM_REFUND_INFO, S::LoggedInOnly, P::MapThreadSafe, H::World),
    (CMSG_GUILD_BANK_QUERY_TAB, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_CONTACT_LIST, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_ADD_FRIEND, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_DEL_FRIEND, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_ADD_IGNORE, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_SET_CONTACT_NOTES, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_MESSAGECHAT_ADDON_WHISPER, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_GROUP_SET_LEADER, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_GUILD_INVITE, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_ARENA_TEAM_ROSTER, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_CALENDAR_ADD_EVENT, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_TUTORIAL_FLAG, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_GAMEOBJ_USE, S::LoggedInOnly, P::MapThreadSafe, H::World),
    (CMSG_SPELLCLICK, S::LoggedInOnly, P::MapThreadSafe, H::World),
    (CMSG_QUESTGIVER_ACCEPT_QUEST, S::LoggedInOnly, P::MapThreadSafe, H::World),
    (MSG_MOVE_START_FORWARD, S::LoggedInOnly, P::MapThreadSafe, H::World),
    (MSG_MOVE_HEARTBEAT, S::LoggedInOnly, P::MapThreadSafe, H::World),
    (MSG_MOVE_WORLDPORT_ACK, S::DuringTransferOnly, P::MainThreadOnly, H::World),
    (CMSG_GMTICKET_CREATE, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_GM_REPORT_LAG, S::LoggedInOnly, P::MainThreadOnly, H::World),
    (CMSG_BUG, S::AuthedOnly, P::MainThreadOnly, H::World),
    (CMSG_MEETINGSTONE_INFO, S::LoggedInOnly, P::MainThreadOnly, H::Deprecated),
    (CMSG_SET_FACTION_CHEAT, S::Unhandled, P::MainThreadOnly, H::Null),
    (SMSG_AUTH_RESPONSE, S::NeverAllowed, P::AnywhereSafe, H::ServerSide),
    (SMSG_ADDON_INFO, S::NeverAllowed, P::AnywhereSafe, H::ServerSide),
    (SMSG_CHAR_ENUM, S::NeverAllowed, P::AnywhereSafe, H::ServerSide),
    (SMSG_LOGOUT_COMPLETE, S::NeverAllowed, P::AnywhereSafe, H::ServerSide),
    (SMSG_NOTIFICATION, S::NeverAllowed, P::AnywhereSafe, H::ServerSide),
    (SMSG_ACCOUNT_DATA_TIMES, S::NeverAllowed, P::AnywhereSafe, H::ServerSide),
    (SMSG_TUTORIAL_FLAGS, S::NeverAllowed, P::AnywhereSafe, H::ServerSide),
    (SMSG_PONG, S::NeverAllowed, P::AnywhereSafe, H::ServerSide),
    (SMSG_VOICE_SESSION_ROSTER_UPDATE, S::Unhandled, P::AnywhereSafe, H::ServerSide),
];

/// Append-only builder for an [`OpcodeTable`]
#[derive(Debug, Default)]
pub struct OpcodeTableBuilder {
    descriptors: HashMap<u16, OpcodeDescriptor>,
}

impl OpcodeTableBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder pre-populated with every standard opcode
    pub fn standard() -> Result<Self, ProtocolError> {
        let mut builder = Self::new();
        for &(opcode, status, place, handler) in STANDARD_OPCODES {
            builder.register(opcode, status, place, handler)?;
        }
        Ok(builder)
    }

    /// Register an opcode under its well-known name
    pub fn register(
        &mut self,
        opcode: u16,
        status: Status,
        place: ProcessingPlace,
        handler: Handler,
    ) -> Result<&mut Self, ProtocolError> {
        let name = opcode_name(opcode).unwrap_or("UNKNOWN_OPCODE");
        self.register_named(opcode, name, status, place, handler)
    }

    /// Register an opcode with an explicit name
    pub fn register_named(
        &mut self,
        opcode: u16,
        name: &'static str,
        status: Status,
        place: ProcessingPlace,
        handler: Handler,
    ) -> Result<&mut Self, ProtocolError> {
        if opcode == NULL_OPCODE || opcode == UNKNOWN_OPCODE || opcode & COMPRESSED_OPCODE_MASK != 0 {
            return Err(ProtocolError::ReservedOpcode(opcode));
        }
        if self.descriptors.contains_key(&opcode) {
            return Err(ProtocolError::DuplicateOpcode(opcode));
        }
        self.descriptors.insert(
            opcode,
            OpcodeDescriptor {
                opcode,
                name,
                status,
                place,
                handler,
                flood_limit: default_flood_limit(opcode),
            },
        );
        Ok(self)
    }

    /// Override the flood ceiling of an already registered opcode
    pub fn set_flood_limit(&mut self, name: &str, limit: u32) -> Result<&mut Self, ProtocolError> {
        let descriptor = self
            .descriptors
            .values_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| ProtocolError::UnknownOpcodeName(name.to_string()))?;
        descriptor.flood_limit = limit;
        Ok(self)
    }

    /// Freeze the table
    pub fn build(self) -> OpcodeTable {
        OpcodeTable {
            descriptors: self.descriptors,
        }
    }
}

/// Read-only opcode lookup table
#[derive(Debug, Clone, Default)]
pub struct OpcodeTable {
    descriptors: HashMap<u16, OpcodeDescriptor>,
}

static STANDARD_TABLE: OnceLock<OpcodeTable> = OnceLock::new();

impl OpcodeTable {
    /// Build the standard table with default flood ceilings
    pub fn standard() -> Result<Self, ProtocolError> {
        Ok(OpcodeTableBuilder::standard()?.build())
    }

    /// Process-wide standard table
    pub fn global() -> &'static OpcodeTable {
        STANDARD_TABLE.get_or_init(|| {
            Self::standard().unwrap_or_else(|e| {
                error!(error = %e, "Failed to build the standard opcode table");
                OpcodeTable::default()
            })
        })
    }

    /// Look up an opcode; `None` marks an unknown opcode
    #[inline]
    pub fn lookup(&self, opcode: u16) -> Option<&OpcodeDescriptor> {
        self.descriptors.get(&opcode)
    }

    /// Look up an opcode by its symbolic name
    pub fn by_name(&self, name: &str) -> Option<&OpcodeDescriptor> {
        self.descriptors.values().find(|d| d.name == name)
    }

    /// Processing place of an opcode, ignoring the compression bit
    pub fn place_of(&self, opcode: u16) -> Option<ProcessingPlace> {
        self.lookup(opcode & !COMPRESSED_OPCODE_MASK).map(|d| d.place)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpcodeDescriptor> {
        self.descriptors.values()
    }
}
