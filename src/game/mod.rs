//! Game module
//!
//! The session engine does not simulate the world. It reaches the world
//! through two seams:
//! - [`PlayerEntity`]: the character attached to a session
//! - [`WorldHandlers`]: bodies of the game opcodes and continuations of
//!   asynchronous queries
//!
//! [`handlers::AccountHandlers`] implements the account-level opcodes that
//! need nothing but the session itself.

pub mod handlers;
pub mod world;

use tracing::{trace, warn};

use crate::db::callback::QueryCompletion;
use crate::net::buffer::BufferError;
use crate::net::packet::WorldPacket;
use crate::net::session::WorldSession;
use crate::protocol::opcodes::opcode_name_for_logging;

/// Character attached to a session
///
/// Owned exclusively by the session while attached; handlers running on
/// the session's drain may mutate it freely.
pub trait PlayerEntity: Send {
    fn guid_low(&self) -> u32;

    fn name(&self) -> &str;

    /// Whether the character is placed on a map
    fn is_in_world(&self) -> bool;

    /// Whether a cross-map teleport is waiting for its acknowledgement
    fn is_being_teleported_far(&self) -> bool;

    /// Complete a pending far teleport; returns whether progress was made
    fn finish_far_teleport(&mut self) -> bool;

    /// World-side cleanup when the character leaves the world
    fn on_logout(&mut self, save: bool, socket_alive: bool);
}

/// Game opcode bodies and query continuations
pub trait WorldHandlers: Send + Sync {
    /// Handle one admitted packet
    ///
    /// A read past the end of the payload is reported as an error; the
    /// session logs it and drops the packet.
    fn handle(&self, session: &mut WorldSession, packet: &mut WorldPacket) -> Result<(), BufferError>;

    /// Continue a finished asynchronous query
    fn on_query_complete(&self, session: &mut WorldSession, completion: QueryCompletion) {
        warn!(
            account_id = session.account_id(),
            slot = %completion.slot,
            "Query completed with no continuation"
        );
    }
}

/// Handlers that consume every packet without effect
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWorldHandlers;

impl WorldHandlers for NullWorldHandlers {
    fn handle(&self, session: &mut WorldSession, packet: &mut WorldPacket) -> Result<(), BufferError> {
        trace!(
            account_id = session.account_id(),
            opcode = %opcode_name_for_logging(packet.opcode()),
            "No world handler, packet consumed"
        );
        packet.rfinish();
        Ok(())
    }
}
