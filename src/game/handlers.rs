//! Account-level opcode handlers
//!
//! Handles the opcodes whose effects stay inside the session: character
//! list requests, account data, tutorial flags and logout timing. Anything
//! else is consumed and left to a real world implementation.

use std::io::Read;

use flate2::read::ZlibDecoder;
use tracing::{debug, trace, warn};

use crate::db::callback::{CallbackSlot, QueryCompletion, QueryParam};
use crate::db::Statement;
use crate::game::WorldHandlers;
use crate::net::buffer::BufferError;
use crate::net::packet::WorldPacket;
use crate::net::session::{WorldSession, GLOBAL_CACHE_MASK};
use crate::protocol::opcodes::{
    opcode_name_for_logging, CMSG_CHAR_ENUM, CMSG_LOGOUT_CANCEL, CMSG_LOGOUT_REQUEST,
    CMSG_READY_FOR_ACCOUNT_DATA_TIMES, CMSG_TUTORIAL_FLAG, CMSG_UPDATE_ACCOUNT_DATA, SMSG_CHAR_ENUM,
};

/// Largest account data blob accepted once inflated
pub const MAX_ACCOUNT_DATA_SIZE: u32 = 0xFFFF;

#[derive(Debug, Default, Clone, Copy)]
pub struct AccountHandlers;

impl AccountHandlers {
    fn handle_char_enum(&self, session: &mut WorldSession) {
        let statement = Statement::SelCharEnum {
            account_id: session.account_id(),
        };
        if let Err(e) = session.issue_query(CallbackSlot::CharEnum, statement, QueryParam::None) {
            debug!(account_id = session.account_id(), error = %e, "Character list already requested");
        }
    }

    fn handle_update_account_data(
        &self,
        session: &mut WorldSession,
        packet: &mut WorldPacket,
    ) -> Result<(), BufferError> {
        let data_type = packet.read_u32()? as usize;
        let time = u64::from(packet.read_u32()?);
        let size = packet.read_u32()?;

        if size == 0 {
            session.set_account_data(data_type, 0, String::new());
            return Ok(());
        }
        if size > MAX_ACCOUNT_DATA_SIZE {
            warn!(account_id = session.account_id(), size, "Account data too large, ignored");
            packet.rfinish();
            return Ok(());
        }

        let mut inflated = Vec::with_capacity(size as usize);
        let compressed = packet.read_remaining();
        if let Err(e) = ZlibDecoder::new(compressed)
            .take(u64::from(size))
            .read_to_end(&mut inflated)
        {
            warn!(account_id = session.account_id(), error = %e, "Account data failed to inflate");
            return Ok(());
        }

        let data = String::from_utf8_lossy(&inflated).into_owned();
        session.set_account_data(data_type, time, data);
        Ok(())
    }

    fn handle_tutorial_flag(&self, session: &mut WorldSession, packet: &mut WorldPacket) -> Result<(), BufferError> {
        let flag = packet.read_u32()?;
        let index = (flag / 32) as usize;
        let bit = flag % 32;

        let value = session.tutorial_int(index) | (1 << bit);
        session.set_tutorial_int(index, value);
        Ok(())
    }

    fn send_char_enum(&self, session: &mut WorldSession, completion: QueryCompletion) {
        let result = match completion.result {
            Ok(result) => result,
            Err(e) => {
                warn!(account_id = session.account_id(), error = %e, "Character list query failed");
                return;
            }
        };

        let mut packet = WorldPacket::new(SMSG_CHAR_ENUM, 1 + result.len() * 16);
        let characters: Vec<(u32, &str)> = result
            .rows()
            .iter()
            .filter_map(|row| Some((row.u32_at(0).ok()?, row.str_at(1).ok()?)))
            .collect();

        packet.write_u8(characters.len().min(u8::MAX as usize) as u8);
        for (guid, name) in characters.iter().take(u8::MAX as usize) {
            packet.write_u32(*guid);
            packet.write_cstring(name);
        }
        session.send_packet(&packet, false);
    }
}

impl WorldHandlers for AccountHandlers {
    fn handle(&self, session: &mut WorldSession, packet: &mut WorldPacket) -> Result<(), BufferError> {
        match packet.opcode() {
            CMSG_CHAR_ENUM => self.handle_char_enum(session),
            CMSG_READY_FOR_ACCOUNT_DATA_TIMES => session.send_account_data_times(GLOBAL_CACHE_MASK),
            CMSG_UPDATE_ACCOUNT_DATA => self.handle_update_account_data(session, packet)?,
            CMSG_TUTORIAL_FLAG => self.handle_tutorial_flag(session, packet)?,
            CMSG_LOGOUT_REQUEST => {
                let now = session.now();
                session.logout_request(now);
            }
            CMSG_LOGOUT_CANCEL => session.logout_request(0),
            opcode => {
                trace!(
                    account_id = session.account_id(),
                    opcode = %opcode_name_for_logging(opcode),
                    "Opcode left to the world"
                );
                packet.rfinish();
            }
        }
        Ok(())
    }

    fn on_query_complete(&self, session: &mut WorldSession, completion: QueryCompletion) {
        match completion.slot {
            CallbackSlot::CharEnum => self.send_char_enum(session, completion),
            slot => debug!(account_id = session.account_id(), slot = %slot, "Query result unused"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use crate::auth::{AccountInfo, InMemoryAccountBans};
    use crate::db::{Field, MemoryDatabase, QueryResult, Row};
    use crate::net::filter::UpdateFilter;
    use crate::net::session::{SessionServices, SessionSettings};
    use crate::net::transport::{MemoryTransport, Transport};
    use crate::protocol::addon::AddonRegistry;
    use crate::protocol::opcodes::OpcodeTable;

    fn session(database: Arc<MemoryDatabase>, transport: Arc<MemoryTransport>) -> WorldSession {
        let services = SessionServices {
            opcodes: Arc::new(OpcodeTable::standard().unwrap()),
            handlers: Arc::new(AccountHandlers),
            database,
            bans: Arc::new(InMemoryAccountBans::new()),
            addons: Arc::new(AddonRegistry::new()),
            settings: Arc::new(SessionSettings::default()),
        };
        WorldSession::new(AccountInfo::new(3), transport, services)
    }

    #[test]
    fn test_char_enum_round_trip_through_callbacks() {
        let database = Arc::new(MemoryDatabase::new());
        database.set_result(
            "SEL_CHAR_ENUM",
            QueryResult::new(vec![Row::new(vec![Field::UInt(77), Field::Text("Arthas".into())])]),
        );
        let transport = Arc::new(MemoryTransport::new("addr"));
        let mut session = session(database, transport.clone());

        let now = session.now();
        session.inbox().queue_packet(WorldPacket::from_payload(CMSG_CHAR_ENUM, &[]), now);
        assert!(session.update_at(UpdateFilter::World, now));

        let frames = transport.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, SMSG_CHAR_ENUM);
        assert_eq!(frames[0].payload[0], 1);
        assert!(!transport.is_closed());
    }

    #[test]
    fn test_tutorial_flag_sets_bit() {
        let database = Arc::new(MemoryDatabase::new());
        let transport = Arc::new(MemoryTransport::new("addr"));
        let mut session = session(database, transport);

        let mut packet = WorldPacket::new(CMSG_TUTORIAL_FLAG, 4);
        packet.write_u32(33);
        AccountHandlers.handle(&mut session, &mut packet).unwrap();

        assert_eq!(session.tutorial_int(1), 0b10);
    }

    #[test]
    fn test_update_account_data_inflates() {
        let database = Arc::new(MemoryDatabase::new());
        let transport = Arc::new(MemoryTransport::new("addr"));
        let mut session = session(database.clone(), transport);

        let text = b"SET uiScale 1";
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut packet = WorldPacket::new(CMSG_UPDATE_ACCOUNT_DATA, 64);
        packet.write_u32(0);
        packet.write_u32(1234);
        packet.write_u32(text.len() as u32);
        packet.write_bytes(&compressed);

        AccountHandlers.handle(&mut session, &mut packet).unwrap();
        assert_eq!(session.account_data(0).unwrap().data, "SET uiScale 1");
        assert_eq!(session.account_data(0).unwrap().time, 1234);
    }

    #[test]
    fn test_truncated_update_account_data_is_an_error() {
        let database = Arc::new(MemoryDatabase::new());
        let transport = Arc::new(MemoryTransport::new("addr"));
        let mut session = session(database, transport);

        let mut packet = WorldPacket::from_payload(CMSG_UPDATE_ACCOUNT_DATA, &[1, 0]);
        assert!(AccountHandlers.handle(&mut session, &mut packet).is_err());
    }

    #[test]
    fn test_logout_request_and_cancel() {
        let database = Arc::new(MemoryDatabase::new());
        let transport = Arc::new(MemoryTransport::new("addr"));
        let mut session = session(database, transport);

        let mut request = WorldPacket::from_payload(CMSG_LOGOUT_REQUEST, &[]);
        AccountHandlers.handle(&mut session, &mut request).unwrap();
        assert!(session.is_logging_out());

        let mut cancel = WorldPacket::from_payload(CMSG_LOGOUT_CANCEL, &[]);
        AccountHandlers.handle(&mut session, &mut cancel).unwrap();
        assert!(!session.is_logging_out());
    }
}
