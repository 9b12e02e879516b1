//! Connection handler module
//!
//! Handles the lifecycle of client connections including:
//! - Frame decoding off the socket
//! - The authentication frame that opens a world session
//! - Feeding inbound packets to the session inbox
//! - A writer task draining the session's outbound channel
//! - Graceful disconnection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::auth::{AccountInfo, AccountType};
use crate::db::Statement;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::net::buffer::{BufferError, ByteBuffer};
use crate::net::packet::WorldPacket;
use crate::net::queue::PacketInbox;
use crate::net::session::{unix_now, WorldSession, GLOBAL_CACHE_MASK};
use crate::net::transport::{encode_frame, ChannelTransport, FrameDecoder, OutboundFrame, Transport};
use crate::protocol::opcodes::{opcode_name_for_logging, CMSG_AUTH_SESSION};
use crate::AppState;

/// Seconds a client has to authenticate
const AUTH_TIMEOUT_SECS: u64 = 30;

/// Initial read buffer size
const READ_BUFFER_SIZE: usize = 4096;

/// Decoded authentication frame
#[derive(Debug)]
pub struct AuthSession {
    pub account: AccountInfo,
    pub account_name: String,
    /// Addon blob, positioned at its start
    pub addon_data: ByteBuffer,
}

/// Decode `[u32 account][cstring name][u8 security][u8 expansion][u32 locale][addon blob]`
pub fn parse_auth_session(payload: &[u8]) -> std::result::Result<AuthSession, ProtocolError> {
    let mut buffer = ByteBuffer::from_bytes(payload);
    let malformed = |e: BufferError| ProtocolError::MalformedPacket(e.to_string());

    let account_id = buffer.read_u32().map_err(malformed)?;
    let account_name = buffer.read_cstring().map_err(malformed)?;
    let security = buffer.read_u8().map_err(malformed)?;
    let expansion = buffer.read_u8().map_err(malformed)?;
    let locale = buffer.read_u32().map_err(malformed)?;

    if account_id == 0 {
        return Err(ProtocolError::MalformedPacket("account id 0".to_string()));
    }

    let addon_data = ByteBuffer::from_bytes(buffer.read_remaining());

    Ok(AuthSession {
        account: AccountInfo {
            id: account_id,
            security: AccountType::from_u8(security),
            expansion,
            locale,
        },
        account_name,
        addon_data,
    })
}

/// Connection handler for processing client connections
pub struct ConnectionHandler {
    /// Shared application state
    state: Arc<AppState>,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Handle a TCP connection
    pub async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling TCP connection");

        stream.set_nodelay(true)?;

        if !self.state.world.state().accepting_connections() {
            debug!(address = %addr, "World not accepting connections");
            return Err(NetworkError::ConnectionClosed.into());
        }

        let (mut reader, writer) = stream.into_split();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut decoder = FrameDecoder::new();

        let (opcode, payload) = tokio::time::timeout(
            Duration::from_secs(AUTH_TIMEOUT_SECS),
            read_frame(&mut reader, &mut buffer, &mut decoder),
        )
        .await
        .map_err(|_| NetworkError::Timeout)??;

        if opcode != CMSG_AUTH_SESSION {
            warn!(
                address = %addr,
                opcode = %opcode_name_for_logging(opcode),
                "First packet was not an authentication request"
            );
            return Err(ProtocolError::UnexpectedOpcode {
                state: "authentication".to_string(),
                opcode,
            }
            .into());
        }

        let mut auth = parse_auth_session(&payload)?;
        let account_id = auth.account.id;
        self.state.bans.register_account(account_id, &auth.account_name);

        let (transport, receiver) = ChannelTransport::new(addr.to_string(), self.state.config.send_buffer_frames);
        let shutdown = transport.shutdown_signal();
        let transport: Arc<dyn Transport> = Arc::new(transport);

        tokio::spawn(write_loop(writer, receiver, addr));

        let mut session = WorldSession::new(auth.account, Arc::clone(&transport), self.state.services.clone());
        session.read_addons_info(&mut auth.addon_data);
        self.load_account_state(&mut session);

        let inbox = session.inbox();
        self.state.session_manager.add_session(session);

        info!(account_id, account = %auth.account_name, address = %addr, "Session authenticated");

        // Feed the inbox until the peer leaves or the session closes the transport
        let result: Result<()> = loop {
            if let Err(e) = queue_frames(&mut decoder, &mut buffer, &inbox, account_id) {
                break Err(e);
            }

            tokio::select! {
                read = reader.read_buf(&mut buffer) => match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => {}
                    Err(e) => break Err(e.into()),
                },
                _ = shutdown.notified() => {
                    debug!(account_id, "Transport closed by the session");
                    break Ok(());
                }
            }
        };

        if let Err(e) = &result {
            warn!(account_id, address = %addr, error = %e, "Connection error");
        }
        debug!(account_id, address = %addr, "Connection handler ending");
        transport.close();

        result
    }

    /// Load global account data and tutorial flags into a new session
    fn load_account_state(&self, session: &mut WorldSession) {
        let account_id = session.account_id();
        let database = Arc::clone(&self.state.services.database);

        match database.query(Statement::SelAccountData { account_id }) {
            Ok(result) => {
                if let Err(e) = session.load_account_data(&result, GLOBAL_CACHE_MASK) {
                    warn!(account_id, error = %e, "Failed to load account data");
                }
            }
            Err(e) => warn!(account_id, error = %e, "Account data query failed"),
        }

        match database.query(Statement::SelTutorials { account_id }) {
            Ok(result) => {
                if let Err(e) = session.load_tutorials_data(&result) {
                    warn!(account_id, error = %e, "Failed to load tutorial flags");
                }
            }
            Err(e) => warn!(account_id, error = %e, "Tutorial query failed"),
        }
    }
}

/// Read until one complete frame is buffered
async fn read_frame(
    reader: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
    decoder: &mut FrameDecoder,
) -> Result<(u16, Vec<u8>)> {
    loop {
        if let Some(frame) = decoder.try_decode(buffer)? {
            return Ok(frame);
        }
        if reader.read_buf(buffer).await? == 0 {
            return Err(NetworkError::ConnectionClosed.into());
        }
    }
}

/// Move every complete buffered frame into the session inbox
fn queue_frames(decoder: &mut FrameDecoder, buffer: &mut BytesMut, inbox: &PacketInbox, account_id: u32) -> Result<()> {
    while let Some((opcode, payload)) = decoder.try_decode(buffer)? {
        trace!(account_id, opcode = %opcode_name_for_logging(opcode), size = payload.len(), "Packet received");
        inbox.queue_packet(WorldPacket::from_payload(opcode, &payload), unix_now());
    }
    Ok(())
}

/// Drain the outbound channel onto the socket
///
/// Ends once every sender is gone, i.e. when the session is dropped.
async fn write_loop(mut writer: OwnedWriteHalf, mut receiver: mpsc::Receiver<OutboundFrame>, addr: SocketAddr) {
    while let Some(frame) = receiver.recv().await {
        let bytes = match encode_frame(frame.opcode, &frame.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(address = %addr, opcode = %opcode_name_for_logging(frame.opcode), error = %e, "Dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(address = %addr, error = %e, "Write failed");
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(address = %addr, error = %e, "Error during socket shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::game::world::WorldState;
    use crate::protocol::opcodes::{AUTH_OK, SMSG_ADDON_INFO, SMSG_AUTH_RESPONSE};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::broadcast;

    fn auth_payload(account_id: u32, name: &str) -> Vec<u8> {
        let mut buffer = ByteBuffer::new();
        buffer.write_u32(account_id);
        buffer.write_cstring(name);
        buffer.write_u8(2);
        buffer.write_u8(3);
        buffer.write_u32(0x656E_5553);
        buffer.as_bytes().to_vec()
    }

    #[test]
    fn test_parse_auth_session() {
        let auth = parse_auth_session(&auth_payload(42, "ALICE")).unwrap();
        assert_eq!(auth.account.id, 42);
        assert_eq!(auth.account.security, AccountType::GameMaster);
        assert_eq!(auth.account.expansion, 3);
        assert_eq!(auth.account_name, "ALICE");
        assert_eq!(auth.addon_data.remaining(), 0);
    }

    #[test]
    fn test_parse_auth_session_rejects_truncated() {
        let payload = auth_payload(42, "ALICE");
        assert!(matches!(
            parse_auth_session(&payload[..payload.len() - 2]),
            Err(ProtocolError::MalformedPacket(_))
        ));
        assert!(parse_auth_session(&auth_payload(0, "NOBODY")).is_err());
    }

    #[tokio::test]
    async fn test_authenticated_connection_receives_auth_response() {
        let (tx, _rx) = broadcast::channel(1);
        let state = Arc::new(AppState::new(ServerConfig::default(), tx).unwrap());
        state.world.set_state(WorldState::Running);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();

        let server_state = Arc::clone(&state);
        tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            let _ = ConnectionHandler::new(server_state).handle_tcp(stream, addr).await;
        });

        let mut client = TcpStream::connect(local).await.unwrap();
        let frame = encode_frame(CMSG_AUTH_SESSION, &auth_payload(7, "BOB")).unwrap();
        client.write_all(&frame).await.unwrap();

        let mut buffer = BytesMut::new();
        let mut decoder = FrameDecoder::new();
        let mut opcodes = Vec::new();
        let mut first_payload = Vec::new();
        while opcodes.len() < 2 {
            if let Some((opcode, payload)) = decoder.try_decode(&mut buffer).unwrap() {
                if opcodes.is_empty() {
                    first_payload = payload;
                }
                opcodes.push(opcode);
                continue;
            }
            assert!(client.read_buf(&mut buffer).await.unwrap() > 0);
        }

        assert_eq!(opcodes, vec![SMSG_AUTH_RESPONSE, SMSG_ADDON_INFO]);
        assert_eq!(first_payload.last(), Some(&AUTH_OK));
        assert!(state.session_manager.get(7).is_some());
    }
}
