//! Transport abstraction module
//!
//! The session never touches a socket directly. It hands finished packets to
//! a [`Transport`], which either queues them for the connection's writer task
//! ([`ChannelTransport`]) or records them (tests).
//!
//! Wire framing for the TCP listener is also defined here:
//!
//! ```text
//! [u16 BE size][u16 LE opcode][payload]
//! ```
//!
//! `size` counts the opcode and the payload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::error::{NetworkError, ProtocolError};
use crate::net::buffer::MAX_PACKET_SIZE;

/// Bytes of framing ahead of every payload
pub const FRAME_HEADER_SIZE: usize = 4;

/// Outbound side of a client connection
pub trait Transport: Send + Sync {
    /// Queue one packet for delivery
    fn send(&self, opcode: u16, payload: &[u8]) -> Result<(), NetworkError>;

    /// Request the connection be closed; idempotent
    fn close(&self);

    /// Whether the connection is closed or closing
    fn is_closed(&self) -> bool;

    /// Remote address as text, used for logging and IP bans
    fn remote_address(&self) -> &str;
}

/// A packet waiting for the writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub opcode: u16,
    pub payload: Vec<u8>,
}

/// Transport backed by a bounded channel drained by a writer task
pub struct ChannelTransport {
    address: String,
    sender: mpsc::Sender<OutboundFrame>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
}

impl ChannelTransport {
    /// Create the transport and the receiving end for the writer task
    pub fn new(address: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let transport = Self {
            address: address.into(),
            sender,
            closed: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        };
        (transport, receiver)
    }

    /// Notified once when the transport is closed
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, opcode: u16, payload: &[u8]) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed);
        }
        trace!(opcode = format_args!("{:#06x}", opcode), size = payload.len(), "Queueing frame");
        self.sender
            .try_send(OutboundFrame {
                opcode,
                payload: payload.to_vec(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NetworkError::WriteBufferFull,
                mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed,
            })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // notify_one stores a permit, so a writer that is not yet waiting still wakes
            self.shutdown.notify_one();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    fn remote_address(&self) -> &str {
        &self.address
    }
}

/// Transport that keeps every sent frame in memory
///
/// Used by bots and tests that drive a session without a socket.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    address: String,
    frames: Mutex<Vec<OutboundFrame>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Remove and return everything sent so far
    pub fn take_frames(&self) -> Vec<OutboundFrame> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Opcodes sent so far, oldest first
    pub fn sent_opcodes(&self) -> Vec<u16> {
        self.frames.lock().iter().map(|f| f.opcode).collect()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, opcode: u16, payload: &[u8]) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed);
        }
        self.frames.lock().push(OutboundFrame {
            opcode,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remote_address(&self) -> &str {
        &self.address
    }
}

/// Encode one frame for the wire
pub fn encode_frame(opcode: u16, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
    let size = payload.len() + 2;
    if size > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge {
            size,
            max: MAX_PACKET_SIZE,
        });
    }
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.put_u16(size as u16);
    out.put_u16_le(opcode);
    out.put_slice(payload);
    Ok(out)
}

/// Incremental decoder for inbound frames
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Split one complete frame off the front of `buf`, if available
    pub fn try_decode(&mut self, buf: &mut BytesMut) -> Result<Option<(u16, Vec<u8>)>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if size < 2 {
            return Err(ProtocolError::InvalidPacketSize(size));
        }
        if buf.len() < 2 + size {
            buf.reserve(2 + size - buf.len());
            return Ok(None);
        }

        buf.advance(2);
        let opcode = buf.get_u16_le();
        let payload = buf.split_to(size - 2).to_vec();
        Ok(Some((opcode, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let mut wire = encode_frame(0x0502, &[1, 2, 3]).unwrap();
        assert_eq!(&wire[..4], &[0x00, 0x05, 0x02, 0x05]);

        let mut decoder = FrameDecoder::new();
        let (opcode, payload) = decoder.try_decode(&mut wire).unwrap().unwrap();
        assert_eq!(opcode, 0x0502);
        assert_eq!(payload, vec![1, 2, 3]);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let full = encode_frame(0x0001, &[9; 10]).unwrap();
        let mut decoder = FrameDecoder::new();

        let mut partial = BytesMut::from(&full[..7]);
        assert!(decoder.try_decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[7..]);
        assert!(decoder.try_decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_invalid_size_rejected() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00][..]);
        let err = FrameDecoder::new().try_decode(&mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidPacketSize(1));
    }

    #[tokio::test]
    async fn test_channel_transport_send_and_close() {
        let (transport, mut rx) = ChannelTransport::new("127.0.0.1:1234", 4);
        transport.send(0x0001, &[7]).unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.opcode, 0x0001);
        assert_eq!(frame.payload, vec![7]);

        let signal = transport.shutdown_signal();
        transport.close();
        signal.notified().await;

        assert!(transport.is_closed());
        assert_eq!(transport.send(1, &[]), Err(NetworkError::ConnectionClosed));
    }

    #[test]
    fn test_memory_transport_records() {
        let transport = MemoryTransport::new("bot");
        transport.send(3, &[1]).unwrap();
        transport.send(4, &[]).unwrap();
        assert_eq!(transport.sent_opcodes(), vec![3, 4]);

        transport.close();
        assert!(transport.send(5, &[]).is_err());
        assert_eq!(transport.take_frames().len(), 2);
        assert!(transport.take_frames().is_empty());
    }

    #[test]
    fn test_channel_transport_full() {
        let (transport, _rx) = ChannelTransport::new("addr", 1);
        transport.send(1, &[]).unwrap();
        assert_eq!(transport.send(1, &[]), Err(NetworkError::WriteBufferFull));
    }
}
