//! World packet type
//!
//! A `WorldPacket` is an opcode tag plus its payload buffer. Inbound packets
//! additionally carry the bookkeeping the session queue needs: the arrival
//! sequence stamped on first enqueue and the update generation in which the
//! packet was last deferred.

use std::ops::{Deref, DerefMut};

use crate::net::buffer::ByteBuffer;

/// An opcode-tagged packet
#[derive(Debug, Clone)]
pub struct WorldPacket {
    opcode: u16,
    buffer: ByteBuffer,
    /// Arrival sequence (0 until the packet is first queued)
    arrival: u64,
    /// Update generation of the most recent deferral
    deferred_in: Option<u64>,
    /// How many times the packet has been put back on the queue
    deferrals: u32,
}

impl WorldPacket {
    /// Create an empty packet for writing
    pub fn new(opcode: u16, capacity: usize) -> Self {
        Self::with_buffer(opcode, ByteBuffer::with_capacity(capacity))
    }

    /// Create a packet around a received payload
    pub fn from_payload(opcode: u16, payload: &[u8]) -> Self {
        Self::with_buffer(opcode, ByteBuffer::from_bytes(payload))
    }

    /// Create a packet around an existing buffer
    pub fn with_buffer(opcode: u16, buffer: ByteBuffer) -> Self {
        Self {
            opcode,
            buffer,
            arrival: 0,
            deferred_in: None,
            deferrals: 0,
        }
    }

    #[inline]
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    #[inline]
    pub fn set_opcode(&mut self, opcode: u16) {
        self.opcode = opcode;
    }

    /// Arrival sequence assigned by the inbound queue
    #[inline]
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub(crate) fn stamp_arrival(&mut self, sequence: u64) {
        if self.arrival == 0 {
            self.arrival = sequence;
        }
    }

    /// Generation in which this packet was last deferred
    #[inline]
    pub fn deferred_in(&self) -> Option<u64> {
        self.deferred_in
    }

    #[inline]
    pub fn deferrals(&self) -> u32 {
        self.deferrals
    }

    /// Tag the packet as deferred during `generation`
    pub fn mark_deferred(&mut self, generation: u64) {
        self.deferred_in = Some(generation);
        self.deferrals = self.deferrals.saturating_add(1);
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_buffer(self) -> ByteBuffer {
        self.buffer
    }
}

impl Deref for WorldPacket {
    type Target = ByteBuffer;

    fn deref(&self) -> &ByteBuffer {
        &self.buffer
    }
}

impl DerefMut for WorldPacket {
    fn deref_mut(&mut self) -> &mut ByteBuffer {
        &mut self.buffer
    }
}
