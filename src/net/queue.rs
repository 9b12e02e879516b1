//! Inbound packet queue
//!
//! The connection reader pushes packets, the session's updaters drain them.
//! Draining is filtered: an updater only ever sees the packets it is allowed
//! to handle (see [`UpdateFilter`]), and packets it skips keep their place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::net::filter::UpdateFilter;
use crate::net::flood::{PacketThrottler, ThrottleSettings};
use crate::net::packet::WorldPacket;
use crate::protocol::opcodes::OpcodeTable;

/// Identity of the next eligible packet, as seen by [`InboundQueue::peek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMark {
    pub arrival: u64,
    pub opcode: u16,
    pub deferred_in: Option<u64>,
}

/// Producer/consumer-safe FIFO of inbound packets
#[derive(Debug)]
pub struct InboundQueue {
    packets: Mutex<VecDeque<WorldPacket>>,
    sequence: AtomicU64,
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundQueue {
    pub fn new() -> Self {
        Self {
            packets: Mutex::new(VecDeque::new()),
            sequence: AtomicU64::new(1),
        }
    }

    /// Append a packet; first-time packets get the next arrival number
    pub fn push(&self, mut packet: WorldPacket) {
        if packet.arrival() == 0 {
            packet.stamp_arrival(self.sequence.fetch_add(1, Ordering::Relaxed));
        }
        self.packets.lock().push_back(packet);
    }

    /// Describe the first packet `eligible` accepts, without removing it
    pub fn peek<F>(&self, eligible: F) -> Option<PacketMark>
    where
        F: Fn(&WorldPacket) -> bool,
    {
        self.packets.lock().iter().find(|p| eligible(*p)).map(|p| PacketMark {
            arrival: p.arrival(),
            opcode: p.opcode(),
            deferred_in: p.deferred_in(),
        })
    }

    /// Remove and return the first packet `eligible` accepts
    pub fn drain_next<F>(&self, eligible: F) -> Option<WorldPacket>
    where
        F: Fn(&WorldPacket) -> bool,
    {
        let mut packets = self.packets.lock();
        let index = packets.iter().position(|p| eligible(p))?;
        packets.remove(index)
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    /// Drop everything queued; returns how many packets were dropped
    pub fn clear(&self) -> usize {
        let mut packets = self.packets.lock();
        let dropped = packets.len();
        packets.clear();
        dropped
    }
}

/// Build the eligibility predicate for one updater
pub fn eligibility<'a>(
    table: &'a OpcodeTable,
    filter: UpdateFilter,
    player_in_world: Option<bool>,
) -> impl Fn(&WorldPacket) -> bool + 'a {
    move |packet: &WorldPacket| filter.accepts(table.place_of(packet.opcode()), player_in_world)
}

/// Producer-facing end of a session: throttling plus the queue itself
///
/// Shared between the connection reader and the session.
#[derive(Debug)]
pub struct PacketInbox {
    queue: InboundQueue,
    throttler: Mutex<PacketThrottler>,
    last_activity: AtomicU64,
    account_id: u32,
    address: String,
}

impl PacketInbox {
    pub fn new(account_id: u32, address: impl Into<String>, throttle: Arc<ThrottleSettings>, now: u64) -> Self {
        Self {
            queue: InboundQueue::new(),
            throttler: Mutex::new(PacketThrottler::new(throttle)),
            last_activity: AtomicU64::new(now),
            account_id,
            address: address.into(),
        }
    }

    /// Accept a packet from the connection; returns whether it was queued
    pub fn queue_packet(&self, packet: WorldPacket, now: u64) -> bool {
        self.touch(now);

        if self
            .throttler
            .lock()
            .must_discard(packet.opcode(), now, self.account_id, &self.address)
        {
            trace!(
                account_id = self.account_id,
                opcode = format_args!("{:#06x}", packet.opcode()),
                "Packet throttled"
            );
            return false;
        }

        self.queue.push(packet);
        true
    }

    pub fn queue(&self) -> &InboundQueue {
        &self.queue
    }

    /// Second of the most recent client activity
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now: u64) {
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opcodes::{CMSG_CHAR_ENUM, CMSG_GAMEOBJ_USE, CMSG_QUERY_TIME};
    use std::collections::HashMap;

    fn packet(opcode: u16) -> WorldPacket {
        WorldPacket::from_payload(opcode, &[])
    }

    #[test]
    fn test_fifo_with_arrival_stamps() {
        let queue = InboundQueue::new();
        queue.push(packet(1));
        queue.push(packet(2));

        let first = queue.drain_next(|_| true).unwrap();
        let second = queue.drain_next(|_| true).unwrap();
        assert_eq!((first.opcode(), first.arrival()), (1, 1));
        assert_eq!((second.opcode(), second.arrival()), (2, 2));
        assert!(queue.drain_next(|_| true).is_none());
    }

    #[test]
    fn test_requeue_keeps_arrival() {
        let queue = InboundQueue::new();
        queue.push(packet(1));
        let mut p = queue.drain_next(|_| true).unwrap();
        p.mark_deferred(4);
        queue.push(p);

        let mark = queue.peek(|_| true).unwrap();
        assert_eq!(mark.arrival, 1);
        assert_eq!(mark.deferred_in, Some(4));
    }

    #[test]
    fn test_filtered_drain_skips_ineligible() {
        let table = OpcodeTable::global();
        let queue = InboundQueue::new();
        queue.push(packet(CMSG_CHAR_ENUM));
        queue.push(packet(CMSG_GAMEOBJ_USE));
        queue.push(packet(CMSG_QUERY_TIME));

        // Map updater with the player in world: main-thread opcodes stay put
        let map = eligibility(table, UpdateFilter::Map, Some(true));
        assert_eq!(queue.peek(&map).unwrap().opcode, CMSG_GAMEOBJ_USE);
        assert_eq!(queue.drain_next(&map).unwrap().opcode(), CMSG_GAMEOBJ_USE);
        assert_eq!(queue.drain_next(&map).unwrap().opcode(), CMSG_QUERY_TIME);
        assert!(queue.drain_next(&map).is_none());

        let world = eligibility(table, UpdateFilter::World, Some(true));
        assert_eq!(queue.drain_next(&world).unwrap().opcode(), CMSG_CHAR_ENUM);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_reports_count() {
        let queue = InboundQueue::new();
        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_inbox_throttles_and_tracks_activity() {
        let mut limits = HashMap::new();
        limits.insert(CMSG_QUERY_TIME, 1);
        let inbox = PacketInbox::new(
            1,
            "addr",
            Arc::new(ThrottleSettings { limits, log_interval_secs: 60 }),
            10,
        );

        assert!(inbox.queue_packet(packet(CMSG_QUERY_TIME), 20));
        assert!(!inbox.queue_packet(packet(CMSG_QUERY_TIME), 20));
        assert!(inbox.queue_packet(packet(CMSG_CHAR_ENUM), 20));

        assert_eq!(inbox.queue().len(), 2);
        assert_eq!(inbox.last_activity(), 20);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(InboundQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        queue.push(packet(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut arrivals: Vec<u64> = std::iter::from_fn(|| queue.drain_next(|_| true))
            .map(|p| p.arrival())
            .collect();
        arrivals.sort_unstable();
        arrivals.dedup();
        assert_eq!(arrivals.len(), 400);
    }
}
