//! The packet queue (§4.D): stored type-1 SYNs awaiting Simultaneous Open, plus bookkeeping
//! for type-2 attachments which live directly on a session's `stored` field.
//!
//! TCP-table-scoped and shares the TCP table's lock (§5) — there is deliberately no separate
//! `Mutex`/`Spinlock` here. Capacity (`max_stored_pkts`) spans both kinds of stored packet
//! (§4.D "Total stored-packet count..."), so the queue tracks the type-2 count even though it
//! does not own those packets itself.

use crate::mask::Mask;
use crate::proto::{Transport4, Transport6};
use crate::time::Instant;

/// An opaque stored packet. Parsing and header assembly are out of scope (§1); the core only
/// ever copies this buffer in and back out again.
pub type RawPacket = Vec<u8>;

/// A parked type-1 (v4-originated, no BIB yet) SYN.
#[derive(Debug, Clone)]
pub struct Node {
    pub src6: Transport6,
    pub dst6: Transport6,
    pub src4: Transport4,
    pub dst4: Transport4,
    pub arrival: Instant,
    pub packet: RawPacket,
}

/// The per-TCP-table packet queue.
#[derive(Debug, Default)]
pub struct PacketQueue {
    nodes: Vec<Node>,
    type2_count: usize,
}

impl PacketQueue {
    pub fn new() -> Self {
        PacketQueue::default()
    }

    /// Packets stored as type-1 nodes plus packets attached directly to a session (type-2).
    pub fn total(&self) -> usize {
        self.nodes.len() + self.type2_count
    }

    pub fn has_room(&self, max: usize) -> bool {
        self.total() < max
    }

    /// Park a type-1 SYN. Caller must have already checked [`PacketQueue::has_room`].
    pub fn add(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Record that a session just gained a type-2 stored packet. Caller must have already
    /// checked [`PacketQueue::has_room`] before attaching the packet to the session.
    pub fn note_type2_added(&mut self) {
        self.type2_count += 1;
    }

    /// Record that a session's type-2 stored packet was consumed (sent as a probe, ICMP'd, or
    /// the session otherwise left the state that required it).
    pub fn note_type2_removed(&mut self) {
        self.type2_count = self.type2_count.saturating_sub(1);
    }

    /// Look for a type-1 node whose `dst6` matches `dst6` and whose `src4` a v6-side
    /// Simultaneous-Open attempt's mask set would also have produced, i.e. the v4-originated
    /// SYN reserved exactly the source address the v6 SYN is about to ask for (§4.C step 4).
    ///
    /// Removes and returns the node on a match.
    pub fn take_matching(&mut self, dst6: Transport6, masks: &dyn Mask) -> Option<Node> {
        let index = self
            .nodes
            .iter()
            .position(|node| node.dst6 == dst6 && masks.covers(node.src4))?;
        Some(self.nodes.swap_remove(index))
    }

    /// Detach every node older than `ttl` relative to `now`, for the expiry engine to
    /// ICMP-error after the lock is released (§4.D `prepare_clean`).
    pub fn drain_expired(&mut self, now: Instant, ttl: crate::time::Duration) -> Vec<Node> {
        let mut expired = Vec::new();
        let mut remaining = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            if now - node.arrival >= ttl {
                expired.push(node);
            } else {
                remaining.push(node);
            }
        }
        self.nodes = remaining;
        expired
    }

    /// Evict any type-1 node whose `src4` collides with a newly-added static BIB (§4.D `rm`).
    pub fn evict_colliding(&mut self, v4_taddr: Transport4) -> Vec<Node> {
        let mut evicted = Vec::new();
        let mut remaining = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            if node.src4 == v4_taddr {
                evicted.push(node);
            } else {
                remaining.push(node);
            }
        }
        self.nodes = remaining;
        evicted
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
