//! Transport addresses, protocols, and the tuple types used to identify flows.
//!
//! Analogous to `ethox::layer::tcp::endpoint::FourTuple`: a small, `Copy`, totally-ordered
//! identifier type that doubles as a tree key. Here it is split into a v6 and a v4 half since
//! a BIB entry is keyed by one of each simultaneously (§3, §4.C).

use std::net::{Ipv4Addr, Ipv6Addr};

/// The upper-layer protocol a flow belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// An IPv6 transport address: address plus port (or, for ICMP, query identifier).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Transport6 {
    pub addr: Ipv6Addr,
    pub port: u16,
}

impl Transport6 {
    pub const fn new(addr: Ipv6Addr, port: u16) -> Self {
        Transport6 { addr, port }
    }
}

/// An IPv4 transport address: address plus port (or ICMP query identifier).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Transport4 {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Transport4 {
    pub const fn new(addr: Ipv4Addr, port: u16) -> Self {
        Transport4 { addr, port }
    }
}

/// The 5-tuple identifying one direction of a flow arriving from the IPv6 side: source and
/// destination transport addresses plus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple6 {
    pub src: Transport6,
    pub dst: Transport6,
    pub proto: Protocol,
}

/// The 5-tuple identifying one direction of a flow arriving from the IPv4 side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple4 {
    pub src: Transport4,
    pub dst: Transport4,
    pub proto: Protocol,
}

/// The key a BIB entry is indexed by in the v6-keyed tree: (ipv6_taddr, protocol) is unique
/// within a table, but we store the full transport address as the ordering key since the
/// table itself is already split one-per-protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bib6Key(pub Transport6);

/// The key a BIB entry is indexed by in the v4-keyed tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bib4Key(pub Transport4);

/// The key a session is indexed by within its owning BIB's session sub-tree.
///
/// Keyed by `dst4` only (§3, §9 "Single session tree per BIB"): for TCP/UDP, `dst4` is `dst6`
/// minus the pool6 prefix, so the v4 and v6 views agree; for ICMP, `dst4.port` is aliased to
/// the BIB's `src4.port`, which is constant across all of one BIB's sessions, so ordering by
/// `dst4.addr` first still yields a unique key per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey(pub Transport4);
