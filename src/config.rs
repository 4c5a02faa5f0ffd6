//! The configuration snapshot.
//!
//! Treated as an immutable value referenced (`Arc`) by every table call; updates replace the
//! whole snapshot rather than mutating fields in place, so a table operation never observes a
//! torn read of, say, one TTL updated and another not yet. Delivery of a new `Config` value
//! from an administrative tool (netlink, file, RPC) is out of scope for this crate; it only
//! consumes an already-parsed value, constructed by [`Config::from_millis`] or `Default`.

use serde::{Deserialize, Serialize};

use crate::time::Duration;

/// Per-protocol session idle timeouts, and the `Database`-wide knobs that govern filtering,
/// logging, and packet-queue sizing.
///
/// Durations on the wire (i.e. in [`WireConfig`]) are milliseconds; internally everything is
/// kept as a [`Duration`] tick count so the hot path never re-converts a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Established TCP session idle timeout. Default 2 hours (RFC 6146 §3.5.2).
    pub tcp_est_ttl: Duration,
    /// Transitory TCP session idle timeout. Default 4 minutes.
    pub tcp_trans_ttl: Duration,
    /// UDP session idle timeout. Default 5 minutes.
    pub udp_ttl: Duration,
    /// ICMP session idle timeout. Default 1 minute.
    pub icmp_ttl: Duration,
    /// How long a v4-originated SYN may wait in the packet queue for Simultaneous Open.
    /// Fixed at 6 seconds by the protocol; exposed here only so tests can shrink it.
    pub syn4_ttl: Duration,
    /// Reject v4-originated packets whose source does not match any session already seen from
    /// that BIB's destination (address-dependent filtering, RFC 6146 §3.6.1).
    pub drop_by_addr: bool,
    /// Reject externally-initiated TCP SYNs outright instead of attempting Simultaneous Open.
    pub drop_external_tcp: bool,
    /// Upper bound on the total number of packets held in the TCP table's packet queue, across
    /// both type-1 and type-2 stored packets.
    pub max_stored_pkts: usize,
    /// Log BIB creation/eviction at `debug` level.
    pub bib_logging: bool,
    /// Log session creation/state transitions at `debug`/`trace` level.
    pub session_logging: bool,
    /// Bitmask of RFC 6146 `F-ARGS` fields (source address/port, destination address/port)
    /// that participate in mask selection. Not interpreted by this crate — the mask iterator
    /// is the collaborator that honors it — but carried so `add6`/`add4` can tell the Issue
    /// #216 "still covered by the current mask set" re-check how many argument bits a mask
    /// candidate is expected to vary.
    pub f_args: u8,
    /// Candidate MTU values used by the translator when generating Packet-Too-Big ICMP
    /// messages (RFC 1191). Not consumed by the BIB/session core itself; carried on the
    /// snapshot because it is part of the same administrative record and translators read it
    /// off the same `Config` the core does.
    pub mtu_plateaus: Vec<u16>,
}

/// The wire representation of [`Config`]: millisecond durations, suitable for
/// `serde`-deserializing from an administrative tool's request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConfig {
    pub tcp_est_ttl_ms: u64,
    pub tcp_trans_ttl_ms: u64,
    pub udp_ttl_ms: u64,
    pub icmp_ttl_ms: u64,
    pub drop_by_addr: bool,
    pub drop_external_tcp: bool,
    pub max_stored_pkts: usize,
    pub bib_logging: bool,
    pub session_logging: bool,
    pub f_args: u8,
    pub mtu_plateaus: Vec<u16>,
}

/// Fixed by RFC 6146 §3.5.2 and not user-configurable, matching Jool's refusal to expose it
/// administratively.
const SYN4_TTL_MS: u64 = 6_000;

impl Config {
    /// Convert an administrative, millisecond-denominated record into the internal snapshot.
    pub fn from_wire(wire: &WireConfig) -> Self {
        Config {
            tcp_est_ttl: Duration::from_millis(wire.tcp_est_ttl_ms),
            tcp_trans_ttl: Duration::from_millis(wire.tcp_trans_ttl_ms),
            udp_ttl: Duration::from_millis(wire.udp_ttl_ms),
            icmp_ttl: Duration::from_millis(wire.icmp_ttl_ms),
            syn4_ttl: Duration::from_millis(SYN4_TTL_MS),
            drop_by_addr: wire.drop_by_addr,
            drop_external_tcp: wire.drop_external_tcp,
            max_stored_pkts: wire.max_stored_pkts,
            bib_logging: wire.bib_logging,
            session_logging: wire.session_logging,
            f_args: wire.f_args,
            mtu_plateaus: wire.mtu_plateaus.clone(),
        }
    }
}

impl Default for WireConfig {
    fn default() -> Self {
        WireConfig {
            tcp_est_ttl_ms: Duration::from_secs(2 * 60 * 60).as_millis(),
            tcp_trans_ttl_ms: Duration::from_secs(4 * 60).as_millis(),
            udp_ttl_ms: Duration::from_secs(5 * 60).as_millis(),
            icmp_ttl_ms: Duration::from_secs(60).as_millis(),
            drop_by_addr: false,
            drop_external_tcp: false,
            max_stored_pkts: 50,
            bib_logging: false,
            session_logging: false,
            f_args: 0b1111,
            mtu_plateaus: vec![
                65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296, 68,
            ],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_wire(&WireConfig::default())
    }
}
