//! The statistics sink collaborator.
//!
//! The core never keeps counters itself; it reports events to a caller-supplied [`StatsSink`]
//! so that the translator can aggregate them however it likes (atomics, per-CPU counters,
//! `prometheus` gauges, ...). This keeps the hot path free of an opinion about how stats are
//! stored.

/// One event class the session database can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    /// The IPv4 pool had no transport address left for a mark.
    Pool4Exhausted,
    /// A type-1 (v4-originated) SYN was parked in the packet queue.
    So1StoredPkt,
    /// A v6-originated SYN found a matching parked type-1 SYN (Simultaneous Open succeeded).
    So1Exists,
    /// The packet queue rejected a type-1 SYN because it is at capacity.
    So1Full,
    /// A type-2 (ADF hole-punch) packet was parked in the packet queue.
    So2StoredPkt,
    /// The packet queue rejected a type-2 packet because it is at capacity.
    So2Full,
    /// Address-dependent filtering rejected a v4-originated packet.
    Adf,
    /// A v4-originated packet had no matching BIB entry.
    NoBib,
    /// `drop_external_tcp` rejected an externally-initiated SYN.
    ExternalSynProhibited,
    /// The TCP state machine rejected a transition.
    TcpSm,
    /// A packet arrived for an unsupported IPv6 encapsulation.
    Unknown6,
    /// A packet arrived for an unsupported IPv4 encapsulation.
    Unknown4,
    /// An invariant violation was detected and the packet was dropped defensively.
    Unknown,
}

/// Receives per-event counter increments.
///
/// Implementations are expected to be cheap and non-blocking: this is called from inside (or
/// immediately after releasing) a table's spinlock.
pub trait StatsSink {
    fn incr(&self, stat: Stat);
}

/// A sink that discards every event; useful in tests or when statistics are not wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn incr(&self, _stat: Stat) {}
}

impl<S: StatsSink + ?Sized> StatsSink for &'_ S {
    fn incr(&self, stat: Stat) {
        (**self).incr(stat)
    }
}
