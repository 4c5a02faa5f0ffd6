//! Error kinds propagated to the translator, and the stats counters they drive.
//!
//! Mirrors `ethox::layer::Error`'s shape (a flat enum covering adverse conditions local to the
//! layer, with `From` conversions bridging lower-level failures upward) but carries messages,
//! since this crate targets `std` and a dataplane operator debugging a drop cares about *why*.

use crate::stats::Stat;

/// A shortened result type for session database operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Everything that can keep `add6`/`add4`/`add_tcp6`/`add_tcp4`/administrative calls from
/// completing normally.
///
/// `Stolen` is deliberately not a variant here: taking ownership of a packet into the queue is
/// a success, not a failure, and threading it through `?` would read backwards at every call
/// site. See [`Outcome`] for how it is represented instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The entry arena has no free slot for a new BIB or session record.
    #[error("no memory available to allocate a new tabled entry")]
    NoMemory,
    /// A lookup by (v6, v4, protocol) or similar key found nothing.
    #[error("no such entry")]
    NoSuchEntry,
    /// `add_static` collided with an existing entry under a different v4 address.
    #[error("an entry with a conflicting key already exists")]
    AlreadyExists,
    /// The configured IPv4 pool has no transport address left for this mask.
    #[error("pool4 is exhausted for the requested mark")]
    PoolExhausted,
    /// `drop_by_addr` rejected a v4-originated packet from an unexpected remote address.
    #[error("rejected by address-dependent filtering")]
    AddressFilterRejected,
    /// `drop_external_tcp` rejected an externally-initiated SYN.
    #[error("externally-initiated TCP SYN prohibited by configuration")]
    ExternalSynProhibited,
    /// The packet queue is at `max_stored_pkts` capacity.
    #[error("no space left in the packet queue")]
    NoSpace,
    /// A caller-supplied tuple or range was structurally invalid.
    #[error("invalid input")]
    InvalidInput,
    /// The protocol field did not match UDP, TCP, or ICMP.
    #[error("unknown protocol")]
    UnknownProtocol,
    /// The TCP state machine refused the transition implied by the incoming segment.
    #[error("TCP state machine violation")]
    TcpStateViolation,
}

impl Error {
    /// The stats counter this error increments (§6/§7).
    pub fn as_stat(self) -> Stat {
        match self {
            Error::NoMemory => Stat::Unknown,
            Error::NoSuchEntry => Stat::NoBib,
            Error::AlreadyExists => Stat::Unknown,
            Error::PoolExhausted => Stat::Pool4Exhausted,
            Error::AddressFilterRejected => Stat::Adf,
            Error::ExternalSynProhibited => Stat::ExternalSynProhibited,
            Error::NoSpace => Stat::So1Full,
            Error::InvalidInput => Stat::Unknown,
            Error::UnknownProtocol => Stat::Unknown,
            Error::TcpStateViolation => Stat::TcpSm,
        }
    }
}

/// The non-error result of an ingress call: either a live (BIB, session) pair was produced, or
/// the packet was stolen into the packet queue and must not be freed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// A session now exists (or already existed); here is a snapshot of it.
    Found(T),
    /// The packet was copied into the packet queue pending Simultaneous Open; the caller must
    /// not treat this as a drop.
    Stolen,
}

impl<T> Outcome<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Outcome::Found(t) => Some(t),
            Outcome::Stolen => None,
        }
    }

    pub fn is_stolen(&self) -> bool {
        matches!(self, Outcome::Stolen)
    }
}
