//! A tabled session record (§3, §4.C).
//!
//! Grounded on `struct tabled_session` in `mod/nat64/bib/db.c`: the four transport addresses
//! that make up a session's two tuples are split across this record and its owning
//! [`crate::bib::Bib`] (the BIB already carries the v6/v4 source halves, so only the
//! destination halves are repeated here), plus the bookkeeping the expiry engine and TCP state
//! machine need.

use crate::arena::Key;
use crate::proto::{Protocol, Transport4, Transport6};
use crate::queue::RawPacket;
use crate::tcp_sm::{ExpirerClass, TcpState};
use crate::time::Instant;

/// Tag type for [`Key`]s into a session [`crate::arena::Arena`].
pub struct SessionTag;

/// Tag type for [`Key`]s into a BIB [`crate::arena::Arena`], re-exported here since a session's
/// back-reference is the most common place this tag is named outside of `bib.rs` itself.
pub use crate::bib::BibTag;

/// One tabled session: a single (source, destination) pair hanging off a BIB entry.
#[derive(Debug, Clone)]
pub struct Session {
    /// The remote IPv6 endpoint, as seen from the translator's v6 side.
    pub dst6: Transport6,
    /// The remote IPv4 endpoint. For ICMP, `port` is aliased to the owning BIB's `src4.port`
    /// (§3) rather than carrying independent information.
    pub dst4: Transport4,
    /// Only meaningful for TCP; UDP and ICMP sessions are always logically `Established` and
    /// never consult the state machine.
    pub state: TcpState,
    /// Last time this session observed traffic or a state transition; the key under which it is
    /// linked into its [`ExpirerClass`] list.
    pub update_time: Instant,
    pub expirer: ExpirerClass,
    /// A SYN held pending Simultaneous Open or an address-dependent-filtering hole punch
    /// (§4.D "type 2"). `None` for every session outside of `V4Init`/`V6Init`.
    pub stored: Option<RawPacket>,
    /// The BIB this session belongs to. A plain arena index rather than a reference: sessions
    /// never outlive their BIB's sub-tree entry, and indices sidestep the lifetime bookkeeping
    /// a back-reference would otherwise force onto every table method (§9).
    pub bib: Key<BibTag>,
}

impl Session {
    pub fn new(
        dst6: Transport6,
        dst4: Transport4,
        state: TcpState,
        expirer: ExpirerClass,
        update_time: Instant,
        bib: Key<BibTag>,
    ) -> Self {
        Session {
            dst6,
            dst4,
            state,
            update_time,
            expirer,
            stored: None,
            bib,
        }
    }

    /// Attach an empty type-2 (ADF hole-punch) or Simultaneous-Open stored packet slot.
    ///
    /// Only a TCP session ever parks a stored packet (§4.D); UDP/ICMP sessions are always
    /// logically `Established` and have no SO/ADF hold to resolve, so attaching one there would
    /// be a dangling packet nothing ever releases.
    pub fn attach_stored(&mut self, proto: Protocol) {
        debug_assert_eq!(proto, Protocol::Tcp, "only TCP sessions hold a stored packet");
        self.stored = Some(Vec::new());
    }
}
