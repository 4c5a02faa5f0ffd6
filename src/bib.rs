//! A tabled BIB (Binding Information Base) record (§3, §4.A).
//!
//! Grounded on `struct tabled_bib` in `mod/nat64/bib/db.c`: a BIB pairs one IPv6 transport
//! address with one IPv4 transport address for a protocol, and owns the ordered sub-tree of
//! sessions reachable through it, keyed the way `Endpoint::ports`/`Endpoint::states` splits
//! identity from per-connection state in `ethox::layer::tcp::endpoint`.

use crate::arena::Key;
use crate::index::Index;
use crate::proto::{SessionKey, Transport4, Transport6};

/// Tag type for [`Key`]s into a BIB [`crate::arena::Arena`].
pub struct BibTag;

/// One tabled BIB entry.
#[derive(Debug, Clone)]
pub struct Bib {
    pub src6: Transport6,
    pub src4: Transport4,
    /// Created through `add_static` rather than ordinary traffic; never evicted by the Issue
    /// #216 "address no longer covered by the mask" re-check, and never removed merely because
    /// its session sub-tree became empty (§4.C, §8 invariant 5).
    pub is_static: bool,
    /// This BIB's sessions, ordered by [`SessionKey`] so the table can resume a range scan from
    /// wherever a previous lookup left off.
    pub sessions: Index<SessionKey, Key<crate::session::SessionTag>>,
}

impl Bib {
    pub fn new(src6: Transport6, src4: Transport4, is_static: bool) -> Self {
        Bib {
            src6,
            src4,
            is_static,
            sessions: Index::new(),
        }
    }
}
