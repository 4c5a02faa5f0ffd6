//! The database façade (§4.G): the crate's only public entry point for most callers. Owns the
//! three per-protocol [`SessionTable`]s plus the live [`Config`] snapshot, and dispatches by
//! [`Protocol`] so a translator never has to know which table a packet belongs to.

use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::error::{Error, Outcome, Result};
use crate::mask::Mask;
use crate::proto::{Protocol, Transport4, Transport6, Tuple4, Tuple6};
use crate::stats::{Stat, StatsSink};
use crate::table::{BibSnapshot, Deferred, Found, SessionTable};
use crate::tcp_sm::{CollisionCb, TcpEvent};
use crate::time::Instant;

/// Default BIB/session capacities; a deployment with a larger pool4 should size these up
/// accordingly.
const DEFAULT_BIB_CAPACITY: usize = 65536;
const DEFAULT_SESSION_CAPACITY: usize = 262144;

/// The top-level handle a translator holds for the lifetime of the process.
///
/// `Config` is held behind an `RwLock<Arc<Config>>` rather than inside each table: an
/// administrative update swaps the whole snapshot in one place, and in-flight calls that already
/// cloned the `Arc` finish against the config they started with rather than observing a torn
/// update (mirrors `Config`'s own module doc on "updates replace the whole snapshot").
pub struct Database {
    udp: SessionTable,
    tcp: SessionTable,
    icmp: SessionTable,
    config: RwLock<Arc<Config>>,
}

impl Database {
    pub fn new(config: Config) -> Self {
        Database::with_capacity(config, DEFAULT_BIB_CAPACITY, DEFAULT_SESSION_CAPACITY)
    }

    pub fn with_capacity(config: Config, bib_capacity: usize, session_capacity: usize) -> Self {
        Database {
            udp: SessionTable::new(Protocol::Udp, bib_capacity, session_capacity),
            tcp: SessionTable::new(Protocol::Tcp, bib_capacity, session_capacity),
            icmp: SessionTable::new(Protocol::Icmp, bib_capacity, session_capacity),
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Install a new configuration snapshot, effective for every call made from this point on.
    pub fn set_config(&self, config: Config) {
        *self.config.write().expect("config lock poisoned") = Arc::new(config);
    }

    fn table(&self, proto: Protocol) -> &SessionTable {
        match proto {
            Protocol::Udp => &self.udp,
            Protocol::Tcp => &self.tcp,
            Protocol::Icmp => &self.icmp,
        }
    }

    /// Handle an IPv6-originated UDP or ICMP packet. The returned [`Deferred`] list holds
    /// probes/ICMP errors staged mid-call (e.g. by an Issue #216 stale-BIB eviction that frees a
    /// session with a stored packet); the caller must act on it after this call returns, exactly
    /// as it does with [`Database::clean`]'s return value.
    pub fn add6(
        &self,
        proto: Protocol,
        tuple: Tuple6,
        dst4: Transport4,
        masks: &mut dyn Mask,
        now: Instant,
        stats: &dyn StatsSink,
    ) -> Result<(Outcome<Found>, Vec<Deferred>)> {
        if proto == Protocol::Tcp {
            stats.incr(Stat::Unknown6);
            return Err(Error::UnknownProtocol);
        }
        let config = self.config();
        self.table(proto).add6(tuple, dst4, masks, now, &config, stats)
    }

    /// Handle an IPv6-originated TCP segment. See [`Database::add6`] for the returned
    /// [`Deferred`] list.
    #[allow(clippy::too_many_arguments)]
    pub fn add_tcp6(
        &self,
        tuple: Tuple6,
        dst4: Transport4,
        masks: &mut dyn Mask,
        event: TcpEvent,
        now: Instant,
        stats: &dyn StatsSink,
        collide: &mut dyn CollisionCb,
    ) -> Result<(Outcome<Found>, Vec<Deferred>)> {
        let config = self.config();
        self.tcp
            .add_tcp6(tuple, dst4, masks, event, now, &config, stats, collide)
    }

    /// Handle an IPv4-originated UDP or ICMP packet. See [`Database::add6`] for the returned
    /// [`Deferred`] list.
    pub fn add4(
        &self,
        proto: Protocol,
        tuple: Tuple4,
        dst6: Transport6,
        now: Instant,
        stats: &dyn StatsSink,
    ) -> Result<(Found, Vec<Deferred>)> {
        if proto == Protocol::Tcp {
            stats.incr(Stat::Unknown4);
            return Err(Error::UnknownProtocol);
        }
        let config = self.config();
        self.table(proto).add4(tuple, dst6, now, &config, stats)
    }

    /// Handle an IPv4-originated TCP segment. See [`Database::add6`] for the returned
    /// [`Deferred`] list.
    pub fn add_tcp4(
        &self,
        tuple: Tuple4,
        dst6: Transport6,
        event: TcpEvent,
        now: Instant,
        stats: &dyn StatsSink,
        collide: &mut dyn CollisionCb,
    ) -> Result<(Outcome<Found>, Vec<Deferred>)> {
        let config = self.config();
        self.tcp.add_tcp4(tuple, dst6, event, now, &config, stats, collide)
    }

    pub fn find6(&self, proto: Protocol, src6: Transport6, dst4: Transport4) -> Option<Found> {
        self.table(proto).find6(src6, dst4)
    }

    pub fn find4(&self, proto: Protocol, dst4: Transport4, src4: Transport4) -> Option<Found> {
        self.table(proto).find4(dst4, src4)
    }

    pub fn add_static(&self, proto: Protocol, src6: Transport6, src4: Transport4) -> Result<()> {
        self.table(proto).add_static(src6, src4)
    }

    pub fn remove(&self, proto: Protocol, src6: Transport6) -> Result<()> {
        self.table(proto).remove(src6)
    }

    pub fn remove_range(&self, proto: Protocol, start: Transport4, end: Transport4) -> usize {
        self.table(proto).remove_range(start, end)
    }

    pub fn flush(&self, proto: Protocol) {
        self.table(proto).flush()
    }

    pub fn flush_all(&self) {
        self.udp.flush();
        self.tcp.flush();
        self.icmp.flush();
    }

    pub fn foreach(
        &self,
        proto: Protocol,
        offset: Option<(Transport6, bool)>,
        cb: impl FnMut(BibSnapshot) -> bool,
    ) {
        self.table(proto).foreach(offset, cb)
    }

    pub fn foreach_session(
        &self,
        proto: Protocol,
        src6: Transport6,
        offset: Option<(Transport4, bool)>,
        cb: impl FnMut(crate::table::SessionSnapshot) -> bool,
    ) {
        self.table(proto).foreach_session(src6, offset, cb)
    }

    /// Sweep every table's expired entries; a translator typically calls this from a periodic
    /// timer tick (§4.E), no more often than the configured TTLs warrant.
    pub fn clean(&self, now: Instant, stats: &dyn StatsSink, tcp_collide: &mut dyn CollisionCb) -> Vec<Deferred> {
        let config = self.config();
        let mut deferred = self.udp.clean(now, &config, stats, &mut NoOpCollision);
        deferred.extend(self.icmp.clean(now, &config, stats, &mut NoOpCollision));
        deferred.extend(self.tcp.clean(now, &config, stats, tcp_collide));
        deferred
    }
}

/// UDP and ICMP tables never run the state machine; this stands in for the `&mut dyn
/// CollisionCb` parameter `clean` needs structurally but those tables never call.
struct NoOpCollision;
impl CollisionCb for NoOpCollision {
    fn collide(
        &mut self,
        state: crate::tcp_sm::TcpState,
        _event: TcpEvent,
    ) -> (crate::tcp_sm::TcpState, crate::tcp_sm::Fate) {
        (state, crate::tcp_sm::Fate::Rm)
    }
}
