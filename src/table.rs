//! The per-protocol session table (§4.C, §5): the crate's centerpiece.
//!
//! Each table owns two BIB indices (keyed by the v6 and v4 transport address respectively) into
//! a shared [`Arena`], a session arena, three [`ExpirerList`]s, and — for TCP only — a
//! [`PacketQueue`]. All of it sits behind one [`spinning_top::Spinlock`] (§5, grounded on
//! `netoneko-akuma`'s use of the same crate for short, non-suspending critical sections): every
//! public method here does its tree walking, state-machine dispatch, and list bookkeeping while
//! holding the lock, then returns with it released, handing back only plain data (never a
//! reference into the table) plus a list of deferred side effects (probes, ICMP errors) for the
//! caller to act on outside the lock, per §5 "No suspension points while locked".

use spinning_top::Spinlock;

use crate::arena::{Arena, Key};
use crate::bib::{Bib, BibTag};
use crate::config::Config;
use crate::error::{Error, Outcome, Result};
use crate::index::{Index, Slot};
use crate::mask::Mask;
use crate::proto::{Bib4Key, Bib6Key, Protocol, SessionKey, Transport4, Transport6, Tuple4, Tuple6};
use crate::queue::{Node as QueueNode, PacketQueue, RawPacket};
use crate::session::{Session, SessionTag};
use crate::stats::{Stat, StatsSink};
use crate::tcp_sm::{CollisionCb, ExpirerClass, Fate, TcpEvent, TcpState};
use crate::time::Instant;
use log::{debug, trace};

/// A side effect the table could not perform itself without holding the lock across a
/// potentially slow operation (sending a packet).
#[derive(Debug, Clone)]
pub enum Deferred {
    /// Send an empty TCP ACK to `dst6`'s session peer, to provoke a response before giving up
    /// on an idle connection (§4.C `Fate::Probe`).
    Probe { dst6: Transport6, dst4: Transport4 },
    /// A stored packet aged out, or its session was removed before Simultaneous Open resolved
    /// it; the translator should turn this into an ICMP "port unreachable" toward its original
    /// sender.
    IcmpUnreachable { packet: RawPacket },
}

/// A read-only snapshot of a BIB entry, copied out so callers never hold a reference into the
/// table past the call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BibSnapshot {
    pub src6: Transport6,
    pub src4: Transport4,
    pub is_static: bool,
}

/// A read-only snapshot of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub dst6: Transport6,
    pub dst4: Transport4,
    pub state: TcpState,
    pub update_time: Instant,
}

/// The result of a successful `add*`/`find*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    pub bib: BibSnapshot,
    pub session: SessionSnapshot,
}

struct Inner {
    bibs: Arena<Bib, BibTag>,
    sessions: Arena<Session, SessionTag>,
    tree6: Index<Bib6Key, Key<BibTag>>,
    tree4: Index<Bib4Key, Key<BibTag>>,
    established: ExpirerListOf,
    transitory: ExpirerListOf,
    syn4: ExpirerListOf,
    queue: PacketQueue,
}

type ExpirerListOf = crate::expiry::ExpirerList<SessionTag>;

/// A session table for one protocol (§4.C).
pub struct SessionTable {
    proto: Protocol,
    bib_capacity: usize,
    session_capacity: usize,
    inner: Spinlock<Inner>,
}

fn expirer_for_state(proto: Protocol, state: TcpState) -> ExpirerClass {
    if proto != Protocol::Tcp {
        return ExpirerClass::Established;
    }
    match state {
        TcpState::Established => ExpirerClass::Established,
        TcpState::V6Init | TcpState::V4Init => ExpirerClass::Syn4,
        _ => ExpirerClass::Transitory,
    }
}

impl Inner {
    fn list_mut(&mut self, class: ExpirerClass) -> &mut ExpirerListOf {
        match class {
            ExpirerClass::Established => &mut self.established,
            ExpirerClass::Transitory => &mut self.transitory,
            ExpirerClass::Syn4 => &mut self.syn4,
        }
    }

    fn snapshot(&self, session_key: Key<SessionTag>) -> Option<Found> {
        let session = self.sessions.get(session_key)?;
        let bib = self.bibs.get(session.bib)?;
        Some(Found {
            bib: BibSnapshot {
                src6: bib.src6,
                src4: bib.src4,
                is_static: bib.is_static,
            },
            session: SessionSnapshot {
                dst6: session.dst6,
                dst4: session.dst4,
                state: session.state,
                update_time: session.update_time,
            },
        })
    }

    /// Re-arm `session_key`'s timer, moving it between expirer lists if `new_class` differs
    /// from its current one.
    fn rearm(&mut self, session_key: Key<SessionTag>, now: Instant, new_class: ExpirerClass) {
        let Some(session) = self.sessions.get_mut(session_key) else {
            return;
        };
        let old_time = session.update_time;
        let old_class = session.expirer;
        session.update_time = now;
        session.expirer = new_class;

        if old_class == new_class {
            self.list_mut(old_class).relink(old_time, now, session_key);
        } else {
            self.list_mut(old_class).remove(old_time, session_key);
            self.list_mut(new_class).insert(now, session_key);
        }
    }

    /// Detach and free a session, and its BIB too if this was the BIB's last session and the
    /// BIB is not static (§4.C, §8 invariant 5).
    fn remove_session(&mut self, session_key: Key<SessionTag>, deferred: &mut Vec<Deferred>) {
        let Some(session) = self.sessions.remove(session_key) else {
            return;
        };
        self.list_mut(session.expirer)
            .remove(session.update_time, session_key);
        if let Some(packet) = session.stored {
            self.queue.note_type2_removed();
            deferred.push(Deferred::IcmpUnreachable { packet });
        }

        if let Some(bib) = self.bibs.get_mut(session.bib) {
            bib.sessions.erase(&SessionKey(session.dst4));
            if bib.sessions.is_empty() && !bib.is_static {
                if let Some(removed) = self.bibs.remove(session.bib) {
                    self.tree6.erase(&Bib6Key(removed.src6));
                    self.tree4.erase(&Bib4Key(removed.src4));
                }
            }
        }
    }

    /// Apply a state machine decision: update state, then act on the fate.
    fn apply_fate(
        &mut self,
        session_key: Key<SessionTag>,
        new_state: TcpState,
        fate: Fate,
        now: Instant,
        deferred: &mut Vec<Deferred>,
    ) {
        if let Some(session) = self.sessions.get_mut(session_key) {
            session.state = new_state;
        }
        match fate {
            Fate::TimerEst => self.rearm(session_key, now, ExpirerClass::Established),
            Fate::TimerTrans => self.rearm(session_key, now, ExpirerClass::Transitory),
            Fate::TimerSlow(class) => self.rearm(session_key, now, class),
            Fate::Probe => {
                let stored = self
                    .sessions
                    .get_mut(session_key)
                    .and_then(|s| s.stored.take());
                if let Some(packet) = stored {
                    self.queue.note_type2_removed();
                    deferred.push(Deferred::IcmpUnreachable { packet });
                } else if let Some(session) = self.sessions.get(session_key) {
                    deferred.push(Deferred::Probe {
                        dst6: session.dst6,
                        dst4: session.dst4,
                    });
                }
                self.rearm(session_key, now, ExpirerClass::Transitory);
            }
            Fate::Rm => self.remove_session(session_key, deferred),
            Fate::Preserve | Fate::Drop => {}
        }
    }
}

impl SessionTable {
    pub fn new(proto: Protocol, bib_capacity: usize, session_capacity: usize) -> Self {
        SessionTable {
            proto,
            bib_capacity,
            session_capacity,
            inner: Spinlock::new(Inner {
                bibs: Arena::with_capacity(bib_capacity),
                sessions: Arena::with_capacity(session_capacity),
                tree6: Index::new(),
                tree4: Index::new(),
                established: ExpirerListOf::new(),
                transitory: ExpirerListOf::new(),
                syn4: ExpirerListOf::new(),
                queue: PacketQueue::new(),
            }),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.proto
    }

    pub fn bib_capacity(&self) -> usize {
        self.bib_capacity
    }

    pub fn session_capacity(&self) -> usize {
        self.session_capacity
    }

    pub fn bib_count(&self) -> usize {
        self.inner.lock().bibs.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Re-check, under the lock, whether an existing BIB's v4 address is still covered by the
    /// current mask set (Issue #216, §4.C step 3). If not, detach it (and every session hanging
    /// off it) so the caller's lookup falls through to fresh allocation.
    fn evict_if_stale(
        inner: &mut Inner,
        bib_key: Key<BibTag>,
        masks: &dyn Mask,
        config: &Config,
        deferred: &mut Vec<Deferred>,
    ) -> bool {
        let Some(bib) = inner.bibs.get(bib_key) else {
            return true;
        };
        if bib.is_static || masks.covers(bib.src4) {
            return false;
        }
        if config.bib_logging {
            debug!("evicting stale bib src6={:?} src4={:?}: no longer covered by pool4", bib.src6, bib.src4);
        }
        let session_keys: Vec<Key<SessionTag>> = bib.sessions.values().copied().collect();
        for key in session_keys {
            inner.remove_session(key, deferred);
        }
        if let Some(bib) = inner.bibs.get(bib_key) {
            if bib.sessions.is_empty() {
                if let Some(removed) = inner.bibs.remove(bib_key) {
                    inner.tree6.erase(&Bib6Key(removed.src6));
                    inner.tree4.erase(&Bib4Key(removed.src4));
                }
            }
        }
        true
    }

    fn session_state_for_new(&self, event: Option<TcpEvent>) -> TcpState {
        if self.proto != Protocol::Tcp {
            return TcpState::Established;
        }
        match event {
            Some(TcpEvent::V6Syn) => TcpState::V6Init,
            Some(TcpEvent::V4Syn) => TcpState::V4Init,
            _ => TcpState::Established,
        }
    }

    fn allocate_v4(masks: &mut dyn Mask) -> Result<Transport4> {
        masks.next().ok_or(Error::PoolExhausted)
    }

    /// Create-or-find the session for an IPv6-originated packet (§4.C steps 1-6). `event` is
    /// `None` for non-TCP calls (the state machine never runs) and `Some` for `add_tcp6`.
    #[allow(clippy::too_many_arguments)]
    fn add6_inner(
        &self,
        tuple: Tuple6,
        dst4: Transport4,
        masks: &mut dyn Mask,
        event: Option<TcpEvent>,
        now: Instant,
        config: &Config,
        stats: &dyn StatsSink,
        mut collide: Option<&mut dyn CollisionCb>,
    ) -> Result<(Outcome<Found>, Vec<Deferred>)> {
        let mut deferred = Vec::new();
        let bib6_key = Bib6Key(tuple.src);

        let mut inner = self.inner.lock();

        if let Some(bib_key) = inner.tree6.find(&bib6_key).copied() {
            Self::evict_if_stale(&mut inner, bib_key, &*masks, config, &mut deferred);
        }

        let result = match inner.tree6.find_slot(bib6_key) {
            Slot::Occupied(slot) => {
                let bib_key = *slot.get();
                drop(slot);
                self.handle_existing_bib6(
                    &mut inner, bib_key, tuple, dst4, event, now, config, &mut collide,
                    &mut deferred,
                )?
            }
            Slot::Vacant(_) => {
                if self.proto == Protocol::Tcp {
                    if let Some(found) = self.try_simultaneous_open(
                        &mut inner, tuple, dst4, &*masks, now, config, stats,
                    )? {
                        found
                    } else {
                        self.create_bib_and_session6(
                            &mut inner, tuple, dst4, masks, event, now, config,
                        )?
                    }
                } else {
                    self.create_bib_and_session6(&mut inner, tuple, dst4, masks, event, now, config)?
                }
            }
        };

        drop(inner);
        Ok((result, deferred))
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_existing_bib6(
        &self,
        inner: &mut Inner,
        bib_key: Key<BibTag>,
        tuple: Tuple6,
        dst4: Transport4,
        event: Option<TcpEvent>,
        now: Instant,
        config: &Config,
        collide: &mut Option<&mut dyn CollisionCb>,
        deferred: &mut Vec<Deferred>,
    ) -> Result<Outcome<Found>> {
        let session_dst4 = if self.proto == Protocol::Icmp {
            let bib_port = inner.bibs.get(bib_key).map(|b| b.src4.port).unwrap_or(0);
            Transport4::new(dst4.addr, bib_port)
        } else {
            dst4
        };
        let session_key = SessionKey(session_dst4);

        let existing = inner
            .bibs
            .get(bib_key)
            .and_then(|bib| bib.sessions.find(&session_key))
            .copied();

        let session_arena_key = match existing {
            Some(key) => {
                if let (Some(cb), Some(ev)) = (collide.as_deref_mut(), event) {
                    let state = inner.sessions.get(key).map(|s| s.state);
                    if let Some(state) = state {
                        let (new_state, fate) = cb.collide(state, ev);
                        if config.session_logging {
                            trace!("session dst6={:?} dst4={:?} {:?} + {:?} -> {:?}", tuple.dst, session_dst4, state, ev, new_state);
                        }
                        inner.apply_fate(key, new_state, fate, now, deferred);
                    }
                } else {
                    inner.rearm(key, now, ExpirerClass::Established);
                }
                key
            }
            None => {
                let state = self.session_state_for_new(event);
                let class = expirer_for_state(self.proto, state);
                let session = Session::new(tuple.dst, session_dst4, state, class, now, bib_key);
                let key = inner.sessions.try_insert(session)?;
                inner.list_mut(class).insert(now, key);
                if let Some(bib) = inner.bibs.get_mut(bib_key) {
                    bib.sessions
                        .find_slot(session_key)
                        .vacant()
                        .map(|slot| slot.commit(key));
                }
                if config.session_logging {
                    debug!("new {:?} session dst6={:?} dst4={:?} state={:?}", self.proto, tuple.dst, session_dst4, state);
                }
                key
            }
        };

        Ok(match inner.snapshot(session_arena_key) {
            Some(found) => Outcome::Found(found),
            None => Outcome::Stolen,
        })
    }

    fn try_simultaneous_open(
        &self,
        inner: &mut Inner,
        tuple: Tuple6,
        dst4: Transport4,
        masks: &dyn Mask,
        now: Instant,
        config: &Config,
        stats: &dyn StatsSink,
    ) -> Result<Option<Outcome<Found>>> {
        let Some(node) = inner.queue.take_matching(tuple.dst, masks) else {
            return Ok(None);
        };
        stats.incr(Stat::So1Exists);

        let bib = Bib::new(tuple.src, node.dst4, false);
        let bib_key = inner.bibs.try_insert(bib)?;
        inner.tree6.find_slot(Bib6Key(tuple.src)).vacant().map(|s| s.commit(bib_key));
        inner.tree4.find_slot(Bib4Key(node.dst4)).vacant().map(|s| s.commit(bib_key));
        if config.bib_logging {
            debug!("simultaneous open resolved bib src6={:?} src4={:?}", tuple.src, node.dst4);
        }

        let session = Session::new(
            tuple.dst,
            dst4,
            TcpState::V4Init,
            ExpirerClass::Syn4,
            now,
            bib_key,
        );
        let session_key = inner.sessions.try_insert(session)?;
        inner.syn4.insert(now, session_key);
        if let Some(bib) = inner.bibs.get_mut(bib_key) {
            bib.sessions
                .find_slot(SessionKey(dst4))
                .vacant()
                .map(|slot| slot.commit(session_key));
        }
        if config.session_logging {
            debug!("new {:?} session dst6={:?} dst4={:?} state=V4Init (simultaneous open)", self.proto, tuple.dst, dst4);
        }

        let _ = node.packet;
        Ok(inner.snapshot(session_key).map(Outcome::Found))
    }

    fn create_bib_and_session6(
        &self,
        inner: &mut Inner,
        tuple: Tuple6,
        dst4: Transport4,
        masks: &mut dyn Mask,
        event: Option<TcpEvent>,
        now: Instant,
        config: &Config,
    ) -> Result<Outcome<Found>> {
        let src4 = Self::allocate_v4(masks)?;
        let bib = Bib::new(tuple.src, src4, false);
        let bib_key = inner.bibs.try_insert(bib)?;
        inner.tree6.find_slot(Bib6Key(tuple.src)).vacant().map(|s| s.commit(bib_key));
        inner.tree4.find_slot(Bib4Key(src4)).vacant().map(|s| s.commit(bib_key));
        if config.bib_logging {
            debug!("new {:?} bib src6={:?} src4={:?}", self.proto, tuple.src, src4);
        }

        let state = self.session_state_for_new(event);
        let class = expirer_for_state(self.proto, state);
        let session_dst4 = if self.proto == Protocol::Icmp {
            Transport4::new(dst4.addr, src4.port)
        } else {
            dst4
        };
        let session = Session::new(tuple.dst, session_dst4, state, class, now, bib_key);
        let session_key = inner.sessions.try_insert(session)?;
        inner.list_mut(class).insert(now, session_key);
        if let Some(bib) = inner.bibs.get_mut(bib_key) {
            bib.sessions
                .find_slot(SessionKey(session_dst4))
                .vacant()
                .map(|slot| slot.commit(session_key));
        }
        if config.session_logging {
            debug!("new {:?} session dst6={:?} dst4={:?} state={:?}", self.proto, tuple.dst, session_dst4, state);
        }

        Ok(found_or_warn(&inner, session_key))
    }

    /// UDP/ICMP entry point for an IPv6-originated packet. The returned [`Deferred`] list (§4.E,
    /// §5) holds probes/ICMP errors staged mid-call (e.g. by an Issue #216 stale-BIB eviction
    /// that frees a session with a stored packet); the caller must act on it after this call
    /// returns, exactly as it does with [`SessionTable::clean`]'s return value.
    pub fn add6(
        &self,
        tuple: Tuple6,
        dst4: Transport4,
        masks: &mut dyn Mask,
        now: Instant,
        config: &Config,
        stats: &dyn StatsSink,
    ) -> Result<(Outcome<Found>, Vec<Deferred>)> {
        self.add6_inner(tuple, dst4, masks, None, now, config, stats, None)
    }

    /// TCP entry point for an IPv6-originated segment, including Simultaneous-Open resolution.
    /// See [`SessionTable::add6`] for the returned [`Deferred`] list.
    #[allow(clippy::too_many_arguments)]
    pub fn add_tcp6(
        &self,
        tuple: Tuple6,
        dst4: Transport4,
        masks: &mut dyn Mask,
        event: TcpEvent,
        now: Instant,
        config: &Config,
        stats: &dyn StatsSink,
        collide: &mut dyn CollisionCb,
    ) -> Result<(Outcome<Found>, Vec<Deferred>)> {
        self.add6_inner(tuple, dst4, masks, Some(event), now, config, stats, Some(collide))
    }

    /// UDP/ICMP entry point for an IPv4-originated packet. Address-dependent filtering (§3.6.1)
    /// applies here when `config.drop_by_addr` is set. See [`SessionTable::add6`] for the
    /// returned [`Deferred`] list.
    pub fn add4(
        &self,
        tuple: Tuple4,
        dst6: Transport6,
        now: Instant,
        config: &Config,
        stats: &dyn StatsSink,
    ) -> Result<(Found, Vec<Deferred>)> {
        let (outcome, deferred) = self.add4_inner(tuple, dst6, None, now, config, stats, None)?;
        match outcome {
            Outcome::Found(found) => Ok((found, deferred)),
            Outcome::Stolen => Err(Error::NoSuchEntry),
        }
    }

    /// TCP entry point for an IPv4-originated segment. See [`SessionTable::add6`] for the
    /// returned [`Deferred`] list.
    #[allow(clippy::too_many_arguments)]
    pub fn add_tcp4(
        &self,
        tuple: Tuple4,
        dst6: Transport6,
        event: TcpEvent,
        now: Instant,
        config: &Config,
        stats: &dyn StatsSink,
        collide: &mut dyn CollisionCb,
    ) -> Result<(Outcome<Found>, Vec<Deferred>)> {
        self.add4_inner(tuple, dst6, Some(event), now, config, stats, Some(collide))
    }

    #[allow(clippy::too_many_arguments)]
    fn add4_inner(
        &self,
        tuple: Tuple4,
        dst6: Transport6,
        event: Option<TcpEvent>,
        now: Instant,
        config: &Config,
        stats: &dyn StatsSink,
        mut collide: Option<&mut dyn CollisionCb>,
    ) -> Result<(Outcome<Found>, Vec<Deferred>)> {
        let mut deferred = Vec::new();
        let is_syn = matches!(event, Some(TcpEvent::V4Syn));
        let mut inner = self.inner.lock();

        let bib_key = inner.tree4.find(&Bib4Key(tuple.dst)).copied();
        let bib_key = match bib_key {
            Some(key) => key,
            None => {
                if self.proto == Protocol::Tcp {
                    if is_syn {
                        if config.drop_external_tcp {
                            stats.incr(Stat::ExternalSynProhibited);
                            return Err(Error::ExternalSynProhibited);
                        }
                        if !inner.queue.has_room(config.max_stored_pkts) {
                            stats.incr(Stat::So1Full);
                            return Err(Error::NoSpace);
                        }
                        inner.queue.add(QueueNode {
                            src6: dst6,
                            dst6,
                            src4: tuple.src,
                            dst4: tuple.dst,
                            arrival: now,
                            packet: Vec::new(),
                        });
                        stats.incr(Stat::So1StoredPkt);
                        drop(inner);
                        return Ok((Outcome::Stolen, deferred));
                    }
                }
                stats.incr(Stat::NoBib);
                return Err(Error::NoSuchEntry);
            }
        };

        let session_key = SessionKey(tuple.src);
        let existing = inner
            .bibs
            .get(bib_key)
            .and_then(|bib| bib.sessions.find(&session_key))
            .copied();

        let result = if let Some(key) = existing {
            if let (Some(cb), Some(ev)) = (collide.as_deref_mut(), event) {
                let state = inner.sessions.get(key).map(|s| s.state);
                if let Some(state) = state {
                    let (new_state, fate) = cb.collide(state, ev);
                    if config.session_logging {
                        trace!("session dst6={:?} src4={:?} {:?} + {:?} -> {:?}", dst6, tuple.src, state, ev, new_state);
                    }
                    inner.apply_fate(key, new_state, fate, now, &mut deferred);
                }
            } else {
                inner.rearm(key, now, ExpirerClass::Established);
            }
            found_or_warn(&inner, key)
        } else {
            let address_seen = inner
                .bibs
                .get(bib_key)
                .map(|bib| {
                    bib.sessions
                        .values()
                        .any(|session_key| {
                            inner
                                .sessions
                                .get(*session_key)
                                .map(|s| s.dst4.addr == tuple.src.addr)
                                .unwrap_or(false)
                        })
                })
                .unwrap_or(false);

            if config.drop_by_addr && !address_seen {
                if self.proto == Protocol::Tcp {
                    if !inner.queue.has_room(config.max_stored_pkts) {
                        stats.incr(Stat::So2Full);
                        return Err(Error::NoSpace);
                    }
                    let mut session = Session::new(
                        dst6,
                        tuple.src,
                        TcpState::V4Init,
                        ExpirerClass::Syn4,
                        now,
                        bib_key,
                    );
                    session.attach_stored(self.proto);
                    let session_key = match inner.sessions.try_insert(session) {
                        Ok(key) => key,
                        Err(err) => return Err(err),
                    };
                    inner.syn4.insert(now, session_key);
                    inner.queue.note_type2_added();
                    if let Some(bib) = inner.bibs.get_mut(bib_key) {
                        bib.sessions
                            .find_slot(SessionKey(tuple.src))
                            .vacant()
                            .map(|slot| slot.commit(session_key));
                    }
                    if config.session_logging {
                        debug!("new {:?} session dst6={:?} src4={:?} state=V4Init (adf hole punch)", self.proto, dst6, tuple.src);
                    }
                    stats.incr(Stat::So2StoredPkt);
                    found_or_warn(&inner, session_key)
                } else {
                    stats.incr(Stat::Adf);
                    return Err(Error::AddressFilterRejected);
                }
            } else {
                let state = self.session_state_for_new(event);
                let class = expirer_for_state(self.proto, state);
                let session = Session::new(dst6, tuple.src, state, class, now, bib_key);
                let session_key = match inner.sessions.try_insert(session) {
                    Ok(key) => key,
                    Err(err) => return Err(err),
                };
                inner.list_mut(class).insert(now, session_key);
                if let Some(bib) = inner.bibs.get_mut(bib_key) {
                    bib.sessions
                        .find_slot(SessionKey(tuple.src))
                        .vacant()
                        .map(|slot| slot.commit(session_key));
                }
                if config.session_logging {
                    debug!("new {:?} session dst6={:?} src4={:?} state={:?}", self.proto, dst6, tuple.src, state);
                }
                found_or_warn(&inner, session_key)
            }
        };

        drop(inner);
        Ok((result, deferred))
    }

    /// Administrative static BIB creation (§4.F). A v6 collision with the same v4 address
    /// upgrades the existing entry to static in place; any other collision (same v6 under a
    /// different v4, or the v4 address already claimed by a different v6) fails.
    pub fn add_static(&self, src6: Transport6, src4: Transport4) -> Result<()> {
        let mut inner = self.inner.lock();
        let by_v6 = inner.tree6.find(&Bib6Key(src6)).copied();
        let by_v4 = inner.tree4.find(&Bib4Key(src4)).copied();

        match (by_v6, by_v4) {
            (Some(v6_key), Some(v4_key)) if v6_key == v4_key => {
                let bib = inner.bibs.get_mut(v6_key).ok_or(Error::NoSuchEntry)?;
                bib.is_static = true;
                log::info!("{:?} bib src6={:?} src4={:?} upgraded to static", self.proto, src6, src4);
                return Ok(());
            }
            (Some(_), _) | (_, Some(_)) => return Err(Error::AlreadyExists),
            (None, None) => {}
        }

        let evicted = inner.queue.evict_colliding(src4);
        drop(evicted); // type-1 nodes reserving this address no longer apply; dropped silently.

        let bib_key = inner.bibs.try_insert(Bib::new(src6, src4, true))?;
        inner.tree6.find_slot(Bib6Key(src6)).vacant().map(|s| s.commit(bib_key));
        inner.tree4.find_slot(Bib4Key(src4)).vacant().map(|s| s.commit(bib_key));
        log::info!("static {:?} bib reserved src6={:?} src4={:?}", self.proto, src6, src4);
        Ok(())
    }

    /// Find an existing BIB+session pair by its IPv6-side identity, without creating anything.
    pub fn find6(&self, src6: Transport6, dst4: Transport4) -> Option<Found> {
        let inner = self.inner.lock();
        let bib_key = inner.tree6.find(&Bib6Key(src6)).copied()?;
        let session_key = inner.bibs.get(bib_key)?.sessions.find(&SessionKey(dst4)).copied()?;
        inner.snapshot(session_key)
    }

    /// Find an existing BIB+session pair by its IPv4-side identity.
    pub fn find4(&self, dst4: Transport4, src4: Transport4) -> Option<Found> {
        let inner = self.inner.lock();
        let bib_key = inner.tree4.find(&Bib4Key(dst4)).copied()?;
        let session_key = inner.bibs.get(bib_key)?.sessions.find(&SessionKey(src4)).copied()?;
        inner.snapshot(session_key)
    }

    /// Remove one BIB (and every session under it) by its v6 identity, regardless of
    /// `is_static` (administrative override, §4.F).
    pub fn remove(&self, src6: Transport6) -> Result<()> {
        let mut inner = self.inner.lock();
        let bib_key = inner.tree6.find(&Bib6Key(src6)).copied().ok_or(Error::NoSuchEntry)?;
        let mut deferred = Vec::new();
        let session_keys: Vec<Key<SessionTag>> = inner
            .bibs
            .get(bib_key)
            .map(|bib| bib.sessions.values().copied().collect())
            .unwrap_or_default();
        for key in session_keys {
            inner.remove_session(key, &mut deferred);
        }
        // `remove_session` only drops a now-empty BIB when it isn't static; an administrative
        // `remove` overrides that and deletes the BIB unconditionally.
        if let Some(removed) = inner.bibs.remove(bib_key) {
            inner.tree6.erase(&Bib6Key(removed.src6));
            inner.tree4.erase(&Bib4Key(removed.src4));
        }
        log::info!("{:?} bib src6={:?} removed by administrative request", self.proto, src6);
        Ok(())
    }

    /// Remove every BIB whose v4 address falls in `start..=end` (administrative pool
    /// withdrawal); static entries are exempt.
    pub fn remove_range(&self, start: Transport4, end: Transport4) -> usize {
        let mut inner = self.inner.lock();
        let matching: Vec<Key<BibTag>> = inner
            .tree4
            .iter()
            .filter(|(key, _)| key.0.addr >= start.addr && key.0.addr <= end.addr)
            .map(|(_, key)| *key)
            .collect();

        let mut removed = 0;
        let mut deferred = Vec::new();
        for bib_key in matching {
            let is_static = inner.bibs.get(bib_key).map(|b| b.is_static).unwrap_or(true);
            if is_static {
                continue;
            }
            let session_keys: Vec<Key<SessionTag>> = inner
                .bibs
                .get(bib_key)
                .map(|bib| bib.sessions.values().copied().collect())
                .unwrap_or_default();
            for key in session_keys {
                inner.remove_session(key, &mut deferred);
            }
            removed += 1;
        }
        removed
    }

    /// Drop every entry in the table, static or not (administrative reset, §4.F).
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.bibs = Arena::with_capacity(self.bib_capacity);
        inner.sessions = Arena::with_capacity(self.session_capacity);
        inner.tree6 = Index::new();
        inner.tree4 = Index::new();
        inner.established = ExpirerListOf::new();
        inner.transitory = ExpirerListOf::new();
        inner.syn4 = ExpirerListOf::new();
        inner.queue = PacketQueue::new();
        log::info!("{:?} table flushed by administrative request", self.proto);
    }

    /// Visit every BIB entry in v6-key order, starting from `offset` when given: `(src6,
    /// include_offset)` resumes a paged enumeration right where a previous call left off,
    /// re-locating the cursor by key rather than by position so entries that expire between
    /// calls are simply skipped rather than corrupting the traversal (§6 "tolerating entries
    /// that expire mid-traversal").
    pub fn foreach<F: FnMut(BibSnapshot) -> bool>(
        &self,
        offset: Option<(Transport6, bool)>,
        mut cb: F,
    ) {
        let inner = self.inner.lock();
        let visit = |bib_key: &Key<BibTag>| -> bool {
            let Some(bib) = inner.bibs.get(*bib_key) else {
                return true;
            };
            cb(BibSnapshot {
                src6: bib.src6,
                src4: bib.src4,
                is_static: bib.is_static,
            })
        };
        match offset {
            None => {
                for (_, bib_key) in inner.tree6.iter() {
                    if !visit(bib_key) {
                        break;
                    }
                }
            }
            Some((start, inclusive)) => {
                inner.tree6.foreach(&Bib6Key(start), inclusive, |_, bib_key| visit(bib_key));
            }
        }
    }

    /// Visit every session under the BIB identified by `src6`, in `dst4`-key order, starting
    /// from `offset` when given: `(dst4, include_offset)` resumes a paged per-session
    /// enumeration the same way [`SessionTable::foreach`] does for BIBs.
    pub fn foreach_session<F: FnMut(SessionSnapshot) -> bool>(
        &self,
        src6: Transport6,
        offset: Option<(Transport4, bool)>,
        mut cb: F,
    ) {
        let inner = self.inner.lock();
        let Some(bib_key) = inner.tree6.find(&Bib6Key(src6)).copied() else {
            return;
        };
        let Some(bib) = inner.bibs.get(bib_key) else {
            return;
        };
        let visit = |session_key: &Key<SessionTag>| -> bool {
            let Some(session) = inner.sessions.get(*session_key) else {
                return true;
            };
            cb(SessionSnapshot {
                dst6: session.dst6,
                dst4: session.dst4,
                state: session.state,
                update_time: session.update_time,
            })
        };
        match offset {
            None => {
                for session_key in bib.sessions.values() {
                    if !visit(session_key) {
                        break;
                    }
                }
            }
            Some((start, inclusive)) => {
                bib.sessions
                    .foreach(&SessionKey(start), inclusive, |_, session_key| visit(session_key));
            }
        }
    }

    /// Sweep every expirer list (and, for TCP, the packet queue) for entries past their TTL
    /// (§4.E). Non-TCP tables only ever use the `established` list and a session's timeout
    /// means outright removal; TCP tables additionally run the state machine on each expired
    /// session so e.g. `Established` sessions get probed once before being removed.
    pub fn clean(
        &self,
        now: Instant,
        config: &Config,
        stats: &dyn StatsSink,
        collide: &mut dyn CollisionCb,
    ) -> Vec<Deferred> {
        let mut deferred = Vec::new();
        let mut inner = self.inner.lock();

        let classes = if self.proto == Protocol::Tcp {
            vec![
                (ExpirerClass::Established, config.tcp_est_ttl),
                (ExpirerClass::Transitory, config.tcp_trans_ttl),
                (ExpirerClass::Syn4, config.syn4_ttl),
            ]
        } else {
            let ttl = match self.proto {
                Protocol::Udp => config.udp_ttl,
                Protocol::Icmp => config.icmp_ttl,
                Protocol::Tcp => unreachable!(),
            };
            vec![(ExpirerClass::Established, ttl)]
        };

        for (class, ttl) in classes {
            let expired = inner.list_mut(class).drain_expired(now, ttl);
            for session_key in expired {
                if self.proto == Protocol::Tcp {
                    let state = inner.sessions.get(session_key).map(|s| s.state);
                    if let Some(state) = state {
                        let (new_state, fate) = collide.collide(state, TcpEvent::Timer);
                        if config.session_logging {
                            trace!("{:?} timer: {:?} -> {:?}, fate {:?}", class, state, new_state, fate);
                        }
                        inner.apply_fate(session_key, new_state, fate, now, &mut deferred);
                    }
                } else {
                    if config.session_logging {
                        debug!("{:?} session timed out, removing", self.proto);
                    }
                    inner.remove_session(session_key, &mut deferred);
                }
            }
        }

        if self.proto == Protocol::Tcp {
            let expired_nodes = inner.queue.drain_expired(now, config.syn4_ttl);
            for node in expired_nodes {
                stats.incr(Stat::NoBib);
                deferred.push(Deferred::IcmpUnreachable { packet: node.packet });
            }
        }

        deferred
    }
}

/// A session just inserted under `key` should always still be there; this only returns
/// `Outcome::Stolen` if that invariant is somehow violated, and logs a warning when it is.
fn found_or_warn(inner: &Inner, key: Key<SessionTag>) -> Outcome<Found> {
    match inner.snapshot(key) {
        Some(found) => Outcome::Found(found),
        None => {
            log::warn!("session vanished immediately after insertion, dropping");
            Outcome::Stolen
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::PortRangeMask;
    use crate::stats::NullSink;
    use crate::tcp_sm::DefaultStateMachine;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn tuple6(src_port: u16, dst_port: u16) -> Tuple6 {
        Tuple6 {
            src: Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), src_port),
            dst: Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2), dst_port),
            proto: Protocol::Udp,
        }
    }

    #[test]
    fn udp_add6_then_add4_round_trips() {
        let table = SessionTable::new(Protocol::Udp, 16, 16);
        let config = Config::default();
        let stats = NullSink;
        let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61010);

        let dst4 = Transport4::new(Ipv4Addr::new(203, 0, 113, 5), 53);
        let (outcome, _deferred) = table
            .add6(tuple6(1000, 53), dst4, &mut mask, Instant::from_millis(0), &config, &stats)
            .unwrap();
        let found = outcome.found().unwrap();
        assert_eq!(found.bib.src4.addr, Ipv4Addr::new(192, 0, 2, 1));

        let tuple4 = Tuple4 {
            src: dst4,
            dst: found.bib.src4,
            proto: Protocol::Udp,
        };
        let (by_v4, _deferred) = table
            .add4(
                tuple4,
                Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 1000),
                Instant::from_millis(1),
                &config,
                &stats,
            )
            .unwrap();
        assert_eq!(by_v4.bib.src4, found.bib.src4);
    }

    #[test]
    fn pool_exhaustion_reports_pool4_exhausted() {
        let table = SessionTable::new(Protocol::Udp, 16, 16);
        let config = Config::default();
        let stats = NullSink;
        let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61001);

        let dst4 = Transport4::new(Ipv4Addr::new(203, 0, 113, 5), 53);
        table
            .add6(tuple6(1, 53), dst4, &mut mask, Instant::from_millis(0), &config, &stats)
            .unwrap();

        let mut empty_mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61002, 61001);
        let err = table
            .add6(tuple6(2, 53), dst4, &mut empty_mask, Instant::from_millis(0), &config, &stats)
            .unwrap_err();
        assert_eq!(err, Error::PoolExhausted);
    }

    #[test]
    fn stale_bib_eviction_surfaces_a_stored_packet_as_deferred() {
        let table = SessionTable::new(Protocol::Tcp, 16, 16);
        let mut config = Config::default();
        config.drop_by_addr = true;
        let stats = NullSink;
        let mut sm = DefaultStateMachine;

        // First session establishes the BIB at 192.0.2.1:61001.
        let src6 = Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 61001);
        let dst6 = Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 9), 443);
        let remote_dst4 = Transport4::new(Ipv4Addr::new(203, 0, 113, 5), 443);
        let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61010);
        let v6_tuple = Tuple6 { src: src6, dst: dst6, proto: Protocol::Tcp };
        let (outcome, _) = table
            .add_tcp6(v6_tuple, remote_dst4, &mut mask, TcpEvent::V6Syn, Instant::from_millis(0), &config, &stats, &mut sm)
            .unwrap();
        let src4 = outcome.found().unwrap().bib.src4;

        // A packet from an unseen remote is parked as a type-2 ADF hole-punch session, carrying
        // a stored packet, under the same BIB.
        let unseen_remote = Tuple4 {
            src: Transport4::new(Ipv4Addr::new(198, 51, 100, 9), 443),
            dst: src4,
            proto: Protocol::Tcp,
        };
        let unseen_remote_v6 = Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0xc633, 0x6409), 443);
        table
            .add_tcp4(unseen_remote, unseen_remote_v6, TcpEvent::Data, Instant::from_millis(1), &config, &stats, &mut sm)
            .unwrap();

        // Pool4 is reconfigured to no longer cover 192.0.2.1; the next v6 packet from the same
        // source evicts the stale BIB, which must surface the type-2 session's stored packet.
        let mut new_mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 2), 61001, 61010);
        let (_, deferred) = table
            .add_tcp6(v6_tuple, remote_dst4, &mut new_mask, TcpEvent::V6Syn, Instant::from_millis(2), &config, &stats, &mut sm)
            .unwrap();
        assert!(deferred
            .iter()
            .any(|event| matches!(event, Deferred::IcmpUnreachable { .. })));
    }

    #[test]
    fn address_dependent_filtering_rejects_unseen_remote() {
        let table = SessionTable::new(Protocol::Udp, 16, 16);
        let mut config = Config::default();
        config.drop_by_addr = true;
        let stats = NullSink;
        let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61010);

        let dst4 = Transport4::new(Ipv4Addr::new(203, 0, 113, 5), 53);
        let (outcome, _deferred) = table
            .add6(tuple6(1, 53), dst4, &mut mask, Instant::from_millis(0), &config, &stats)
            .unwrap();
        let found = outcome.found().unwrap();

        let other_remote = Transport4::new(Ipv4Addr::new(203, 0, 113, 9), 53);
        let tuple4 = Tuple4 {
            src: other_remote,
            dst: found.bib.src4,
            proto: Protocol::Udp,
        };
        let err = table
            .add4(
                tuple4,
                Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 9), 53),
                Instant::from_millis(1),
                &config,
                &stats,
            )
            .unwrap_err();
        assert_eq!(err, Error::AddressFilterRejected);
    }

    #[test]
    fn tcp_simultaneous_open_resolves_through_v6_side() {
        let table = SessionTable::new(Protocol::Tcp, 16, 16);
        let config = Config::default();
        let stats = NullSink;
        let mut sm = DefaultStateMachine;

        let v4_tuple = Tuple4 {
            src: Transport4::new(Ipv4Addr::new(203, 0, 113, 5), 443),
            dst: Transport4::new(Ipv4Addr::new(192, 0, 2, 1), 61001),
            proto: Protocol::Tcp,
        };
        let (outcome, _deferred) = table
            .add_tcp4(
                v4_tuple,
                Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 9), 443),
                TcpEvent::V4Syn,
                Instant::from_millis(0),
                &config,
                &stats,
                &mut sm,
            )
            .unwrap();
        assert!(outcome.is_stolen());

        let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61010);
        let v6_tuple = Tuple6 {
            src: Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 61001),
            dst: Transport6::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 9), 443),
            proto: Protocol::Tcp,
        };
        let (outcome, _deferred) = table
            .add_tcp6(
                v6_tuple,
                Transport4::new(Ipv4Addr::new(203, 0, 113, 5), 443),
                &mut mask,
                TcpEvent::V6Syn,
                Instant::from_millis(1),
                &config,
                &stats,
                &mut sm,
            )
            .unwrap();
        let found = outcome.found().unwrap();
        assert_eq!(found.bib.src4.addr, Ipv4Addr::new(192, 0, 2, 1));
    }
}
