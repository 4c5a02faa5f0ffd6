//! The TCP session state machine and fate decisions (§4.C "TCP state machine (simplified)").
//!
//! Grounded on `mod/nat64/bib/db.c`'s `decide_fate`/`handle_probe`/`rm`/`queue_unsorted_session`:
//! a collision callback inspects an incoming event against the session's current state and
//! returns a [`Fate`], which the table then applies (re-arm a timer, send a probe, remove the
//! session, or reject the packet outright). Fate dispatch is a tagged enum rather than dynamic
//! dispatch, per §9's design note — no `dyn` is needed since there is exactly one decision
//! point per call.

/// Which of a table's three expirer lists a session belongs to.
///
/// Jool's `nat64/bib/db.c` distinguishes these only by which `struct expire_timer` a
/// session's `list_hook` happens to be linked into; representing it as an enum field on
/// [`crate::session::Session`] as well makes "a session belongs to exactly one list" (§8,
/// invariant 2) checkable without walking every list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpirerClass {
    Established,
    Transitory,
    Syn4,
}

/// The TCP connection state of a session. `CLOSED` is deliberately absent: per §3/§4.C it is
/// represented by the absence of a session entirely, not a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    V6Init,
    V4Init,
    Established,
    V6FinRcv,
    V4FinRcv,
    V4FinV6FinRcv,
    Trans,
}

/// One observation presented to the state machine: either an incoming segment's relevant flags
/// collapsed to a single event, or a timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpEvent {
    V6Syn,
    V4Syn,
    V6Fin,
    V4Fin,
    V6Rst,
    V4Rst,
    Data,
    Timer,
}

/// The decision a collision callback hands back to the table (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fate {
    /// Move the session to the Established list; its timeout is the long one.
    TimerEst,
    /// Move the session to the Transitory list; its timeout is the short one.
    TimerTrans,
    /// Move the session to a caller-specified list, preserving list order rather than
    /// re-inserting at the tail.
    TimerSlow(ExpirerClass),
    /// Send an empty TCP ACK to the IPv6 endpoint, then behave as `TimerTrans`.
    Probe,
    /// Remove the session (and its BIB, if non-static and this was its last session).
    Rm,
    /// Leave the session untouched.
    Preserve,
    /// Reject the packet; propagated to the caller as [`crate::error::Error::TcpStateViolation`].
    Drop,
}

/// Decides the next state and fate for a TCP session observing `event` while in `state`.
///
/// This is the crate's built-in state machine (component D, §2), good enough to drive every
/// scenario in §8. A translator that needs RFC 6146 §3.5.2's full precision (sequence number
/// tracking, simultaneous-close subtleties) can supply its own [`CollisionCb`] instead of this
/// default — the table only ever calls through the trait.
pub fn transition(state: TcpState, event: TcpEvent) -> (TcpState, Fate) {
    use Fate::*;
    use TcpEvent::*;
    use TcpState::*;

    match (state, event) {
        (V6Init, V4Syn) => (Established, TimerEst),
        (V6Init, Timer) => (Trans, Probe),
        (V4Init, V6Syn) => (Established, TimerEst),
        (V4Init, Timer) => (Trans, Rm),

        (Established, V6Fin) => (V6FinRcv, TimerTrans),
        (Established, V4Fin) => (V4FinRcv, TimerTrans),
        (Established, Timer) => (Trans, Probe),
        (Established, Data) => (Established, TimerEst),

        (V6FinRcv, V4Fin) => (V4FinV6FinRcv, TimerTrans),
        (V4FinRcv, V6Fin) => (V4FinV6FinRcv, TimerTrans),
        (V6FinRcv, Timer) | (V4FinRcv, Timer) => (Trans, Rm),
        (V4FinV6FinRcv, Timer) => (Trans, Rm),

        (Trans, Timer) => (Trans, Rm),

        // A reset from either side always tears the session down, regardless of state.
        (current, V6Rst) | (current, V4Rst) => (current, Rm),

        // Anything else (e.g. a retransmitted SYN, or data arriving on a half-open
        // connection) does not move the state machine.
        (current, _) => (current, Preserve),
    }
}

/// A hook the table runs an existing session through before re-arming its timer (§4.C).
///
/// Implemented by [`transition`]'s default wiring for any `FnMut(TcpState, TcpEvent) -> (TcpState,
/// Fate)`, so a translator can pass a closure, or provide a richer stateful implementation of
/// this trait directly.
pub trait CollisionCb {
    fn collide(&mut self, state: TcpState, event: TcpEvent) -> (TcpState, Fate);
}

impl<F> CollisionCb for F
where
    F: FnMut(TcpState, TcpEvent) -> (TcpState, Fate),
{
    fn collide(&mut self, state: TcpState, event: TcpEvent) -> (TcpState, Fate) {
        self(state, event)
    }
}

/// A [`CollisionCb`] that always applies [`transition`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStateMachine;

impl CollisionCb for DefaultStateMachine {
    fn collide(&mut self, state: TcpState, event: TcpEvent) -> (TcpState, Fate) {
        transition(state, event)
    }
}
