//! A stateful NAT64 Binding Information Base and session database (RFC 6146 §3).
//!
//! This crate implements the core data structures a NAT64 translator needs to decide, for any
//! incoming packet, which (if any) existing binding and session it belongs to, and whether a new
//! one should be created: the BIB/session tables, the IPv4 pool allocation contract, the packet
//! queue used to resolve TCP Simultaneous Open, the expiry engine, and a simplified TCP state
//! machine. Header parsing, checksum handling, routing, and the actual translation of packet
//! bytes are out of scope — this crate is the bookkeeping core a translator's packet path calls
//! into on every packet.
//!
//! Start at [`database::Database`] for the façade most callers want.

pub mod arena;
pub mod bib;
pub mod config;
pub mod database;
pub mod error;
pub mod expiry;
pub mod index;
pub mod mask;
pub mod proto;
pub mod queue;
pub mod session;
pub mod stats;
pub mod table;
pub mod tcp_sm;
pub mod time;

pub use config::{Config, WireConfig};
pub use database::Database;
pub use error::{Error, Outcome, Result};
pub use mask::{Mask, PortRangeMask};
pub use proto::{Protocol, Transport4, Transport6, Tuple4, Tuple6};
pub use stats::{NullSink, Stat, StatsSink};
pub use table::{BibSnapshot, Deferred, Found, SessionSnapshot, SessionTable};
pub use tcp_sm::{CollisionCb, DefaultStateMachine, ExpirerClass, Fate, TcpEvent, TcpState};
pub use time::{Duration, Expiration, Instant};
