//! Black-box scenarios against the public `Database` facade.

use std::net::{Ipv4Addr, Ipv6Addr};

use nat64_bib::database::Database;
use nat64_bib::mask::PortRangeMask;
use nat64_bib::stats::{NullSink, Stat, StatsSink};
use nat64_bib::tcp_sm::{DefaultStateMachine, TcpEvent};
use nat64_bib::{Config, Instant, Protocol, Transport4, Transport6, Tuple4, Tuple6};

fn v6(addr: [u16; 8], port: u16) -> Transport6 {
    Transport6::new(
        Ipv6Addr::new(
            addr[0], addr[1], addr[2], addr[3], addr[4], addr[5], addr[6], addr[7],
        ),
        port,
    )
}

fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Transport4 {
    Transport4::new(Ipv4Addr::new(a, b, c, d), port)
}

#[test]
fn s1_udp_new_flow_allocates_first_pool_address() {
    let db = Database::with_capacity(Config::default(), 16, 16);
    let stats = NullSink;
    let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61002);

    let tuple = Tuple6 {
        src: v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 1000),
        dst: v6([0x0064, 0xff9b, 0, 0, 0, 0, 0xcb00, 0x7105], 80),
        proto: Protocol::Udp,
    };
    let dst4 = v4(203, 0, 113, 5, 80);

    let (outcome, _deferred) = db
        .add6(Protocol::Udp, tuple, dst4, &mut mask, Instant::from_millis(0), &stats)
        .unwrap();
    let found = outcome.found().unwrap();

    assert_eq!(found.bib.src6, tuple.src);
    assert_eq!(found.bib.src4, v4(192, 0, 2, 1, 61001));
    assert_eq!(found.session.dst6, tuple.dst);
    assert_eq!(found.session.dst4, dst4);
}

#[derive(Default)]
struct CountingSink {
    counts: std::sync::Mutex<std::collections::HashMap<&'static str, u32>>,
}

impl CountingSink {
    fn count(&self, stat: Stat) -> u32 {
        *self
            .counts
            .lock()
            .unwrap()
            .get(Self::name(stat))
            .unwrap_or(&0)
    }

    fn name(stat: Stat) -> &'static str {
        match stat {
            Stat::Pool4Exhausted => "pool4_exhausted",
            Stat::So1StoredPkt => "so1_stored_pkt",
            Stat::So1Exists => "so1_exists",
            Stat::So1Full => "so1_full",
            Stat::So2StoredPkt => "so2_stored_pkt",
            Stat::So2Full => "so2_full",
            Stat::Adf => "adf",
            Stat::NoBib => "no_bib",
            Stat::ExternalSynProhibited => "external_syn_prohibited",
            Stat::TcpSm => "tcp_sm",
            Stat::Unknown6 => "unknown6",
            Stat::Unknown4 => "unknown4",
            Stat::Unknown => "unknown",
        }
    }
}

impl StatsSink for CountingSink {
    fn incr(&self, stat: Stat) {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(Self::name(stat))
            .or_insert(0) += 1;
    }
}

#[test]
fn s2_pool_exhaustion_reports_stat_and_preserves_first_binding() {
    let db = Database::with_capacity(Config::default(), 16, 16);
    let stats = CountingSink::default();
    let dst4 = v4(203, 0, 113, 5, 80);

    let mut mask1 = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61001);
    let tuple1 = Tuple6 {
        src: v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 1000),
        dst: v6([0x0064, 0xff9b, 0, 0, 0, 0, 0xcb00, 0x7105], 80),
        proto: Protocol::Udp,
    };
    let (outcome1, _deferred) = db
        .add6(Protocol::Udp, tuple1, dst4, &mut mask1, Instant::from_millis(0), &stats)
        .unwrap();
    let found1 = outcome1.found().unwrap();
    assert_eq!(found1.bib.src4, v4(192, 0, 2, 1, 61001));

    let mut exhausted_mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61002, 61001);
    let tuple2 = Tuple6 {
        src: v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 2], 1000),
        dst: tuple1.dst,
        proto: Protocol::Udp,
    };
    let err = db
        .add6(
            Protocol::Udp,
            tuple2,
            dst4,
            &mut exhausted_mask,
            Instant::from_millis(1),
            &stats,
        )
        .unwrap_err();
    assert_eq!(err, nat64_bib::Error::PoolExhausted);
    assert_eq!(stats.count(Stat::Pool4Exhausted), 1);

    // The first binding is untouched by the second source's failed allocation.
    let still_there = db.find6(Protocol::Udp, tuple1.src, dst4).unwrap();
    assert_eq!(still_there.bib.src4, v4(192, 0, 2, 1, 61001));
}

#[test]
fn s3_tcp_simultaneous_open_uses_the_stored_source_address() {
    let db = Database::with_capacity(Config::default(), 16, 16);
    let stats = CountingSink::default();
    let mut sm = DefaultStateMachine;

    let remote_v6 = v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 9], 443);
    let v4_tuple = Tuple4 {
        src: v4(203, 0, 113, 5, 443),
        dst: v4(192, 0, 2, 1, 61001),
        proto: Protocol::Tcp,
    };

    let (outcome, _deferred) = db
        .add_tcp4(
            v4_tuple,
            remote_v6,
            TcpEvent::V4Syn,
            Instant::from_millis(0),
            &stats,
            &mut sm,
        )
        .unwrap();
    assert!(outcome.is_stolen());
    assert_eq!(stats.count(Stat::So1StoredPkt), 1);

    let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61010);
    let v6_tuple = Tuple6 {
        src: v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 61001),
        dst: remote_v6,
        proto: Protocol::Tcp,
    };
    let (outcome, _deferred) = db
        .add_tcp6(
            v6_tuple,
            v4_tuple.src,
            &mut mask,
            TcpEvent::V6Syn,
            Instant::from_millis(3_000),
            &stats,
            &mut sm,
        )
        .unwrap();
    let found = outcome.found().unwrap();

    assert_eq!(found.bib.src4, v4_tuple.dst, "SO must reuse the stored src4, not pick a new one");
    assert_eq!(stats.count(Stat::So1Exists), 1);
}

#[test]
fn s4_syn4_timeout_icmp_errors_the_stored_packet() {
    let mut config = Config::default();
    config.max_stored_pkts = 8;
    let db = Database::with_capacity(config, 16, 16);
    let stats = CountingSink::default();
    let mut sm = DefaultStateMachine;

    let v4_tuple = Tuple4 {
        src: v4(203, 0, 113, 5, 443),
        dst: v4(192, 0, 2, 1, 61001),
        proto: Protocol::Tcp,
    };
    db.add_tcp4(
        v4_tuple,
        v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 9], 443),
        TcpEvent::V4Syn,
        Instant::from_millis(0),
        &stats,
        &mut sm,
    )
    .unwrap();

    let deferred = db.clean(Instant::from_millis(6_001), &stats, &mut sm);
    assert!(deferred
        .iter()
        .any(|event| matches!(event, nat64_bib::Deferred::IcmpUnreachable { .. })));
}

#[test]
fn s5_address_dependent_filtering_rejects_a_different_remote() {
    let mut config = Config::default();
    config.drop_by_addr = true;
    let db = Database::with_capacity(config, 16, 16);
    let stats = CountingSink::default();
    let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61010);

    let tuple = Tuple6 {
        src: v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 1000),
        dst: v6([0x0064, 0xff9b, 0, 0, 0, 0, 0xcb00, 0x7105], 80),
        proto: Protocol::Udp,
    };
    let dst4 = v4(203, 0, 113, 5, 80);
    let (outcome, _deferred) = db
        .add6(Protocol::Udp, tuple, dst4, &mut mask, Instant::from_millis(0), &stats)
        .unwrap();
    let found = outcome.found().unwrap();

    let other_remote = v4(198, 51, 100, 9, 80);
    let tuple4 = Tuple4 {
        src: other_remote,
        dst: found.bib.src4,
        proto: Protocol::Udp,
    };
    let err = db
        .add4(
            Protocol::Udp,
            tuple4,
            v6([0x0064, 0xff9b, 0, 0, 0, 0, 0xc633, 0x6409], 80),
            Instant::from_millis(1),
            &stats,
        )
        .unwrap_err();
    assert_eq!(err, nat64_bib::Error::AddressFilterRejected);
    assert_eq!(stats.count(Stat::Adf), 1);
}

#[test]
fn add_static_upgrades_matching_dynamic_bib_in_place() {
    let db = Database::with_capacity(Config::default(), 16, 16);
    let stats = NullSink;
    let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61010);

    let tuple = Tuple6 {
        src: v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 1000),
        dst: v6([0x0064, 0xff9b, 0, 0, 0, 0, 0xcb00, 0x7105], 80),
        proto: Protocol::Udp,
    };
    let dst4 = v4(203, 0, 113, 5, 80);
    let (outcome, _deferred) = db
        .add6(Protocol::Udp, tuple, dst4, &mut mask, Instant::from_millis(0), &stats)
        .unwrap();
    let found = outcome.found().unwrap();
    assert!(!found.bib.is_static);

    db.add_static(Protocol::Udp, tuple.src, found.bib.src4).unwrap();
    let upgraded = db.find6(Protocol::Udp, tuple.src, dst4).unwrap();
    assert!(upgraded.bib.is_static);
}

#[test]
fn add_static_rejects_a_v4_address_claimed_by_a_different_v6_source() {
    let db = Database::with_capacity(Config::default(), 16, 16);
    let src4 = v4(192, 0, 2, 1, 61001);
    db.add_static(Protocol::Udp, v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 1000), src4)
        .unwrap();

    let err = db
        .add_static(Protocol::Udp, v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 2], 1000), src4)
        .unwrap_err();
    assert_eq!(err, nat64_bib::Error::AlreadyExists);
}

#[test]
fn remove_deletes_a_static_bib_despite_the_normal_retention_rule() {
    let db = Database::with_capacity(Config::default(), 16, 16);
    let src6 = v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 1000);
    let src4 = v4(192, 0, 2, 1, 61001);
    db.add_static(Protocol::Udp, src6, src4).unwrap();
    assert!(db.find6(Protocol::Udp, src6, v4(203, 0, 113, 5, 80)).is_none());

    db.remove(Protocol::Udp, src6).unwrap();
    assert_eq!(
        db.remove(Protocol::Udp, src6).unwrap_err(),
        nat64_bib::Error::NoSuchEntry
    );
}

#[test]
fn foreach_offset_resumes_a_paged_enumeration() {
    let db = Database::with_capacity(Config::default(), 16, 16);
    let mut mask = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61010);
    let stats = NullSink;
    let dst4 = v4(203, 0, 113, 5, 80);

    let mut sources = Vec::new();
    for host in 1..=3u16 {
        let tuple = Tuple6 {
            src: v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, host], 1000),
            dst: v6([0x0064, 0xff9b, 0, 0, 0, 0, 0xcb00, 0x7105], 80),
            proto: Protocol::Udp,
        };
        db.add6(Protocol::Udp, tuple, dst4, &mut mask, Instant::from_millis(0), &stats)
            .unwrap();
        sources.push(tuple.src);
    }
    sources.sort_by_key(|t| t.addr);

    let mut all = Vec::new();
    db.foreach(Protocol::Udp, None, |bib| {
        all.push(bib.src6);
        true
    });
    assert_eq!(all, sources);

    let mut resumed = Vec::new();
    db.foreach(Protocol::Udp, Some((sources[0], false)), |bib| {
        resumed.push(bib.src6);
        true
    });
    assert_eq!(resumed, &sources[1..]);
}

#[test]
fn s6_stale_bib_is_evicted_and_replaced_on_next_v6_packet() {
    let db = Database::with_capacity(Config::default(), 16, 16);
    let stats = NullSink;

    let tuple = Tuple6 {
        src: v6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 1000),
        dst: v6([0x0064, 0xff9b, 0, 0, 0, 0, 0xcb00, 0x7105], 80),
        proto: Protocol::Udp,
    };
    let dst4 = v4(203, 0, 113, 5, 80);

    let mut old_pool = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 1), 61001, 61002);
    let (outcome, _deferred) = db
        .add6(Protocol::Udp, tuple, dst4, &mut old_pool, Instant::from_millis(0), &stats)
        .unwrap();
    let first = outcome.found().unwrap();
    assert_eq!(first.bib.src4.addr, Ipv4Addr::new(192, 0, 2, 1));

    // Pool4 is reconfigured to a disjoint range, so the existing BIB's address is no longer
    // covered by any mask the translator will hand in from this point on.
    let mut new_pool = PortRangeMask::new(Ipv4Addr::new(192, 0, 2, 2), 61001, 61002);
    let (outcome, _deferred) = db
        .add6(Protocol::Udp, tuple, dst4, &mut new_pool, Instant::from_millis(1), &stats)
        .unwrap();
    let second = outcome.found().unwrap();
    assert_eq!(second.bib.src4.addr, Ipv4Addr::new(192, 0, 2, 2));
}
