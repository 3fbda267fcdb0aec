//! Upstream selection and transport behavior of the relay, exercised against
//! fake DNS servers on loopback

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::{answering, query, silent, FakeUpstream};
use doh_relay::dns::client::DnsNetworkClient;
use doh_relay::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode};
use doh_relay::dns::relay::{Relay, RelayError};
use doh_relay::dns::rfc8482::HINFO_CPU;
use doh_relay::dns::upstream::Upstream;

fn traditional(pattern: &str, upstream: &FakeUpstream, timeout: Duration) -> Upstream {
    Upstream::traditional(
        pattern,
        &upstream.address(),
        timeout,
        Arc::new(DnsNetworkClient::new()),
    )
    .unwrap()
}

fn first_a(packet: &DnsPacket) -> Ipv4Addr {
    match packet.answers.first() {
        Some(DnsRecord::A { addr, .. }) => *addr,
        other => panic!("expected an A record, got {:?}", other),
    }
}

#[test]
fn test_first_matching_upstream_owns_query() {
    let a = FakeUpstream::udp(answering(Ipv4Addr::new(192, 0, 2, 1), 300));
    let b = FakeUpstream::udp(answering(Ipv4Addr::new(192, 0, 2, 2), 300));

    let relay = Relay::new(
        vec![
            traditional("^foo\\.", &a, Duration::from_secs(2)),
            traditional(".*", &b, Duration::from_secs(2)),
        ],
        0,
    );

    let res = relay.resolve(&query("foo.com", QueryType::A)).unwrap();
    assert_eq!(first_a(&res), Ipv4Addr::new(192, 0, 2, 1));
    assert_eq!((a.hits(), b.hits()), (1, 0));

    let res = relay.resolve(&query("bar.com", QueryType::A)).unwrap();
    assert_eq!(first_a(&res), Ipv4Addr::new(192, 0, 2, 2));
    assert_eq!((a.hits(), b.hits()), (1, 1));

    // the pattern sees the fully qualified name
    let res = relay.resolve(&query("foo.", QueryType::A)).unwrap();
    assert_eq!(first_a(&res), Ipv4Addr::new(192, 0, 2, 1));
    assert_eq!((a.hits(), b.hits()), (2, 1));
}

#[test]
fn test_failing_owner_is_not_retried_elsewhere() {
    let a = FakeUpstream::udp(silent());
    let b = FakeUpstream::udp(answering(Ipv4Addr::new(192, 0, 2, 2), 300));

    let relay = Relay::new(
        vec![
            traditional("^foo\\.", &a, Duration::from_millis(300)),
            traditional(".*", &b, Duration::from_secs(2)),
        ],
        0,
    );

    match relay.resolve(&query("foo.com", QueryType::A)) {
        Err(RelayError::Upstream(_)) => {}
        other => panic!("expected an upstream error, got {:?}", other.map(|p| p.header)),
    }

    assert_eq!(a.hits(), 1);
    assert_eq!(b.hits(), 0);
}

#[test]
fn test_truncated_answer_is_retried_over_tcp() {
    let upstream = FakeUpstream::truncating(answering(Ipv4Addr::new(192, 0, 2, 9), 120));
    let relay = Relay::new(
        vec![traditional(".*", &upstream, Duration::from_secs(2))],
        0,
    );

    let res = relay.resolve(&query("big.example.org", QueryType::A)).unwrap();

    assert!(!res.header.truncated_message);
    assert_eq!(first_a(&res), Ipv4Addr::new(192, 0, 2, 9));
    assert_eq!(upstream.udp_hits(), 1);
    assert_eq!(upstream.tcp_hits(), 1);
}

#[test]
fn test_short_circuits_never_reach_upstreams() {
    let upstream = FakeUpstream::udp(answering(Ipv4Addr::new(192, 0, 2, 3), 300));
    let relay = Relay::new(
        vec![traditional(".*", &upstream, Duration::from_secs(2))],
        0,
    );

    let res = relay.resolve(&query("example.org", QueryType::Any)).unwrap();
    assert_eq!(res.answers.len(), 1);
    match &res.answers[0] {
        DnsRecord::Hinfo { cpu, .. } => assert_eq!(cpu, HINFO_CPU),
        other => panic!("expected HINFO, got {:?}", other),
    }

    let mut two = query("a.example.org", QueryType::A);
    two.questions
        .push(DnsQuestion::new("b.example.org".to_string(), QueryType::A));
    let res = relay.resolve(&two).unwrap();
    assert_eq!(res.header.rescode, ResultCode::FORMERR);
    assert_eq!(res.header.id, two.header.id);

    let mut none = query("a.example.org", QueryType::A);
    none.questions.clear();
    let res = relay.resolve(&none).unwrap();
    assert_eq!(res.header.rescode, ResultCode::FORMERR);

    assert_eq!(upstream.hits(), 0);
}

#[test]
fn test_ttl_ceiling_applies_to_relayed_answers() {
    let long = FakeUpstream::udp(answering(Ipv4Addr::new(192, 0, 2, 4), 500));
    let short = FakeUpstream::udp(answering(Ipv4Addr::new(192, 0, 2, 5), 50));

    let relay = Relay::new(
        vec![
            traditional("^long\\.", &long, Duration::from_secs(2)),
            traditional("^short\\.", &short, Duration::from_secs(2)),
        ],
        100,
    );

    let res = relay.resolve(&query("long.example", QueryType::A)).unwrap();
    assert_eq!(res.answers[0].get_ttl(), Some(100));

    let res = relay.resolve(&query("short.example", QueryType::A)).unwrap();
    assert_eq!(res.answers[0].get_ttl(), Some(50));

    match relay.resolve(&query("other.example", QueryType::A)) {
        Err(RelayError::NoUpstreamMatched { name }) => assert_eq!(name, "other.example."),
        other => panic!("expected no match, got {:?}", other.map(|p| p.header)),
    }
}
