//! Property-based tests for the GET encoding and TTL handling using proptest

use doh_relay::dns::doh::{decode_message, encode_message};
use doh_relay::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, TransientTtl};
use doh_relay::dns::ttl;
use proptest::prelude::*;
use std::net::Ipv4Addr;

// Strategy for generating valid domain names, mixed case kept as is
fn domain_name_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-zA-Z][a-zA-Z0-9-]{0,20}[a-zA-Z0-9]?", 1..5)
        .prop_map(|parts| parts.join("."))
}

fn a_record(domain: &str, ttl: u32) -> DnsRecord {
    DnsRecord::A {
        domain: domain.to_string(),
        addr: Ipv4Addr::new(192, 0, 2, 1),
        ttl: TransientTtl(ttl),
    }
}

proptest! {
    #[test]
    fn test_query_survives_get_encoding(
        id in any::<u16>(),
        name in domain_name_strategy(),
        qtype in any::<u16>(),
        qclass in any::<u16>(),
        rd in any::<bool>()
    ) {
        let mut query = DnsPacket::new();
        query.header.id = id;
        query.header.recursion_desired = rd;
        let mut question = DnsQuestion::new(name.clone(), QueryType::from_num(qtype));
        question.qclass = qclass;
        query.questions.push(question);

        let encoded = encode_message(&query.to_bytes().unwrap());
        prop_assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        let decoded = DnsPacket::from_bytes(&decode_message(&encoded).unwrap()).unwrap();
        prop_assert_eq!(decoded.header.id, id);
        prop_assert_eq!(decoded.header.recursion_desired, rd);
        prop_assert_eq!(decoded.questions.len(), 1);
        prop_assert_eq!(&decoded.questions[0].name, &name);
        prop_assert_eq!(decoded.questions[0].qtype.to_num(), qtype);
        prop_assert_eq!(decoded.questions[0].qclass, qclass);
    }

    #[test]
    fn test_overall_ttl_is_minimum(ttls in prop::collection::vec(any::<u32>(), 1..8)) {
        let mut query = DnsPacket::new();
        query.questions.push(DnsQuestion::new("example.com".to_string(), QueryType::A));

        let mut response = DnsPacket::reply_to(&query);
        for ttl in &ttls {
            response.answers.push(a_record("example.com", *ttl));
        }

        prop_assert_eq!(ttl::overall_ttl(Some(&response)), *ttls.iter().min().unwrap());
    }

    #[test]
    fn test_clamp_never_exceeds_ceiling(
        ttls in prop::collection::vec(any::<u32>(), 1..8),
        ceiling in 1..u32::MAX
    ) {
        let mut response = DnsPacket::new();
        response.header.response = true;
        for ttl in &ttls {
            response.answers.push(a_record("example.com", *ttl));
        }

        ttl::clamp_ttls(&mut response, ceiling);

        for (record, original) in response.answers.iter().zip(&ttls) {
            let ttl = record.get_ttl().unwrap();
            prop_assert!(ttl <= ceiling);
            if *original < ceiling {
                prop_assert_eq!(ttl, *original);
            }
        }
    }
}
