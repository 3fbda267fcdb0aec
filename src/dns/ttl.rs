//! cacheability of relayed responses
//!
//! Negative answers follow RFC 2308 section 5: their lifetime is the smaller
//! of the SOA record's own TTL and its MINIMUM field. Positive answers live
//! as long as their shortest lived record.

use crate::dns::protocol::{DnsPacket, DnsRecord, ResultCode, TransientTtl};

/// NXDOMAIN, or NODATA (NOERROR with an empty answer section)
pub fn is_negative_response(packet: &DnsPacket) -> bool {
    if !packet.header.response {
        return false;
    }

    match packet.header.rescode {
        ResultCode::NXDOMAIN => true,
        ResultCode::NOERROR => packet.answers.is_empty(),
        _ => false,
    }
}

/// TTL of a negative answer, taken from the first SOA of the authority
/// section. Without an SOA the answer must not be cached.
pub fn negative_ttl(packet: &DnsPacket) -> u32 {
    for auth in &packet.authorities {
        if let DnsRecord::Soa {
            minimum,
            ttl: TransientTtl(ttl),
            ..
        } = *auth
        {
            return ttl.min(minimum);
        }
    }

    0
}

/// Number of seconds the whole response may be cached, 0 meaning not at all.
pub fn overall_ttl(packet: Option<&DnsPacket>) -> u32 {
    let packet = match packet {
        Some(packet) => packet,
        None => return 0,
    };

    if !packet.header.response || packet.header.truncated_message {
        return 0;
    }

    if is_negative_response(packet) {
        return negative_ttl(packet);
    }

    match packet.header.rescode {
        ResultCode::NOERROR => packet
            .records()
            .filter_map(DnsRecord::get_ttl)
            .min()
            .unwrap_or(0),
        _ => 0,
    }
}

/// Lowers every record TTL at or above `ceiling` to exactly `ceiling`.
pub fn clamp_ttls(packet: &mut DnsPacket, ceiling: u32) {
    for record in packet.records_mut() {
        if let Some(ttl) = record.get_ttl() {
            if ttl >= ceiling {
                record.set_ttl(ceiling);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsQuestion, QueryType};
    use std::net::Ipv4Addr;

    fn a(ttl: u32) -> DnsRecord {
        DnsRecord::A {
            domain: "example.com".to_string(),
            addr: Ipv4Addr::new(127, 0, 0, 1),
            ttl: TransientTtl(ttl),
        }
    }

    fn soa(ttl: u32, minimum: u32) -> DnsRecord {
        DnsRecord::Soa {
            domain: "example.com".to_string(),
            m_name: "ns1.example.com".to_string(),
            r_name: "hostmaster.example.com".to_string(),
            serial: 2024010101,
            refresh: 7200,
            retry: 3600,
            expire: 1209600,
            minimum,
            ttl: TransientTtl(ttl),
        }
    }

    fn response(rescode: ResultCode) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.response = true;
        packet.header.rescode = rescode;
        packet
            .questions
            .push(DnsQuestion::new("example.com".to_string(), QueryType::A));
        packet
    }

    #[test]
    fn test_positive_answer_uses_smallest_ttl() {
        let mut packet = response(ResultCode::NOERROR);
        packet.answers.push(a(300));
        packet.authorities.push(a(60));
        packet.resources.push(a(900));

        assert_eq!(overall_ttl(Some(&packet)), 60);
    }

    #[test]
    fn test_edns_record_is_not_a_ttl() {
        let mut packet = response(ResultCode::NOERROR);
        packet.answers.push(a(300));
        packet.resources.push(DnsRecord::Opt {
            packet_len: 1232,
            flags: 0,
            data: Vec::new(),
        });

        assert_eq!(overall_ttl(Some(&packet)), 300);
    }

    #[test]
    fn test_nxdomain_uses_soa() {
        let mut packet = response(ResultCode::NXDOMAIN);
        packet.authorities.push(soa(50, 10));
        assert!(is_negative_response(&packet));
        assert_eq!(overall_ttl(Some(&packet)), 10);

        let mut packet = response(ResultCode::NXDOMAIN);
        packet.authorities.push(soa(5, 10));
        assert_eq!(negative_ttl(&packet), 5);
    }

    #[test]
    fn test_nxdomain_without_soa() {
        let packet = response(ResultCode::NXDOMAIN);
        assert_eq!(overall_ttl(Some(&packet)), 0);
    }

    #[test]
    fn test_nodata_is_negative() {
        let mut packet = response(ResultCode::NOERROR);
        packet.authorities.push(soa(3600, 900));
        assert!(is_negative_response(&packet));
        assert_eq!(overall_ttl(Some(&packet)), 900);
    }

    #[test]
    fn test_uncacheable_responses() {
        assert_eq!(overall_ttl(None), 0);

        let mut query = response(ResultCode::NOERROR);
        query.header.response = false;
        query.answers.push(a(300));
        assert!(!is_negative_response(&query));
        assert_eq!(overall_ttl(Some(&query)), 0);

        let mut truncated = response(ResultCode::NOERROR);
        truncated.header.truncated_message = true;
        truncated.answers.push(a(300));
        assert_eq!(overall_ttl(Some(&truncated)), 0);

        let mut servfail = response(ResultCode::SERVFAIL);
        servfail.answers.push(a(300));
        assert_eq!(overall_ttl(Some(&servfail)), 0);
    }

    #[test]
    fn test_clamp_ttls() {
        let mut packet = response(ResultCode::NOERROR);
        packet.answers.push(a(500));
        packet.answers.push(a(50));
        packet.authorities.push(a(100));
        packet.resources.push(DnsRecord::Opt {
            packet_len: 4096,
            flags: 0x8000,
            data: Vec::new(),
        });

        clamp_ttls(&mut packet, 100);

        assert_eq!(packet.answers[0].get_ttl(), Some(100));
        assert_eq!(packet.answers[1].get_ttl(), Some(50));
        assert_eq!(packet.authorities[0].get_ttl(), Some(100));
        match packet.resources[0] {
            DnsRecord::Opt { flags, .. } => assert_eq!(flags, 0x8000),
            _ => panic!(),
        }
    }
}
