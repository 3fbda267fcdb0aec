//! minimal responses to ANY queries, RFC 8482 section 4.2

use crate::dns::protocol::{DnsPacket, DnsRecord, QueryType, TransientTtl};

pub const HINFO_CPU: &str = "RFC8482";
pub const HINFO_TTL: u32 = 3600;

pub fn is_any_query(packet: &DnsPacket) -> bool {
    packet
        .questions
        .first()
        .map(|q| q.qtype == QueryType::Any)
        .unwrap_or(false)
}

/// Answers `query` with a single synthesized HINFO record instead of
/// enumerating every record of the name.
pub fn any_response(query: &DnsPacket) -> DnsPacket {
    let mut reply = DnsPacket::reply_to(query);

    if let Some(question) = query.questions.first() {
        reply.answers.push(DnsRecord::Hinfo {
            domain: question.name.clone(),
            cpu: HINFO_CPU.to_string(),
            os: String::new(),
            ttl: TransientTtl(HINFO_TTL),
        });
    }

    reply
}
