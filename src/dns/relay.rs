//! the relay engine: protocol mandated short circuits, upstream dispatch and
//! TTL capping

use derive_more::{Display, Error, From};

use crate::dns::protocol::{DnsPacket, ResultCode};
use crate::dns::rfc8482;
use crate::dns::ttl;
use crate::dns::upstream::{Upstream, UpstreamError};

#[derive(Debug, Display, From, Error)]
pub enum RelayError {
    #[display(fmt = "no upstream matched {:?}", name)]
    #[from(ignore)]
    NoUpstreamMatched { name: String },
    Upstream(UpstreamError),
}

type Result<T> = std::result::Result<T, RelayError>;

pub struct Relay {
    upstreams: Vec<Upstream>,
    /// Record TTLs at or above this value are lowered to it
    ttl_ceiling: Option<u32>,
}

impl Relay {
    /// `ttl_ceiling` of 0 disables TTL capping.
    pub fn new(upstreams: Vec<Upstream>, ttl_ceiling: u32) -> Relay {
        Relay {
            upstreams,
            ttl_ceiling: if ttl_ceiling > 0 {
                Some(ttl_ceiling)
            } else {
                None
            },
        }
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    pub fn resolve(&self, query: &DnsPacket) -> Result<DnsPacket> {
        if query.questions.len() != 1 {
            log::debug!(
                "refusing query {} with {} questions",
                query.header.id,
                query.questions.len()
            );

            let mut reply = DnsPacket::reply_to(query);
            reply.header.rescode = ResultCode::FORMERR;
            return Ok(reply);
        }

        if rfc8482::is_any_query(query) {
            return Ok(rfc8482::any_response(query));
        }

        let mut response = self.dispatch(query)?;

        if let Some(ceiling) = self.ttl_ceiling {
            ttl::clamp_ttls(&mut response, ceiling);
        }

        Ok(response)
    }

    /// The first matching upstream owns the query; its failure is final.
    fn dispatch(&self, query: &DnsPacket) -> Result<DnsPacket> {
        for upstream in &self.upstreams {
            if let Some(result) = upstream.resolve_if_matched(query) {
                return result.map_err(|e| {
                    log::warn!(
                        "upstream {} failed for {}: {}",
                        upstream.address(),
                        query.questions[0].fqdn(),
                        e
                    );
                    RelayError::Upstream(e)
                });
            }
        }

        Err(RelayError::NoUpstreamMatched {
            name: query.questions[0].fqdn(),
        })
    }
}
