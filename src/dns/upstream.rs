//! upstream resolvers the relay forwards to
//!
//! Each upstream owns a name pattern. The relay walks its upstreams in
//! configuration order and hands the query to the first whose pattern
//! matches the fully qualified question name.

use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use regex::Regex;

use crate::config::UpstreamConfig;
use crate::dns::client::{DnsClient, DnsNetworkClient};
use crate::dns::doh::{DohClient, DohClientConfig};
use crate::dns::protocol::DnsPacket;

/// Catch-all upstream appended after the configured ones
pub const DEFAULT_UPSTREAM_ADDRESS: &str = "https://dns.google/dns-query";
pub const DEFAULT_UPSTREAM_PATTERN: &str = ".*";
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Display, From, Error)]
pub enum UpstreamError {
    Client(crate::dns::client::ClientError),
    Doh(crate::dns::doh::DohError),
    Pattern(regex::Error),
    #[display(fmt = "invalid dns address {:?}, expected host:port", address)]
    #[from(ignore)]
    InvalidAddress { address: String },
}

type Result<T> = std::result::Result<T, UpstreamError>;

pub enum Upstream {
    /// Plain DNS over UDP, falling back to TCP for truncated answers
    Traditional {
        name_regex: Regex,
        address: String,
        timeout: Duration,
        client: Arc<dyn DnsClient + Send + Sync>,
    },
    DnsOverHttps {
        name_regex: Regex,
        client: DohClient,
    },
}

fn check_host_port(address: &str) -> Result<()> {
    let valid = match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };

    if !valid {
        return Err(UpstreamError::InvalidAddress {
            address: address.to_string(),
        });
    }

    Ok(())
}

impl Upstream {
    pub fn traditional(
        pattern: &str,
        address: &str,
        timeout: Duration,
        client: Arc<dyn DnsClient + Send + Sync>,
    ) -> Result<Upstream> {
        check_host_port(address)?;

        Ok(Upstream::Traditional {
            name_regex: Regex::new(pattern)?,
            address: address.to_string(),
            timeout,
            client,
        })
    }

    pub fn dns_over_https(
        pattern: &str,
        address: &str,
        config: &DohClientConfig,
    ) -> Result<Upstream> {
        let name_regex = Regex::new(pattern)?;

        Ok(Upstream::DnsOverHttps {
            name_regex,
            client: DohClient::new(address, config)?,
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Upstream> {
        if config.use_doh {
            let transport = &config.http_transport_config;
            let doh_config = DohClientConfig {
                max_conns_per_host: transport.max_conns_per_host,
                idle_conn_timeout: Duration::from_millis(transport.idle_conn_timeout_millis),
                timeout: config.timeout(),
            };

            Upstream::dns_over_https(&config.name_regex, &config.address, &doh_config)
        } else {
            Upstream::traditional(
                &config.name_regex,
                &config.address,
                config.timeout(),
                Arc::new(DnsNetworkClient::new()),
            )
        }
    }

    pub fn name_regex(&self) -> &Regex {
        match *self {
            Upstream::Traditional { ref name_regex, .. }
            | Upstream::DnsOverHttps { ref name_regex, .. } => name_regex,
        }
    }

    pub fn address(&self) -> String {
        match *self {
            Upstream::Traditional { ref address, .. } => address.clone(),
            Upstream::DnsOverHttps { ref client, .. } => client.server_url.to_string(),
        }
    }

    pub fn matches(&self, query: &DnsPacket) -> bool {
        query
            .questions
            .first()
            .map(|q| self.name_regex().is_match(&q.fqdn()))
            .unwrap_or(false)
    }

    /// Resolves `query` if the question name matches this upstream's
    /// pattern. Returns None without any network activity otherwise.
    pub fn resolve_if_matched(&self, query: &DnsPacket) -> Option<Result<DnsPacket>> {
        if !self.matches(query) {
            return None;
        }

        let result = match *self {
            Upstream::Traditional {
                ref address,
                timeout,
                ref client,
                ..
            } => client
                .exchange(query, address, timeout)
                .map_err(UpstreamError::from),
            Upstream::DnsOverHttps { ref client, .. } => {
                client.query(query).map_err(UpstreamError::from)
            }
        };

        Some(result)
    }
}

/// Builds the ordered upstream list from configuration. Entries that fail to
/// build are logged and skipped. The catch-all DoH upstream always comes last.
pub fn build_upstreams(configs: &[UpstreamConfig]) -> Result<Vec<Upstream>> {
    let mut upstreams = Vec::with_capacity(configs.len() + 1);

    for config in configs {
        match Upstream::from_config(config) {
            Ok(upstream) => {
                log::info!(
                    "upstream {} for names matching {:?}",
                    upstream.address(),
                    config.name_regex
                );
                upstreams.push(upstream);
            }
            Err(e) => {
                log::warn!(
                    "skipping upstream {:?} ({:?}): {}",
                    config.address,
                    config.name_regex,
                    e
                );
            }
        }
    }

    let default_config = DohClientConfig {
        timeout: DEFAULT_UPSTREAM_TIMEOUT,
        ..DohClientConfig::default()
    };
    upstreams.push(Upstream::dns_over_https(
        DEFAULT_UPSTREAM_PATTERN,
        DEFAULT_UPSTREAM_ADDRESS,
        &default_config,
    )?);

    Ok(upstreams)
}
