//! DNS-over-HTTPS (DoH) client side
//!
//! Forwards queries to an RFC 8484 endpoint using the GET form, with the
//! message carried base64url encoded in the `dns` query parameter.

use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use parking_lot::{Condvar, Mutex};
use url::Url;

use crate::dns::protocol::DnsPacket;

/// DoH Content Types
pub const DOH_CONTENT_TYPE_MESSAGE: &str = "application/dns-message";

#[derive(Debug, Display, From, Error)]
pub enum DohError {
    Http(reqwest::Error),
    Protocol(crate::dns::protocol::ProtocolError),
    #[display(fmt = "invalid doh address {:?}: {}", address, reason)]
    #[from(ignore)]
    InvalidAddress { address: String, reason: String },
    #[display(fmt = "upstream answered with http status {}", status)]
    #[from(ignore)]
    Status { status: u16 },
    #[display(fmt = "response id {} does not match query id {}", actual, expected)]
    #[from(ignore)]
    IdMismatch { expected: u16, actual: u16 },
    #[display(fmt = "all {} connections busy for {:?}", limit, waited)]
    #[from(ignore)]
    ConnectionsExhausted { limit: usize, waited: Duration },
}

type Result<T> = std::result::Result<T, DohError>;

/// Encodes a wire format message the way RFC 8484 GET requests carry it
pub fn encode_message(data: &[u8]) -> String {
    base64::encode_config(data, base64::URL_SAFE_NO_PAD)
}

/// Decodes the `dns` parameter of a GET request. Padding is not part of the
/// encoding and is refused.
pub fn decode_message(encoded: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    if let Some(pos) = encoded.find('=') {
        return Err(base64::DecodeError::InvalidByte(pos, b'='));
    }

    base64::decode_config(encoded, base64::URL_SAFE_NO_PAD)
}

/// Connection pool tuning for a DoH upstream
#[derive(Debug, Clone)]
pub struct DohClientConfig {
    /// Requests in flight per upstream host, zero for no limit. Also the
    /// number of idle connections kept.
    pub max_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    /// Bound on a complete request, connect to last body byte
    pub timeout: Duration,
}

impl Default for DohClientConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 3,
            idle_conn_timeout: Duration::from_millis(30000),
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Parses and checks an upstream address. Only absolute https URLs are
/// accepted.
pub fn parse_address(address: &str) -> Result<Url> {
    let url = Url::parse(address).map_err(|e| DohError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "https" {
        return Err(DohError::InvalidAddress {
            address: address.to_string(),
            reason: format!("scheme must be https, got {}", url.scheme()),
        });
    }

    if url.host_str().is_none() {
        return Err(DohError::InvalidAddress {
            address: address.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

/// Validates an upstream answer: HTTP 200, a parseable body and the
/// transaction id of the query.
pub fn check_response(status: u16, body: &[u8], expected_id: u16) -> Result<DnsPacket> {
    if status != 200 {
        return Err(DohError::Status { status });
    }

    let packet = DnsPacket::from_bytes(body)?;
    if packet.header.id != expected_id {
        return Err(DohError::IdMismatch {
            expected: expected_id,
            actual: packet.header.id,
        });
    }

    Ok(packet)
}

/// Caps the requests in flight to one upstream. A blocking request holds
/// its connection for its whole duration, so this bounds connections too.
pub struct ConnectionLimit {
    limit: usize,
    in_flight: Mutex<usize>,
    released: Condvar,
}

/// Held while a request is in flight
pub struct ConnectionPermit<'a> {
    owner: &'a ConnectionLimit,
}

impl ConnectionLimit {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    /// Waits at most `timeout` for a free slot
    pub fn acquire(&self, timeout: Duration) -> Result<ConnectionPermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.in_flight.lock();

        while self.limit > 0 && *in_flight >= self.limit {
            if self.released.wait_until(&mut in_flight, deadline).timed_out()
                && *in_flight >= self.limit
            {
                return Err(DohError::ConnectionsExhausted {
                    limit: self.limit,
                    waited: timeout,
                });
            }
        }

        *in_flight += 1;
        Ok(ConnectionPermit { owner: self })
    }
}

impl<'a> Drop for ConnectionPermit<'a> {
    fn drop(&mut self) {
        let mut in_flight = self.owner.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        self.owner.released.notify_one();
    }
}

/// Builds the GET request for `packet` against `server_url`
pub fn build_get_url(server_url: &Url, packet: &DnsPacket) -> Result<Url> {
    let mut packet = packet.clone();
    let query_bytes = packet.to_bytes()?;

    let mut url = server_url.clone();
    url.query_pairs_mut()
        .append_pair("dns", &encode_message(&query_bytes));

    Ok(url)
}

/// Long lived client for a single DoH upstream
///
/// The underlying connection pool is shared by every request thread.
pub struct DohClient {
    /// DoH server URL
    pub server_url: Url,
    /// HTTP client
    client: reqwest::blocking::Client,
    connections: ConnectionLimit,
    timeout: Duration,
}

impl DohClient {
    /// Create a new DoH client
    pub fn new(server_url: &str, config: &DohClientConfig) -> Result<Self> {
        let server_url = parse_address(server_url)?;

        let client = reqwest::blocking::Client::builder()
            .pool_max_idle_per_host(config.max_conns_per_host)
            .pool_idle_timeout(config.idle_conn_timeout)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            server_url,
            client,
            connections: ConnectionLimit::new(config.max_conns_per_host),
            timeout: config.timeout,
        })
    }

    /// Builds the request `query` sends, without sending it
    pub fn build_request(&self, packet: &DnsPacket) -> Result<reqwest::blocking::Request> {
        let url = build_get_url(&self.server_url, packet)?;

        Ok(self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, DOH_CONTENT_TYPE_MESSAGE)
            .build()?)
    }

    /// Query DNS over HTTPS using GET method
    pub fn query(&self, packet: &DnsPacket) -> Result<DnsPacket> {
        let request = self.build_request(packet)?;

        let _permit = self.connections.acquire(self.timeout)?;
        let response = self.client.execute(request)?;

        let status = response.status().as_u16();
        let body = response.bytes()?;

        check_response(status, &body, packet.header.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsQuestion, QueryType};
    use std::sync::Arc;
    use std::thread;

    fn response_bytes(id: u16) -> Vec<u8> {
        let mut packet = DnsPacket::new();
        packet.header.id = id;
        packet.header.response = true;
        packet
            .questions
            .push(DnsQuestion::new("example.com".to_string(), QueryType::A));
        packet.to_bytes().unwrap()
    }

    #[test]
    fn test_base64url_encoding() {
        // query for www.example.com from RFC 8484 section 4.1.1
        let encoded = "AAABAAABAAAAAAAAA3d3dwdleGFtcGxlA2NvbQAAAQAB";
        let decoded = decode_message(encoded).unwrap();
        assert_eq!(encode_message(&decoded), encoded);

        let packet = DnsPacket::from_bytes(&decoded).unwrap();
        assert_eq!(packet.questions[0].name, "www.example.com");
        assert_eq!(packet.questions[0].qtype, QueryType::A);
    }

    #[test]
    fn test_padding_is_rejected() {
        assert!(decode_message("AAE=").is_err());
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("https://dns.google/dns-query").is_ok());
        assert!(parse_address("http://dns.google/dns-query").is_err());
        assert!(parse_address("dns.google/dns-query").is_err());
        assert!(parse_address("8.8.8.8:53").is_err());
    }

    #[test]
    fn test_check_response() {
        let body = response_bytes(99);

        assert!(check_response(200, &body, 99).is_ok());
        assert!(matches!(
            check_response(502, &body, 99),
            Err(DohError::Status { status: 502 })
        ));
        assert!(matches!(
            check_response(200, &body, 100),
            Err(DohError::IdMismatch {
                expected: 100,
                actual: 99
            })
        ));
        assert!(matches!(
            check_response(200, &[0, 1, 2], 99),
            Err(DohError::Protocol(_))
        ));
    }

    #[test]
    fn test_get_request_layout() {
        let client = DohClient::new(
            "https://dns.example/dns-query?ct=1",
            &DohClientConfig::default(),
        )
        .unwrap();

        let mut query = DnsPacket::new();
        query.header.id = 0;
        query.header.recursion_desired = true;
        query
            .questions
            .push(DnsQuestion::new("www.example.com".to_string(), QueryType::A));

        let request = client.build_request(&query).unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(
            request.url().as_str(),
            "https://dns.example/dns-query?ct=1&dns=AAABAAABAAAAAAAAA3d3dwdleGFtcGxlA2NvbQAAAQAB"
        );
        assert_eq!(
            request.headers().get(reqwest::header::ACCEPT).unwrap(),
            DOH_CONTENT_TYPE_MESSAGE
        );
    }

    #[test]
    fn test_unreachable_upstream_is_http_error() {
        // nothing listens on the discard port
        let client = DohClient::new(
            "https://127.0.0.1:9/dns-query",
            &DohClientConfig {
                timeout: Duration::from_millis(500),
                ..DohClientConfig::default()
            },
        )
        .unwrap();

        let mut query = DnsPacket::new();
        query
            .questions
            .push(DnsQuestion::new("example.com".to_string(), QueryType::A));

        assert!(matches!(client.query(&query), Err(DohError::Http(_))));
        assert_eq!(client.connections.in_flight(), 0);
    }

    #[test]
    fn test_connection_limit_blocks_extra_request() {
        let limit = Arc::new(ConnectionLimit::new(2));
        let first = limit.acquire(Duration::from_millis(10)).unwrap();
        let _second = limit.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(limit.in_flight(), 2);

        let started = Instant::now();
        assert!(matches!(
            limit.acquire(Duration::from_millis(100)),
            Err(DohError::ConnectionsExhausted { limit: 2, .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(100));

        let waiter = {
            let limit = limit.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let _permit = limit.acquire(Duration::from_secs(5)).unwrap();
                started.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(150));
        drop(first);

        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(5));
        assert_eq!(limit.in_flight(), 1);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let limit = ConnectionLimit::new(0);
        let permits: Vec<_> = (0..16)
            .map(|_| limit.acquire(Duration::from_millis(1)).unwrap())
            .collect();
        assert_eq!(limit.in_flight(), 16);
        drop(permits);
        assert_eq!(limit.in_flight(), 0);
    }

    #[test]
    fn test_client_rejects_plain_http() {
        let res = DohClient::new("http://127.0.0.1/dns-query", &DohClientConfig::default());
        assert!(matches!(res, Err(DohError::InvalidAddress { .. })));
    }
}
