//! RFC 8484 request handling
//!
//! The router works on plain request and response values rather than on
//! tiny_http types, which keeps every status code path testable without a
//! socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::Config;
use crate::dns::doh::{decode_message, DOH_CONTENT_TYPE_MESSAGE};
use crate::dns::protocol::{DnsPacket, MAX_MESSAGE_SIZE};
use crate::dns::rate_limit::RateLimiter;
use crate::dns::relay::Relay;
use crate::dns::ttl;

pub const DOH_PATH: &str = "/dns-query";

/// An HTTP request as seen by the router
#[derive(Debug, Clone, Default)]
pub struct DohRequest {
    pub method: String,
    /// Path plus optional query string
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub peer: Option<SocketAddr>,
    pub body: Vec<u8>,
}

impl DohRequest {
    /// First value of the named header, compared case insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn path(&self) -> &str {
        match self.url.split_once('?') {
            Some((path, _)) => path,
            None => &self.url,
        }
    }

    /// First value of the named query parameter, percent decoded
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.url.split_once('?')?.1;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl DohResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub fn status_text(status: u16) -> &'static str {
    tiny_http::StatusCode(status).default_reason_phrase()
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Error bodies carry only the status text
    pub terse_responses: bool,
    /// Emit Cache-Control from the response TTL
    pub http_caching: bool,
    /// Identify clients by X-Forwarded-For / X-Real-IP
    pub trust_forwarded_headers: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        RouterOptions {
            terse_responses: true,
            http_caching: false,
            trust_forwarded_headers: false,
        }
    }
}

impl RouterOptions {
    pub fn from_config(config: &Config) -> RouterOptions {
        RouterOptions {
            terse_responses: config.development.terse_responses,
            http_caching: config.caching.enable_http_caching,
            trust_forwarded_headers: config.ip_rate_limit.fetch_ip_from_headers,
        }
    }
}

/// Last entry of a comma separated header, if it is an IP address
fn last_ip(value: Option<&str>) -> Option<String> {
    let last = value?.trim_matches(',').rsplit(',').next()?.trim();
    last.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

pub struct Router {
    relay: Arc<Relay>,
    limiter: Arc<RateLimiter>,
    options: RouterOptions,
}

impl Router {
    pub fn new(relay: Arc<Relay>, limiter: Arc<RateLimiter>, options: RouterOptions) -> Router {
        Router {
            relay,
            limiter,
            options,
        }
    }

    /// Address the rate limiter keys on
    pub fn client_identity(&self, request: &DohRequest) -> String {
        if self.options.trust_forwarded_headers {
            if let Some(ip) = last_ip(request.header("X-Forwarded-For")) {
                return ip;
            }
            if let Some(ip) = last_ip(request.header("X-Real-IP")) {
                return ip;
            }
        }

        match request.peer {
            Some(peer) => peer.ip().to_string(),
            None => String::new(),
        }
    }

    fn error(&self, status: u16, detail: &str) -> DohResponse {
        let text = status_text(status);
        let body = if self.options.terse_responses {
            text.to_string()
        } else {
            format!("{}: {}", text, detail)
        };

        DohResponse {
            status,
            headers: vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.into_bytes(),
        }
    }

    fn client_error(&self, status: u16, detail: &str) -> DohResponse {
        log::debug!("rejecting request with {}: {}", status, detail);
        self.error(status, detail)
    }

    fn extract_message(&self, request: &DohRequest) -> Result<Vec<u8>, DohResponse> {
        let data = if request.method == "GET" {
            let encoded = request.query_param("dns").unwrap_or_default();
            if encoded.is_empty() {
                return Err(self.client_error(400, "missing dns query parameter"));
            }

            decode_message(&encoded).map_err(|e| {
                self.client_error(400, &format!("invalid base64url dns parameter: {}", e))
            })?
        } else {
            request.body.clone()
        };

        if data.len() > MAX_MESSAGE_SIZE {
            return Err(self.client_error(400, "dns message too large"));
        }

        Ok(data)
    }

    pub fn handle(&self, request: &DohRequest) -> DohResponse {
        if request.path() != DOH_PATH {
            return self.client_error(404, &format!("no handler for {}", request.path()));
        }

        let client = self.client_identity(request);
        let token = request.query_param("token");
        if !self.limiter.admit(&client, token.as_deref()) {
            return self.client_error(429, &format!("rate limit exceeded for {}", client));
        }

        if request.method != "GET" && request.method != "POST" {
            return self.client_error(405, &format!("method {} not allowed", request.method));
        }

        if request.method == "POST" && request.header("Content-Type") != Some(DOH_CONTENT_TYPE_MESSAGE)
        {
            return self.client_error(
                415,
                &format!("content type must be {}", DOH_CONTENT_TYPE_MESSAGE),
            );
        }

        let data = match self.extract_message(request) {
            Ok(data) => data,
            Err(response) => return response,
        };

        let query = match DnsPacket::from_bytes(&data) {
            Ok(query) => query,
            Err(e) => return self.client_error(400, &format!("malformed dns message: {}", e)),
        };

        let mut response = match self.relay.resolve(&query) {
            Ok(response) => response,
            Err(e) => return self.error(500, &e.to_string()),
        };

        let body = match response.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                log::warn!("failed to pack response {}: {}", response.header.id, e);
                return self.error(500, &format!("failed to pack response: {}", e));
            }
        };

        let mut headers = vec![(
            "Content-Type".to_string(),
            DOH_CONTENT_TYPE_MESSAGE.to_string(),
        )];

        if self.options.http_caching {
            let max_age = ttl::overall_ttl(Some(&response));
            if max_age > 0 {
                headers.push(("Cache-Control".to_string(), format!("max-age={}", max_age)));
            }
        }

        DohResponse {
            status: 200,
            headers,
            body,
        }
    }
}
