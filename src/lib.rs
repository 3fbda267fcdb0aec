//! DoH Relay
//!
//! A DNS-over-HTTPS relay. Queries arrive over HTTP(S) as described in
//! RFC 8484 and are forwarded to the first configured upstream whose name
//! pattern matches the question, either over plain DNS or over another DoH
//! endpoint.
//!
//! # Features
//!
//! * GET and POST forms of RFC 8484
//! * Pattern based upstream selection, plain DNS (UDP with TCP fallback) or DoH
//! * RFC 8482 minimal answers to ANY queries
//! * Cache-Control hints derived from record TTLs, RFC 2308 aware
//! * Per client token bucket rate limiting with a key whitelist
//!
//! # Architecture
//!
//! * `dns` - wire format, upstream transports and the relay engine
//! * `web` - request routing and the HTTP listener
//! * `config` - YAML configuration

/// Relay configuration
pub mod config;

/// DNS protocol handling and the relay engine
pub mod dns;

/// HTTP front end
pub mod web;
