//! relay configuration
//!
//! Everything is read from a single YAML document. Every field has a default,
//! so an empty file (or no file at all) yields a plain HTTP relay on
//! 127.0.0.1:8080 that forwards everything to the public Google resolver.

use std::fs;
use std::path::Path;
use std::time::Duration;

use derive_more::{Display, Error, From};
use serde::Deserialize;

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    #[display(fmt = "both a cert path and a key path must be provided to configure TLS")]
    IncompleteTls,
    #[display(fmt = "{} {:?} is not a file", field, path)]
    #[from(ignore)]
    NotAFile { field: &'static str, path: String },
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ip_rate_limit: RateLimitConfig,
    pub development: DevelopmentConfig,
    pub upstream: UpstreamsConfig,
    pub caching: CachingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_cert_filepath: String,
    pub tls_key_filepath: String,
    #[serde(alias = "timeout_sec")]
    pub timeout_millis: TimeoutConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tls_cert_filepath: String::new(),
            tls_key_filepath: String::new(),
            timeout_millis: TimeoutConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        !self.tls_cert_filepath.is_empty()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long in-flight requests may take to drain once shutdown starts
    pub shutdown: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig { shutdown: 30000 }
    }
}

impl TimeoutConfig {
    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Comma separated keys that bypass the limiter
    pub key_whitelist: String,
    pub recover_x_tokens_per_sec: f64,
    pub max_tokens: f64,
    /// Take the client address from X-Forwarded-For / X-Real-IP
    pub fetch_ip_from_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: true,
            key_whitelist: String::new(),
            recover_x_tokens_per_sec: 5.0,
            max_tokens: 25.0,
            fetch_ip_from_headers: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevelopmentConfig {
    /// Error bodies carry only the status text when set
    pub terse_responses: bool,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        DevelopmentConfig {
            terse_responses: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamsConfig {
    pub custom_upstream: Vec<UpstreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub name_regex: String,
    pub use_doh: bool,
    /// An https URL for DoH upstreams, `host:port` otherwise
    pub address: String,
    /// Per attempt timeout in milliseconds
    pub timeout: u64,
    pub http_transport_config: HttpTransportConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            name_regex: String::new(),
            use_doh: true,
            address: String::new(),
            timeout: 5000,
            http_transport_config: HttpTransportConfig::default(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    pub max_conns_per_host: usize,
    pub idle_conn_timeout_millis: u64,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        HttpTransportConfig {
            max_conns_per_host: 3,
            idle_conn_timeout_millis: 30000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    /// Emit Cache-Control headers derived from record TTLs
    pub enable_http_caching: bool,
    /// Ceiling for record TTLs, 0 leaves them untouched
    pub ttl_override_max: u32,
}

fn ensure_file_exists(field: &'static str, path: &str) -> Result<()> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(ConfigError::NotAFile {
            field,
            path: path.to_string(),
        });
    }

    Ok(())
}

impl Config {
    pub fn from_yaml(data: &str) -> Result<Config> {
        // an empty document deserializes to null rather than an empty map
        if data.trim().is_empty() {
            return Ok(Config::default());
        }

        Ok(serde_yaml::from_str(data)?)
    }

    /// Reads and validates the config file at `path`, or returns the
    /// defaults when no path is given.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Config> {
        let config = match path {
            Some(path) => {
                log::debug!("reading configuration from {}", path.as_ref().display());
                Config::from_yaml(&fs::read_to_string(path)?)?
            }
            None => Config::default(),
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.tls_cert_filepath.is_empty() != server.tls_key_filepath.is_empty() {
            return Err(ConfigError::IncompleteTls);
        }

        if !server.tls_cert_filepath.is_empty() {
            ensure_file_exists("tls_cert_filepath", &server.tls_cert_filepath)?;
        }

        if !server.tls_key_filepath.is_empty() {
            ensure_file_exists("tls_key_filepath", &server.tls_key_filepath)?;
        }

        Ok(())
    }
}
