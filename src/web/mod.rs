use derive_more::{Display, Error, From};

pub mod router;
pub mod server;

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Config(crate::config::ConfigError),
    Upstream(crate::dns::upstream::UpstreamError),
    Shutdown(crate::dns::shutdown::ShutdownError),
    Io(std::io::Error),
    #[display(fmt = "failed to bind {}: {}", addr, reason)]
    #[from(ignore)]
    Bind { addr: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ServerError>;
