pub mod buffer;

pub mod client;

pub mod doh;

pub mod protocol;

pub mod rate_limit;

pub mod relay;

pub mod rfc8482;

pub mod shutdown;

pub mod ttl;

pub mod upstream;

mod netutil;
