use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("fake DNS record {0} missing")]
    FakeIpMissing(std::net::IpAddr),

    #[error("resolve {host}: {msg}")]
    Resolve { host: String, msg: String },

    #[error("rule parse: {0}")]
    RuleParse(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("invalid ip cidr: {0}")]
    InvalidIpCidr(String),

    #[error("provider {name}: {msg}")]
    Provider { name: String, msg: String },

    #[error("adapter {0} not found")]
    AdapterNotFound(String),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn provider(name: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Error::Provider {
            name: name.into(),
            msg: msg.to_string(),
        }
    }
}
