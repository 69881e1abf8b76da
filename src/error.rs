use std::io;
use thiserror::Error;

/// Unified error type for the forwarding engine
#[derive(Error, Debug)]
pub enum ForwardError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Local port could not be claimed
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Upstream address could not be resolved
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// Rule collides with the reserved administration port
    #[error("Port {0}/tcp is reserved for administration")]
    ReservedPort(u16),

    /// Another runtime already owns the rule key
    #[error("Rule already active: {0}")]
    RuleActive(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage collaborator error
    #[error("Store error: {0}")]
    Store(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result alias
pub type Result<T> = std::result::Result<T, ForwardError>;

impl From<anyhow::Error> for ForwardError {
    fn from(err: anyhow::Error) -> Self {
        ForwardError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for ForwardError {
    fn from(err: toml::de::Error) -> Self {
        ForwardError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ForwardError {
    fn from(err: toml::ser::Error) -> Self {
        ForwardError::Store(format!("TOML encode error: {}", err))
    }
}
