use thiserror::Error;

/// Errors surfaced by a market connector
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("not connected")]
    NotConnected,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("pacing violation: {0}")]
    Pacing(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ConnectorError {
    /// Pacing/throttling responses double the limiter delay instead of x1.5
    pub fn is_pacing(&self) -> bool {
        match self {
            ConnectorError::Pacing(_) => true,
            other => is_pacing_message(&other.to_string()),
        }
    }
}

/// Case-insensitive "pacing" / "throttl" check
pub fn is_pacing_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("pacing") || lower.contains("throttl")
}

/// Crate error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
