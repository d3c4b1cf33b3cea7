//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted on a closed session or connection
    #[error("Session closed: {0}")]
    Closed(String),

    /// Client has been shut down
    #[error("Client is shut down")]
    Shutdown,

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Consume error
    #[error("Consume error: {0}")]
    Consume(String),

    /// Acknowledgment error
    #[error("Ack error: {0}")]
    Ack(String),

    /// Topology declaration error
    #[error("Topology error: {0}")]
    Topology(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// NATS error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Timeout
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the operation after a reconnect may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Closed(_) | Error::Nats(_) | Error::Timeout(_)
        )
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
