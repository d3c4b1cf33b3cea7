//! Error types for the settlement pipeline

use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Message bus error
    #[error("Message bus error: {0}")]
    Bus(#[from] message_bus::Error),

    /// Negative reward, balance mismatch and similar
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Processing deadline exceeded
    #[error("Processing timed out after {0}ms")]
    Timeout(u64),

    /// Internal work queue full
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Ledger(e) => e.is_transient(),
            Error::Bus(e) => e.is_transient(),
            Error::Timeout(_) | Error::QueueFull(_) => true,
            Error::InvariantViolation(_) => true,
            _ => false,
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout(30_000).is_retryable());
        assert!(Error::Ledger(ledger_core::Error::Storage("deadlock".into())).is_retryable());
        assert!(Error::Bus(message_bus::Error::Connection("down".into())).is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
        assert!(!Error::from("boom").is_retryable());
    }
}
