//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (connection, deadlock, constraint)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wallet not found
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Discrepancy not found
    #[error("Discrepancy not found: {0}")]
    DiscrepancyNotFound(i64),

    /// Transaction already finished
    #[error("Transaction closed")]
    TransactionClosed,

    /// Invariant violation (negative balance, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::TransactionClosed)
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
