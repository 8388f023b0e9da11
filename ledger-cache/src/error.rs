//! Error types for the ledger cache
//!
//! Business outcomes (insufficient funds, ceilings, self-transfer, vetoes)
//! are typed results in [`crate::types`], never errors. This enum covers
//! faults only: backend I/O, malformed data, configuration and shutdown.

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB, file layout, missing column family)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding error (flat-file backend)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Network database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Backend could not be reached or initialized
    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Concurrency error (writer mailbox closed, task join failure)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// The ledger has been shut down
    #[error("Ledger is closed")]
    Closed,

    /// Bounded operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Concurrency(err.to_string())
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
