//! Error types for uplink-store.

use std::path::PathBuf;

use uplink_types::ParseError;

/// Result type for uplink-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in uplink-store.
///
/// Every storage fault surfaces here; callers decide whether to retry or
/// abort the enclosing operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A stored tag or status code could not be decoded.
    #[error("Invalid stored value: {0}")]
    Parse(#[from] ParseError),

    /// Upload batch not found.
    #[error("Upload batch not found: {0}")]
    BatchNotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
