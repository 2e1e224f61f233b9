//! Error types for parsing persisted tags and codes in uplink-types.

use thiserror::Error;

/// Errors that can occur when decoding a stored status code or kind tag.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The integer code does not name an upload status.
    #[error("Invalid upload status code: {0}")]
    InvalidStatus(i64),

    /// The tag does not name a data kind.
    #[error("Unknown data kind: {0}")]
    UnknownDataKind(String),

    /// The tag does not name a network kind.
    #[error("Unknown network kind: {0}")]
    UnknownNetworkKind(String),
}

/// Result type alias using uplink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
