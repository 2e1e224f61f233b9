//! Error types for uplink-core.
//!
//! # Error Classification
//!
//! | Error | Effect on an upload run |
//! |-------|-------------------------|
//! | [`Error::Storage`] | Ends the run with `Failure`; retried at the next scheduled run |
//! | [`Error::Network`] | Group marked failed, retry count incremented |
//! | [`Error::Timeout`] | Group marked failed, retry count incremented |
//! | [`Error::Api`] | Group marked failed, retry count incremented |
//! | [`Error::Serialization`] | Group marked failed, retry count incremented |
//! | [`Error::Unauthenticated`] | Run stops early; rows released without spending retry budget |
//! | [`Error::SensorUnavailable`] | Collection does not start |
//! | [`Error::InvalidConfig`] | Rejected before anything runs |
//!
//! [`Error::is_retryable`] encodes the right-hand column.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the upload pipeline.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Local store fault.
    #[error("Storage error: {0}")]
    Storage(#[from] uplink_store::Error),

    /// The remote endpoint could not be reached.
    #[error("Network error calling {url}: {message}")]
    Network {
        /// The URL that was requested.
        url: String,
        /// Description of the transport failure.
        message: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The remote endpoint returned a non-success status.
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error text from the response body, or the status reason.
        message: String,
    },

    /// No usable credential, or the remote rejected it.
    #[error("Not authenticated")]
    Unauthenticated,

    /// A sensor source could not be started.
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// Request or response body could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a network error for a URL.
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the failure is transient and should consume retry budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } => true,
            Error::Timeout { .. } => true,
            Error::Api { .. } => true,
            Error::Serialization(_) => true,
            // Surfaces at the run level, never per row
            Error::Storage(_) => false,
            // Handled by releasing the claim instead
            Error::Unauthenticated => false,
            Error::SensorUnavailable(_) => false,
            Error::InvalidConfig(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using uplink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Api {
            status: 503,
            message: "Service Unavailable".into(),
        };
        assert_eq!(err.to_string(), "API error 503: Service Unavailable");

        let err = Error::timeout("submit sensor readings", Duration::from_secs(30));
        assert!(err.to_string().contains("submit sensor readings"));
        assert!(err.to_string().contains("30s"));

        let err = Error::network("http://localhost/data/event", "connection refused");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::network("u", "m").is_retryable());
        assert!(Error::timeout("op", Duration::from_secs(1)).is_retryable());
        assert!(
            Error::Api {
                status: 500,
                message: "boom".into()
            }
            .is_retryable()
        );
        assert!(Error::Serialization("bad".into()).is_retryable());
        assert!(!Error::Unauthenticated.is_retryable());
        assert!(!Error::SensorUnavailable("gyroscope".into()).is_retryable());
        assert!(!Error::invalid_config("bad").is_retryable());
    }

    #[test]
    fn test_storage_conversion() {
        let err: Error = uplink_store::Error::BatchNotFound("b1".into()).into();
        assert!(matches!(err, Error::Storage(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
