//! Error types for riskcoord.

use thiserror::Error;

/// Result type alias using riskcoord's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for riskcoord operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Shared storage medium failed (quota, unavailable backend)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// External classification call failed
    #[error("Classification error: {0}")]
    Classification(String),

    /// Durable result store call failed
    #[error("Result store error: {0}")]
    ResultStore(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// An awaited external call exceeded its deadline
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Transport failure without a known deadline. Callers that own a deadline
/// map `is_timeout()` to [`Error::Timeout`] themselves.
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Error::Request(format!("timeout: {e}"));
        }
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_storage() {
        let err = Error::Storage("quota exceeded".to_string());
        assert_eq!(err.to_string(), "Storage error: quota exceeded");
    }

    #[test]
    fn test_error_display_classification() {
        let err = Error::Classification("malformed response".to_string());
        assert_eq!(err.to_string(), "Classification error: malformed response");
    }

    #[test]
    fn test_error_display_result_store() {
        let err = Error::ResultStore("500".to_string());
        assert_eq!(err.to_string(), "Result store error: 500");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout(60_000);
        assert_eq!(err.to_string(), "Timed out after 60000ms");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing API url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing API url");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_from_reqwest_error() {
        let req_err = reqwest::Client::new().get("not a url").build().unwrap_err();
        let err: Error = req_err.into();
        assert!(matches!(err, Error::Request(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
