// Error types for certwatch
//
// Structured error types using thiserror, so callers can match on failure
// classes instead of string-typed errors.

use std::time::Duration;
use thiserror::Error;

/// Main error type for certwatch operations
#[derive(Debug, Error)]
pub enum CtError {
    /// Invalid configuration or parameters
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// A watched domain failed validation
    #[error("Invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    /// CT log API returned a non-retryable status
    #[error("HTTP error (status {status}): {details}")]
    Http { status: u16, details: String },

    /// Reqwest transport errors
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Parsing error for leaves, certificates and wire data
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Checkpoint store errors
    #[error("Checkpoint store error: {message}")]
    Store { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Operation exceeded its deadline
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Start was called while the engine or a watcher was already running
    #[error("Already running")]
    AlreadyRunning,

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for CtError {
    fn from(err: sqlx::Error) -> Self {
        CtError::Store {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for CtError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        CtError::Timeout {
            duration: Duration::from_secs(0),
        }
    }
}
