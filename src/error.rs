//! Error types for tiercache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value or metadata blob could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// TTL does not leave room for the stale window
    #[error("Invalid TTL {ttl:?}: must be greater than the stale threshold {stale_threshold:?}")]
    InvalidTtl {
        ttl: Duration,
        stale_threshold: Duration,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Caller-supplied fetcher failed
    #[error("Fetch failed: {0}")]
    FetchFailed(#[source] anyhow::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", e))
    }
}
