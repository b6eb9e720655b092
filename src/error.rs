//! Error types for treehole-dl
//!
//! Errors are split by how far they are allowed to travel:
//! - [`Error`] - systemic failures that abort the whole run (authentication,
//!   misconfiguration, disk I/O on the output tree)
//! - [`FetchError`] - per-item failures, isolated inside a fetch task and recorded
//!   on the post as a [`FetchFailure`](crate::types::FetchFailure) marker
//! - [`ImageError`] - image download failures, always degraded to a placeholder

use thiserror::Error;

use crate::types::{FailureKind, PostId};

/// Result type alias for treehole-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main (systemic) error type for treehole-dl
///
/// Only these errors propagate across the collection join barrier and halt a run.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "rate.burst")
        key: Option<String>,
    },

    /// Authentication rejected by the API; the session must be re-established
    #[error("authentication failed: {0}")]
    Auth(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network error outside of a fetch task (client construction, followed list)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The run was cancelled before collection could start
    #[error("run cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Per-item error produced by the API client or a fetch task
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, connection resets, 5xx, 429 - worth retrying
    #[error("transient network error: {0}")]
    Transient(String),

    /// Server refused the request for good
    #[error("permanent fetch error: {0}")]
    Permanent(String),

    /// Post does not exist (or was deleted)
    #[error("post {0} not found")]
    NotFound(PostId),

    /// The response body could not be understood
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Credentials rejected; fatal for the whole run
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Run-wide cancellation observed at a suspension point
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Failure kind recorded on the post's error marker
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Transient(_) => FailureKind::Transient,
            FetchError::Permanent(_) => FailureKind::Permanent,
            FetchError::NotFound(_) => FailureKind::NotFound,
            // Malformed responses are treated as permanent for that item
            FetchError::Malformed(_) => FailureKind::Malformed,
            FetchError::Auth(_) => FailureKind::Auth,
            FetchError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Auth(_))
    }
}

/// Image materialization errors (never abort a fetch task)
#[derive(Debug, Error)]
pub enum ImageError {
    /// The download itself failed
    #[error("image download failed for {url}: {source}")]
    Download {
        /// Remote URL of the image
        url: String,
        /// Underlying fetch error
        #[source]
        source: FetchError,
    },

    /// Writing the asset to disk failed
    #[error("failed to store image {path}: {source}")]
    Write {
        /// Destination path
        path: std::path::PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}
