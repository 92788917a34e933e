//! Error types for esferry.

use thiserror::Error;

/// Result type alias for esferry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while talking to clusters, reading dumps, or moving documents.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A cluster could not be identified during startup (unreachable or unknown version).
    #[error("Handshake with {host} failed: {reason}")]
    Handshake {
        /// Cluster base URL.
        host: String,
        /// Why the handshake failed.
        reason: String,
    },

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The cluster answered with a non-success status.
    #[error("{operation} on {host} failed with status {status}: {body}")]
    Cluster {
        /// Cluster base URL.
        host: String,
        /// Operation that failed (e.g. "open scroll on logs-*").
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Response body, as returned by the server.
        body: String,
    },

    /// Credentials were rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The cluster asked us to slow down; value is the suggested wait in seconds.
    #[error("Rate limited, retry after {0}s")]
    RateLimit(u64),

    /// A response or dump line could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A document is missing a field the destination requires.
    #[error("Malformed document: missing {0}")]
    MalformedDocument(&'static str),

    /// The shared document queue was closed while a producer was still writing.
    #[error("Document queue closed")]
    QueueClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Builds a [`Error::Cluster`] from its parts.
    pub fn cluster(
        host: impl Into<String>,
        operation: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        Self::Cluster {
            host: host.into(),
            operation: operation.into(),
            status,
            body: body.into(),
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Cluster { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::RateLimit(_) => Some(429),
            _ => None,
        }
    }

    /// Returns true when retrying the same request may succeed.
    ///
    /// Rate limits, IO failures, connect/timeouts and 5xx answers are transient.
    /// Authentication, decoding and configuration problems are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit(_) | Self::Io(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Cluster { status, .. } => matches!(status, 429 | 500..=599),
            _ => false,
        }
    }
}
