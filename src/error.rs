//! Error types for mentor-shield

use std::io;

use thiserror::Error;

/// Result type alias for mentor-shield
pub type Result<T> = std::result::Result<T, Error>;

/// mentor-shield errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream failed in a way that may succeed on a later attempt
    /// (network fault, 5xx, upstream throttling)
    #[error("Upstream unavailable: {0}")]
    Transient(String),

    /// Upstream rejected the request (malformed request, auth failure)
    #[error("Upstream rejected request: {0}")]
    Permanent(String),

    /// Upstream has no record for the requested id
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Circuit breaker is rejecting calls without contacting the upstream
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Another caller is refreshing this key and no value is available yet
    #[error("Refresh in progress for key: {0}")]
    RefreshInProgress(String),

    /// A single upstream call exceeded its timeout
    #[error("Upstream call timed out: {0}")]
    Timeout(String),

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// The retry budget ran out before the next attempt could start
    #[error("Retry deadline exceeded after {attempts} attempt(s): {source}")]
    DeadlineExceeded {
        /// Attempts made before giving up
        attempts: u32,
        /// Error from the final attempt
        #[source]
        source: Box<Error>,
    },

    /// Every permitted attempt failed
    #[error("Gave up after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        source: Box<Error>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// This is the default classifier used by [`crate::failsafe::RetryPolicy`].
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout(_) | Self::Io(_) => true,
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            _ => false,
        }
    }

    /// Whether this outcome should count against the upstream's health.
    ///
    /// A missing record or a caller giving up says nothing about whether
    /// the upstream is healthy.
    #[must_use]
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::Cancelled)
    }

    /// HTTP status a request handler should answer with for this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Permanent(_) => 502,
            Self::Transient(_)
            | Self::CircuitOpen(_)
            | Self::RefreshInProgress(_)
            | Self::Timeout(_)
            | Self::Cancelled
            | Self::DeadlineExceeded { .. }
            | Self::RetriesExhausted { .. }
            | Self::Http(_) => 503,
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => 500,
        }
    }

    /// Innermost error, looking through retry wrappers
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Self::DeadlineExceeded { source, .. } | Self::RetriesExhausted { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("503".into()).is_transient());
        assert!(Error::Timeout("fetch_all".into()).is_transient());
        assert!(!Error::Permanent("401".into()).is_transient());
        assert!(!Error::NotFound("rec1".into()).is_transient());
        assert!(!Error::CircuitOpen("upstream".into()).is_transient());
    }

    #[test]
    fn not_found_does_not_count_against_upstream() {
        assert!(!Error::NotFound("rec1".into()).counts_as_failure());
        assert!(!Error::Cancelled.counts_as_failure());
        assert!(Error::Permanent("401".into()).counts_as_failure());
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::CircuitOpen("x".into()).status_code(), 503);
        assert_eq!(Error::Permanent("x".into()).status_code(), 502);
        assert_eq!(Error::Config("x".into()).status_code(), 500);
    }

    #[test]
    fn root_unwraps_retry_wrappers() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            source: Box::new(Error::Transient("connection reset".into())),
        };
        assert!(matches!(err.root(), Error::Transient(_)));
        assert!(err.to_string().contains("3 attempt(s)"));
    }
}
