//! Error types for the query cache
//!
//! Provides unified error handling using thiserror. Fetch failures are a
//! cloneable payload carried on cache entries; everything else is the
//! fail-fast taxonomy surfaced by the client facade.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// == Fetch Error ==
/// Failure produced by a caller-supplied fetch or mutation function.
///
/// Stored on entries (`error`, `failure_reason`) and delivered through
/// observer results, so it must be cheap to clone and serializable for
/// dehydration.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct FetchError {
    /// Human-readable description of the failure
    pub message: String,
}

impl FetchError {
    /// Creates a new fetch error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

// == Query Error Enum ==
/// Unified error type for client-facing operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The caller-supplied operation failed after exhausting its retries
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The fetch was cancelled before settling; not a failure
    #[error("fetch cancelled")]
    Cancelled,

    /// A fetch was requested for an entry that has no fetch function
    #[error("no fetcher registered for query {0}")]
    MissingFetcher(String),

    /// A fetch was requested on a disabled entry
    #[error("query {0} is disabled")]
    Disabled(String),

    /// A persisted snapshot could not be restored
    #[error("invalid hydration payload: {0}")]
    Hydration(String),
}

// == Result Type Alias ==
/// Convenience Result type for the query cache.
pub type Result<T> = std::result::Result<T, QueryError>;

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::new("connection refused");
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn test_fetch_error_converts_to_query_error() {
        let err: QueryError = FetchError::new("boom").into();
        assert!(matches!(err, QueryError::Fetch(_)));
        assert_eq!(err.to_string(), "fetch failed: boom");
    }

    #[test]
    fn test_cancelled_is_not_a_fetch_error() {
        let err = QueryError::Cancelled;
        assert!(!matches!(err, QueryError::Fetch(_)));
    }

    #[test]
    fn test_fetch_error_round_trips_through_serde() {
        let err = FetchError::new("timeout");
        let json = serde_json::to_string(&err).unwrap();
        let back: FetchError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
