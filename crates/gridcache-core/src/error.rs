//! Error types for the query cache and its record sources.
//!
//! - `SourceError`: failures reported by a `RecordSource` (retried, then surfaced)
//! - `ConsistencyFault`: page accumulation went out of order (logged, recovered)
//! - `ConfigurationError`: invalid options (rejected at registration time)
//! - `QueryError`: what a one-shot fetch through the cache can return

use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Row {index} violates the {resource} schema: {reason}")]
    Schema {
        resource: String,
        index: usize,
        reason: String,
    },
}

impl SourceError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => SourceError::Unauthorized,
            403 => SourceError::AccessDenied(truncated),
            404 => SourceError::NotFound(truncated),
            429 => SourceError::RateLimited,
            500..=599 => SourceError::ServerError(truncated),
            _ => SourceError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::InvalidResponse(err.to_string())
        } else {
            SourceError::Network(err.to_string())
        }
    }
}

/// A page arrived whose index does not continue the accumulated list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Page {received} arrived for {base} but page {expected} was expected")]
pub struct ConsistencyFault {
    pub base: String,
    pub expected: usize,
    pub received: usize,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: i64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("max_retries must be at most {limit} (got {value})")]
    TooManyRetries { value: u32, limit: u32 },

    #[error("cache_time ({cache_ms}ms) must not be shorter than stale_time ({stale_ms}ms)")]
    CacheShorterThanStale { cache_ms: u128, stale_ms: u128 },

    #[error("{field} must be a finite positive number (got {value})")]
    InvalidDimension { field: &'static str, value: f32 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Cached value for {key} has a different type than requested")]
    TypeMismatch { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_maps_codes() {
        assert_eq!(
            SourceError::from_status(reqwest::StatusCode::UNAUTHORIZED, ""),
            SourceError::Unauthorized
        );
        assert_eq!(
            SourceError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down"),
            SourceError::RateLimited
        );
        assert!(matches!(
            SourceError::from_status(reqwest::StatusCode::BAD_GATEWAY, "upstream"),
            SourceError::ServerError(ref body) if body == "upstream"
        ));
        assert!(matches!(
            SourceError::from_status(reqwest::StatusCode::IM_A_TEAPOT, "tea"),
            SourceError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let truncated = SourceError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("truncated, 520 total bytes"));
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_BODY_LENGTH);
        // Must not panic on a multi-byte boundary
        let truncated = SourceError::truncate_body(&long);
        assert!(truncated.contains("truncated"));
    }
}
