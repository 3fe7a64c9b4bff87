use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::SourceError;

/// Type-erased cached value. Each key holds a single concrete type, recovered
/// with `Arc::downcast` by the typed handles.
pub type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

impl FetchStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, FetchStatus::Success | FetchStatus::Error)
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::Idle => write!(f, "idle"),
            FetchStatus::Fetching => write!(f, "fetching"),
            FetchStatus::Success => write!(f, "success"),
            FetchStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of one cached query.
///
/// Entries are never mutated in place: every transition builds a new entry
/// and the store swaps it in whole, so readers only ever observe complete
/// snapshots.
#[derive(Clone)]
pub struct CacheEntry {
    pub value: Option<Payload>,
    pub status: FetchStatus,
    pub fetched_at: Option<Instant>,
    pub error: Option<SourceError>,
    pub retry_count: u32,
    pub subscriber_count: usize,
    pub stale_time: Duration,
    pub cache_time: Duration,
    /// Set by invalidation; the value is kept for stale-while-revalidate
    pub invalidated: bool,
}

impl CacheEntry {
    pub fn new(stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            value: None,
            status: FetchStatus::Idle,
            fetched_at: None,
            error: None,
            retry_count: 0,
            subscriber_count: 0,
            stale_time,
            cache_time,
            invalidated: false,
        }
    }

    pub fn fetching(&self) -> Self {
        Self {
            status: FetchStatus::Fetching,
            ..self.clone()
        }
    }

    /// A failed attempt that will be retried; status stays `Fetching`
    pub fn retrying(&self, retry_count: u32, error: SourceError) -> Self {
        Self {
            status: FetchStatus::Fetching,
            retry_count,
            error: Some(error),
            ..self.clone()
        }
    }

    pub fn succeeded(&self, value: Payload, now: Instant) -> Self {
        Self {
            value: Some(value),
            status: FetchStatus::Success,
            fetched_at: Some(now),
            error: None,
            retry_count: 0,
            invalidated: false,
            ..self.clone()
        }
    }

    /// Retries exhausted; the last good value stays available
    pub fn failed(&self, error: SourceError) -> Self {
        Self {
            status: FetchStatus::Error,
            error: Some(error),
            ..self.clone()
        }
    }

    pub fn invalidate(&self) -> Self {
        Self {
            invalidated: true,
            ..self.clone()
        }
    }

    pub fn with_subscribers(&self, subscriber_count: usize) -> Self {
        Self {
            subscriber_count,
            ..self.clone()
        }
    }

    /// Keep the longest freshness windows any registration asked for
    pub fn with_times(&self, stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            stale_time: self.stale_time.max(stale_time),
            cache_time: self.cache_time.max(cache_time),
            ..self.clone()
        }
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.fetched_at.map(|at| now.saturating_duration_since(at))
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("has_value", &self.value.is_some())
            .field("status", &self.status)
            .field("fetched_at", &self.fetched_at)
            .field("error", &self.error)
            .field("retry_count", &self.retry_count)
            .field("subscriber_count", &self.subscriber_count)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_resets_retry_state() {
        let now = Instant::now();
        let entry = CacheEntry::new(Duration::from_secs(1), Duration::from_secs(5))
            .fetching()
            .retrying(2, SourceError::RateLimited)
            .succeeded(Arc::new(7u32), now);

        assert_eq!(entry.status, FetchStatus::Success);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.error.is_none());
        assert_eq!(entry.fetched_at, Some(now));
    }

    #[test]
    fn test_failure_keeps_last_value() {
        let entry = CacheEntry::new(Duration::ZERO, Duration::ZERO)
            .succeeded(Arc::new("old".to_string()), Instant::now())
            .fetching()
            .failed(SourceError::Unauthorized);

        assert_eq!(entry.status, FetchStatus::Error);
        let value = entry.value.and_then(|v| v.downcast::<String>().ok());
        assert_eq!(value.as_deref().map(String::as_str), Some("old"));
    }

    #[test]
    fn test_with_times_keeps_longest_windows() {
        let entry = CacheEntry::new(Duration::from_secs(10), Duration::from_secs(60))
            .with_times(Duration::from_secs(5), Duration::from_secs(120));
        assert_eq!(entry.stale_time, Duration::from_secs(10));
        assert_eq!(entry.cache_time, Duration::from_secs(120));
    }
}
