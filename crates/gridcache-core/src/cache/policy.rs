//! Freshness and retry decisions.
//!
//! Everything here is a pure function of its arguments; the current time is
//! always passed in so the rules can be checked against any clock.

use std::time::Duration;

use tokio::time::Instant;

use super::entry::{CacheEntry, FetchStatus};

/// Retries after the first failed attempt before surfacing the error.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First retry waits one second; each further retry doubles it.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Backoff never exceeds 30 seconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Whether the entry must be refetched before it can be considered fresh.
pub fn is_stale(entry: &CacheEntry, stale_time: Duration, now: Instant) -> bool {
    if entry.invalidated {
        return true;
    }
    match entry.fetched_at {
        None => true,
        Some(at) => now.saturating_duration_since(at) > stale_time,
    }
}

/// Exponential backoff: `min(1000 * 2^retry_count, 30000)` milliseconds.
pub fn next_retry_delay(retry_count: u32) -> Duration {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS);
    Duration::from_millis(ms)
}

pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
    retry_count < max_retries
}

/// Whether the eviction sweep may drop this entry.
///
/// Only entries nobody observes and nothing is fetching qualify. Fetched
/// entries must also have outlived their `cache_time`; entries that never
/// produced a value have nothing worth keeping.
pub fn is_evictable(entry: &CacheEntry, now: Instant) -> bool {
    if entry.subscriber_count > 0 || entry.status == FetchStatus::Fetching {
        return false;
    }
    match entry.age(now) {
        Some(age) => age > entry.cache_time,
        None => true,
    }
}
