//! Client-side query cache.
//!
//! This module provides the pieces behind `QueryCache`:
//!
//! - `key`: structural query keys and base queries (a key minus its page index)
//! - `entry`: immutable cache entry snapshots and fetch status
//! - `store`: key → entry map with per-key change listeners and eviction sweeps
//! - `policy`: staleness, retry backoff and eviction rules
//! - `engine`: fetch execution, deduplication, invalidation, refetch timers

pub mod engine;
pub mod entry;
pub mod key;
pub mod policy;
pub mod store;

pub use engine::{QueryCache, QueryHandle, QueryOptions, QueryState};
pub use entry::{CacheEntry, FetchStatus, Payload};
pub use key::{BaseQuery, Filters, QueryKey};
pub use store::{EntryStore, Subscription};
