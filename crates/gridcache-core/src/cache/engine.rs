//! Query execution on top of the entry store.
//!
//! The engine is the only writer of the store. It decides when a key needs a
//! fetch, makes sure at most one fetch per key is in flight, retries failed
//! fetches with backoff, and runs the per-key refetch timers and the eviction
//! sweeper for as long as anyone is subscribed.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::entry::{CacheEntry, FetchStatus, Payload};
use super::key::QueryKey;
use super::policy;
use super::store::{lock, EntryStore, Subscription};
use crate::error::{ConfigurationError, QueryError, SourceError};

/// Default interval between eviction sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default time an unobserved entry is kept after its last fetch.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(300);

/// Upper bound accepted for `max_retries`; with a 30s backoff cap this is
/// already minutes of retrying.
pub const MAX_RETRIES_LIMIT: u32 = 10;

type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Payload, SourceError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long a successful result counts as fresh
    pub stale_time: Duration,
    /// How long an unobserved entry survives after its last fetch
    pub cache_time: Duration,
    pub max_retries: u32,
    /// Refetch on a timer while at least one subscriber remains
    pub refetch_interval: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: DEFAULT_CACHE_TIME,
            max_retries: policy::DEFAULT_MAX_RETRIES,
            refetch_interval: None,
        }
    }
}

fn non_negative_ms(field: &'static str, value: i64) -> Result<Duration, ConfigurationError> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ConfigurationError::Negative { field, value })
}

impl QueryOptions {
    /// Build options from signed millisecond values as they appear in
    /// configuration files, rejecting negative values.
    pub fn from_millis(
        stale_time_ms: i64,
        cache_time_ms: i64,
        max_retries: u32,
        refetch_interval_ms: Option<i64>,
    ) -> Result<Self, ConfigurationError> {
        let options = Self {
            stale_time: non_negative_ms("stale_time", stale_time_ms)?,
            cache_time: non_negative_ms("cache_time", cache_time_ms)?,
            max_retries,
            refetch_interval: refetch_interval_ms
                .map(|ms| non_negative_ms("refetch_interval", ms))
                .transpose()?,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigurationError::TooManyRetries {
                value: self.max_retries,
                limit: MAX_RETRIES_LIMIT,
            });
        }
        if self.refetch_interval == Some(Duration::ZERO) {
            return Err(ConfigurationError::Zero {
                field: "refetch_interval",
            });
        }
        if self.cache_time < self.stale_time {
            return Err(ConfigurationError::CacheShorterThanStale {
                cache_ms: self.cache_time.as_millis(),
                stale_ms: self.stale_time.as_millis(),
            });
        }
        Ok(())
    }
}

/// What a subscriber sees for its key.
pub struct QueryState<T> {
    /// Last successful value, kept through refetches and failures
    pub data: Option<Arc<T>>,
    pub status: FetchStatus,
    pub error: Option<SourceError>,
    pub fetched_at: Option<Instant>,
    pub retry_count: u32,
    pub is_stale: bool,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            retry_count: self.retry_count,
            is_stale: self.is_stale,
        }
    }
}

impl<T> fmt::Debug for QueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("has_data", &self.data.is_some())
            .field("status", &self.status)
            .field("error", &self.error)
            .field("retry_count", &self.retry_count)
            .field("is_stale", &self.is_stale)
            .finish()
    }
}

impl<T: Send + Sync + 'static> QueryState<T> {
    fn from_entry(entry: Option<&CacheEntry>, stale_time: Duration, now: Instant) -> Self {
        match entry {
            Some(entry) => Self {
                data: entry
                    .value
                    .clone()
                    .and_then(|value| value.downcast::<T>().ok()),
                status: entry.status,
                error: entry.error.clone(),
                fetched_at: entry.fetched_at,
                retry_count: entry.retry_count,
                is_stale: policy::is_stale(entry, stale_time, now),
            },
            None => Self {
                data: None,
                status: FetchStatus::Idle,
                error: None,
                fetched_at: None,
                retry_count: 0,
                is_stale: true,
            },
        }
    }
}

struct Registration {
    fetch_fn: FetchFn,
    max_retries: u32,
    subscribers: usize,
    refetch_task: Option<JoinHandle<()>>,
}

struct EngineInner {
    store: EntryStore,
    registrations: Mutex<HashMap<QueryKey, Registration>>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.sweeper).take() {
            task.abort();
        }
        for registration in lock(&self.registrations).values_mut() {
            if let Some(task) = registration.refetch_task.take() {
                task.abort();
            }
        }
    }
}

/// The query cache engine.
///
/// Clone is cheap - every clone shares the same store and timers. Methods that
/// may start fetches or timers must be called from within a tokio runtime.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<EngineInner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL)
    }
}

impl QueryCache {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store: EntryStore::new(),
                registrations: Mutex::new(HashMap::new()),
                sweep_interval,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to `key`, fetching with `fetch` when the cached entry is
    /// missing, stale or failed.
    ///
    /// While a fetch for `key` is in flight, further calls attach to it
    /// instead of starting another one.
    pub fn query<T, F, Fut>(
        &self,
        key: QueryKey,
        fetch: F,
        options: QueryOptions,
    ) -> Result<QueryHandle<T>, ConfigurationError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SourceError>> + Send + 'static,
    {
        options.validate()?;

        let fetch_fn: FetchFn = Arc::new(move || {
            let fut = fetch();
            async move { fut.await.map(|value| Arc::new(value) as Payload) }.boxed()
        });

        let entry = self.register(&key, fetch_fn, &options);

        let (version_tx, version_rx) = watch::channel(0u64);
        let subscription = self.inner.store.subscribe(&key, move |_, _| {
            version_tx.send_modify(|version| *version = version.wrapping_add(1));
        });

        let needs_fetch = entry.map_or(true, |entry| {
            matches!(entry.status, FetchStatus::Idle | FetchStatus::Error)
                || (entry.status == FetchStatus::Success
                    && policy::is_stale(&entry, options.stale_time, Instant::now()))
        });
        if needs_fetch {
            self.start_fetch(&key);
        } else {
            debug!(key = %key, "Cache hit");
        }

        Ok(QueryHandle {
            cache: self.clone(),
            key,
            stale_time: options.stale_time,
            version: version_rx,
            subscription: Some(subscription),
            _marker: PhantomData,
        })
    }

    /// Subscribe, wait for the query to settle, and return its value.
    pub async fn fetch<T, F, Fut>(
        &self,
        key: QueryKey,
        fetch: F,
        options: QueryOptions,
    ) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SourceError>> + Send + 'static,
    {
        let mut handle = self.query(key, fetch, options)?;
        let state = handle.settled().await;
        match state.status {
            FetchStatus::Error => Err(state
                .error
                .unwrap_or_else(|| SourceError::InvalidResponse("fetch failed".to_string()))
                .into()),
            _ => state.data.ok_or_else(|| QueryError::TypeMismatch {
                key: handle.key().to_string(),
            }),
        }
    }

    /// Mark every matching entry stale without dropping its value. Entries
    /// that still have subscribers are refetched right away; they keep
    /// showing the old value until the new one arrives.
    pub fn invalidate<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryKey) -> bool,
    {
        let keys: Vec<QueryKey> = self
            .inner
            .store
            .keys()
            .into_iter()
            .filter(|key| predicate(key))
            .collect();

        for key in &keys {
            self.inner
                .store
                .update(key, |entry| entry.map(CacheEntry::invalidate));
            if self.subscriber_count(key) > 0 {
                self.start_fetch(key);
            }
        }

        if !keys.is_empty() {
            info!(count = keys.len(), "Invalidated cached queries");
        }
        keys.len()
    }

    /// Fetch `key` again regardless of freshness. Returns false when the key
    /// has no registered fetcher or a fetch is already in flight.
    pub fn refetch(&self, key: &QueryKey) -> bool {
        self.start_fetch(key)
    }

    pub fn entry(&self, key: &QueryKey) -> Option<Arc<CacheEntry>> {
        self.inner.store.get(key)
    }

    /// Drop an entry outright, whatever its state
    pub fn remove(&self, key: &QueryKey) -> bool {
        self.inner.store.delete(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        lock(&self.inner.registrations)
            .get(key)
            .map_or(0, |registration| registration.subscribers)
    }

    /// Run an eviction sweep immediately. Returns the evicted keys.
    pub fn sweep_now(&self) -> Vec<QueryKey> {
        self.inner.store.sweep(Instant::now())
    }

    pub fn is_sweeper_running(&self) -> bool {
        lock(&self.inner.sweeper).is_some()
    }

    pub fn active_refetch_timers(&self) -> usize {
        lock(&self.inner.registrations)
            .values()
            .filter(|registration| registration.refetch_task.is_some())
            .count()
    }

    /// Count one more subscriber for `key` and write the count into its
    /// entry. Both happen under the registrations lock, so a concurrent
    /// `release` cannot store an older count over this one.
    fn register(
        &self,
        key: &QueryKey,
        fetch_fn: FetchFn,
        options: &QueryOptions,
    ) -> Option<Arc<CacheEntry>> {
        let (entry, first_overall) = {
            let mut registrations = lock(&self.inner.registrations);
            let first_overall = registrations.values().all(|r| r.subscribers == 0);

            let registration = registrations.entry(key.clone()).or_insert_with(|| Registration {
                fetch_fn: Arc::clone(&fetch_fn),
                max_retries: options.max_retries,
                subscribers: 0,
                refetch_task: None,
            });
            // The most recent registration supplies the fetcher
            registration.fetch_fn = fetch_fn;
            registration.max_retries = options.max_retries;
            registration.subscribers += 1;

            if let Some(interval) = options.refetch_interval {
                if registration.refetch_task.is_none() {
                    registration.refetch_task = Some(self.spawn_refetch_timer(key.clone(), interval));
                    debug!(key = %key, interval_ms = interval.as_millis() as u64, "Refetch timer started");
                }
            }

            let subscribers = registration.subscribers;
            let entry = self.inner.store.update(key, |current| {
                Some(match current {
                    Some(entry) => entry
                        .with_subscribers(subscribers)
                        .with_times(options.stale_time, options.cache_time),
                    None => CacheEntry::new(options.stale_time, options.cache_time)
                        .with_subscribers(subscribers),
                })
            });

            (entry, first_overall)
        };

        if first_overall {
            self.start_sweeper();
        }
        entry
    }

    fn release(&self, key: &QueryKey) {
        let (timer, none_left) = {
            let mut registrations = lock(&self.inner.registrations);
            let (remaining, timer) = match registrations.get_mut(key) {
                Some(registration) => {
                    registration.subscribers = registration.subscribers.saturating_sub(1);
                    let remaining = registration.subscribers;
                    let timer = if remaining == 0 {
                        registrations
                            .remove(key)
                            .and_then(|mut registration| registration.refetch_task.take())
                    } else {
                        None
                    };
                    (remaining, timer)
                }
                None => (0, None),
            };
            // Still under the registrations lock; see `register`
            self.inner
                .store
                .update(key, |entry| entry.map(|entry| entry.with_subscribers(remaining)));
            (timer, registrations.is_empty())
        };

        if let Some(timer) = timer {
            timer.abort();
            debug!(key = %key, "Refetch timer stopped");
        }

        if none_left {
            self.stop_sweeper();
        }
    }

    /// Transition `key` to fetching and spawn the fetch, unless one is
    /// already in flight. Check and transition happen under one store lock.
    fn start_fetch(&self, key: &QueryKey) -> bool {
        let (fetch_fn, max_retries) = match lock(&self.inner.registrations).get(key) {
            Some(registration) => (Arc::clone(&registration.fetch_fn), registration.max_retries),
            None => {
                debug!(key = %key, "No fetcher registered, not fetching");
                return false;
            }
        };

        let mut found = false;
        let mut started = false;
        self.inner.store.update(key, |current| {
            let entry = current?;
            found = true;
            if entry.status == FetchStatus::Fetching {
                return None;
            }
            started = true;
            Some(entry.fetching())
        });

        if !found {
            debug!(key = %key, "No cache entry, not fetching");
            return false;
        }
        if !started {
            debug!(key = %key, "Fetch already in flight, attaching");
            return false;
        }

        debug!(key = %key, "Fetch started");
        let store = self.inner.store.clone();
        let key = key.clone();
        tokio::spawn(run_fetch(store, key, fetch_fn, max_retries));
        true
    }

    fn spawn_refetch_timer(&self, key: QueryKey, interval: Duration) -> JoinHandle<()> {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = engine.upgrade() else {
                    return;
                };
                let cache = QueryCache { inner };
                if cache.refetch(&key) {
                    debug!(key = %key, "Periodic refetch");
                }
            }
        })
    }

    fn start_sweeper(&self) {
        let mut sweeper = lock(&self.inner.sweeper);
        if sweeper.is_some() {
            return;
        }
        let store = self.inner.store.clone();
        let interval = self.inner.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let evicted = store.sweep(Instant::now());
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "Eviction sweep");
                }
            }
        }));
        debug!("Eviction sweeper started");
    }

    fn stop_sweeper(&self) {
        if let Some(task) = lock(&self.inner.sweeper).take() {
            task.abort();
            debug!("Eviction sweeper stopped");
        }
    }
}

/// Run one fetch to completion, retrying with backoff.
///
/// The result is written even when nobody is subscribed any more, so a quick
/// re-subscription finds it cached.
async fn run_fetch(store: EntryStore, key: QueryKey, fetch_fn: FetchFn, max_retries: u32) {
    let mut retry_count = 0;
    loop {
        match fetch_fn().await {
            Ok(value) => {
                let now = Instant::now();
                if store
                    .update(&key, |entry| entry.map(|entry| entry.succeeded(value, now)))
                    .is_none()
                {
                    debug!(key = %key, "Entry removed while fetching, dropping result");
                }
                debug!(key = %key, "Fetch succeeded");
                return;
            }
            Err(err) if policy::should_retry(retry_count, max_retries) => {
                let delay = policy::next_retry_delay(retry_count);
                retry_count += 1;
                warn!(
                    key = %key,
                    retry = retry_count,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Fetch failed, backing off"
                );
                store.update(&key, |entry| entry.map(|entry| entry.retrying(retry_count, err)));
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(key = %key, retries = retry_count, error = %err, "Fetch failed, retries exhausted");
                store.update(&key, |entry| entry.map(|entry| entry.failed(err)));
                return;
            }
        }
    }
}

/// A live subscription to one query key. Dropping it unsubscribes.
pub struct QueryHandle<T> {
    cache: QueryCache,
    key: QueryKey,
    stale_time: Duration,
    version: watch::Receiver<u64>,
    subscription: Option<Subscription>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> QueryHandle<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current snapshot of the query
    pub fn state(&self) -> QueryState<T> {
        let entry = self.cache.entry(&self.key);
        QueryState::from_entry(entry.as_deref(), self.stale_time, Instant::now())
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.state().data
    }

    pub fn refetch(&self) -> bool {
        self.cache.refetch(&self.key)
    }

    /// Wait for the next change to this key's entry. Returns false if the
    /// subscription has been closed.
    pub async fn changed(&mut self) -> bool {
        self.version.changed().await.is_ok()
    }

    /// Wait until the query is in `Success` or `Error`.
    pub async fn settled(&mut self) -> QueryState<T> {
        loop {
            self.version.borrow_and_update();
            let state = self.state();
            if state.status.is_settled() {
                return state;
            }
            if self.version.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

impl<T> Drop for QueryHandle<T> {
    fn drop(&mut self) {
        self.subscription.take();
        self.cache.release(&self.key);
    }
}
