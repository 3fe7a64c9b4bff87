//! Metric trend polling.
//!
//! A `TrendPoller` keeps a summary query of one metric group alive with a
//! refetch interval, and classifies every new snapshot against the previous
//! one as up, down or stable.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cache::store::lock;
use crate::cache::{FetchStatus, QueryCache, QueryHandle, QueryKey, QueryOptions};
use crate::error::{ConfigurationError, SourceError};
use crate::source::{RecordSource, Summary};

/// Default poll interval for a metric group.
pub const DEFAULT_TREND_INTERVAL: Duration = Duration::from_secs(30);

/// Changes smaller than this percentage count as stable.
pub const STABLE_THRESHOLD_PERCENT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn arrow(&self) -> &'static str {
        match self {
            Trend::Up => "▲",
            Trend::Down => "▼",
            Trend::Stable => "•",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Trend::Up => "up",
            Trend::Down => "down",
            Trend::Stable => "stable",
        };
        f.write_str(label)
    }
}

fn by_sign(delta: f64) -> Trend {
    if delta > 0.0 {
        Trend::Up
    } else if delta < 0.0 {
        Trend::Down
    } else {
        Trend::Stable
    }
}

/// Direction of one metric between two polls.
pub fn classify(current: f64, previous: Option<f64>) -> Trend {
    let Some(previous) = previous else {
        return Trend::Stable;
    };
    let delta = current - previous;
    if previous == 0.0 {
        return by_sign(delta);
    }
    let percent = delta.abs() / previous.abs() * 100.0;
    if percent < STABLE_THRESHOLD_PERCENT {
        Trend::Stable
    } else {
        by_sign(delta)
    }
}

/// Values of a metric group at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub values: Summary,
}

impl MetricSnapshot {
    pub fn new(values: Summary) -> Self {
        Self {
            timestamp: Utc::now(),
            values,
        }
    }
}

/// Classify every metric of `current`. Metrics missing from `previous` are
/// stable, as is everything on the first snapshot.
pub fn classify_snapshot(
    current: &MetricSnapshot,
    previous: Option<&MetricSnapshot>,
) -> BTreeMap<String, Trend> {
    current
        .values
        .iter()
        .map(|(name, value)| {
            let prior = previous.and_then(|p| p.values.get(name).copied());
            (name.clone(), classify(*value, prior))
        })
        .collect()
}

/// What consumers of a metric group see.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendView {
    pub values: Summary,
    pub trends: BTreeMap<String, Trend>,
    pub is_loading: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub error: Option<SourceError>,
}

type SummaryFetch = Arc<dyn Fn() -> BoxFuture<'static, Result<Summary, SourceError>> + Send + Sync>;

#[derive(Default)]
struct Lifecycle {
    refs: usize,
    task: Option<JoinHandle<()>>,
}

struct PollerInner {
    group: String,
    cache: QueryCache,
    fetch: SummaryFetch,
    options: QueryOptions,
    view: Arc<watch::Sender<TrendView>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Drop for PollerInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.lifecycle).task.take() {
            task.abort();
        }
    }
}

/// Periodic poller for one metric group.
///
/// Clone is cheap; clones share the poll task and its reference count.
/// Polling runs between the first `start` and the matching last `stop`.
#[derive(Clone)]
pub struct TrendPoller {
    inner: Arc<PollerInner>,
}

impl TrendPoller {
    pub fn new<S: RecordSource>(
        cache: QueryCache,
        source: Arc<S>,
        group: impl Into<String>,
        interval: Duration,
        options: QueryOptions,
    ) -> Result<Self, ConfigurationError> {
        let group = group.into();
        let options = options.with_refetch_interval(interval);
        options.validate()?;

        let fetch_group = group.clone();
        let fetch: SummaryFetch = Arc::new(move || {
            let source = Arc::clone(&source);
            let group = fetch_group.clone();
            async move { source.fetch_summary(&group).await }.boxed()
        });

        let (view, _) = watch::channel(TrendView::default());
        let view = Arc::new(view);
        Ok(Self {
            inner: Arc::new(PollerInner {
                group,
                cache,
                fetch,
                options,
                view,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn interval(&self) -> Option<Duration> {
        self.inner.options.refetch_interval
    }

    /// Add a consumer. The first one starts polling.
    pub fn start(&self) -> Result<(), ConfigurationError> {
        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.refs += 1;
        if lifecycle.task.is_some() {
            return Ok(());
        }

        let fetch = Arc::clone(&self.inner.fetch);
        let handle = match self.inner.cache.query(
            QueryKey::summary(&self.inner.group),
            move || fetch(),
            self.inner.options,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                lifecycle.refs -= 1;
                return Err(e);
            }
        };

        self.inner.view.send_modify(|view| {
            view.is_loading = view.last_updated.is_none();
        });
        info!(group = %self.inner.group, interval = ?self.interval(), "Trend polling started");
        lifecycle.task = Some(tokio::spawn(poll(
            self.inner.group.clone(),
            handle,
            Arc::clone(&self.inner.view),
        )));
        Ok(())
    }

    /// Remove a consumer. The last one stops polling, which also drops the
    /// summary subscription and with it the refetch timer.
    pub fn stop(&self) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.refs == 0 {
            return;
        }
        lifecycle.refs -= 1;
        if lifecycle.refs == 0 {
            if let Some(task) = lifecycle.task.take() {
                task.abort();
                info!(group = %self.inner.group, "Trend polling stopped");
            }
            self.inner.view.send_modify(|view| view.is_loading = false);
        }
    }

    pub fn consumers(&self) -> usize {
        lock(&self.inner.lifecycle).refs
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.lifecycle).task.is_some()
    }

    pub fn view(&self) -> TrendView {
        self.inner.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrendView> {
        self.inner.view.subscribe()
    }
}

/// Classify each new successful snapshot, one at a time, replacing the
/// previous snapshot only once its trends are published.
async fn poll(group: String, mut handle: QueryHandle<Summary>, view: Arc<watch::Sender<TrendView>>) {
    let mut previous: Option<MetricSnapshot> = None;
    let mut last_fetch = None;

    loop {
        let state = handle.state();
        match (state.status, state.data, state.fetched_at) {
            (FetchStatus::Success, Some(values), Some(fetched_at)) if last_fetch != Some(fetched_at) => {
                let snapshot = MetricSnapshot::new(values.as_ref().clone());
                let trends = classify_snapshot(&snapshot, previous.as_ref());
                debug!(group = %group, metrics = snapshot.values.len(), "Metric snapshot classified");

                view.send_modify(|view| {
                    view.values = snapshot.values.clone();
                    view.trends = trends;
                    view.is_loading = false;
                    view.last_updated = Some(snapshot.timestamp);
                    view.error = None;
                });
                previous = Some(snapshot);
                last_fetch = Some(fetched_at);
            }
            (FetchStatus::Error, _, _) => {
                if let Some(ref e) = state.error {
                    error!(group = %group, error = %e, "Metric poll failed");
                }
                view.send_modify(|view| {
                    view.is_loading = false;
                    view.error = state.error.clone();
                });
            }
            _ => {}
        }

        if !handle.changed().await {
            break;
        }
    }
}

/// A consumer's hold on a metric group. Created started; dropping it stops
/// its share of the polling.
pub struct TrendMetrics {
    poller: TrendPoller,
    view: watch::Receiver<TrendView>,
}

impl TrendMetrics {
    pub fn new(poller: TrendPoller) -> Result<Self, ConfigurationError> {
        poller.start()?;
        let view = poller.subscribe();
        Ok(Self { poller, view })
    }

    pub fn group(&self) -> &str {
        self.poller.group()
    }

    pub fn values(&self) -> Summary {
        self.view.borrow().values.clone()
    }

    pub fn trends(&self) -> BTreeMap<String, Trend> {
        self.view.borrow().trends.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.view.borrow().is_loading
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.view.borrow().last_updated
    }

    pub fn error(&self) -> Option<SourceError> {
        self.view.borrow().error.clone()
    }

    pub fn snapshot(&self) -> TrendView {
        self.view.borrow().clone()
    }

    /// Wait for the next published update
    pub async fn changed(&mut self) -> bool {
        self.view.changed().await.is_ok()
    }
}

impl Drop for TrendMetrics {
    fn drop(&mut self) {
        self.poller.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    #[derive(Debug, Clone)]
    struct Nothing;

    impl crate::source::Row for Nothing {
        type Id = u8;

        fn id(&self) -> u8 {
            0
        }
    }

    fn summary(pairs: &[(&str, f64)]) -> Summary {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn poller(source: &Arc<MemorySource<Nothing>>, cache: &QueryCache) -> TrendPoller {
        TrendPoller::new(
            cache.clone(),
            Arc::clone(source),
            "users",
            Duration::from_secs(30),
            QueryOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(classify(100.9, Some(100.0)), Trend::Stable);
        assert_eq!(classify(101.5, Some(100.0)), Trend::Up);
        assert_eq!(classify(98.0, Some(100.0)), Trend::Down);
        assert_eq!(classify(42.0, None), Trend::Stable);
    }

    #[test]
    fn test_classification_around_zero() {
        assert_eq!(classify(0.0, Some(0.0)), Trend::Stable);
        assert_eq!(classify(3.0, Some(0.0)), Trend::Up);
        assert_eq!(classify(-3.0, Some(0.0)), Trend::Down);
        // Negative baselines compare by magnitude
        assert_eq!(classify(-90.0, Some(-100.0)), Trend::Up);
        assert_eq!(classify(-100.5, Some(-100.0)), Trend::Stable);
        assert_eq!(classify(f64::NAN, Some(1.0)), Trend::Stable);
    }

    #[test]
    fn test_classify_snapshot() {
        let previous = MetricSnapshot::new(summary(&[("active", 100.0), ("mrr", 1000.0)]));
        let current = MetricSnapshot::new(summary(&[("active", 120.0), ("mrr", 1005.0), ("churn", 2.0)]));

        let first = classify_snapshot(&current, None);
        assert!(first.values().all(|t| *t == Trend::Stable));

        let trends = classify_snapshot(&current, Some(&previous));
        assert_eq!(trends.get("active"), Some(&Trend::Up));
        assert_eq!(trends.get("mrr"), Some(&Trend::Stable));
        assert_eq!(trends.get("churn"), Some(&Trend::Stable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_classifies_each_tick() {
        let source = Arc::new(MemorySource::<Nothing>::new());
        source.set_summary("users", summary(&[("active", 100.0), ("mrr", 500.0)]));
        let cache = QueryCache::default();
        let mut metrics = TrendMetrics::new(poller(&source, &cache)).unwrap();
        assert!(metrics.is_loading());

        while metrics.is_loading() {
            metrics.changed().await;
        }
        assert_eq!(metrics.values().get("active"), Some(&100.0));
        assert!(metrics.trends().values().all(|t| *t == Trend::Stable));

        source.set_summary("users", summary(&[("active", 150.0), ("mrr", 490.0)]));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(source.summary_calls(), 2);
        assert_eq!(metrics.values().get("active"), Some(&150.0));
        assert_eq!(metrics.trends().get("active"), Some(&Trend::Up));
        assert_eq!(metrics.trends().get("mrr"), Some(&Trend::Down));
        assert!(metrics.last_updated().is_some());
        assert!(metrics.error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refcounted_lifecycle() {
        let source = Arc::new(MemorySource::<Nothing>::new());
        source.set_summary("users", summary(&[("active", 1.0)]));
        let cache = QueryCache::default();
        let poller = poller(&source, &cache);

        let first = TrendMetrics::new(poller.clone()).unwrap();
        let second = TrendMetrics::new(poller.clone()).unwrap();
        assert_eq!(poller.consumers(), 2);
        assert!(poller.is_running());
        assert_eq!(cache.active_refetch_timers(), 1);

        drop(first);
        assert!(poller.is_running());
        drop(second);
        assert!(!poller.is_running());

        // Let the aborted task unwind and drop its subscription
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.active_refetch_timers(), 0);
        let calls = source.summary_calls();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.summary_calls(), calls);

        // Stopping more often than started is harmless
        poller.stop();
        assert_eq!(poller.consumers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_keeps_last_values() {
        let source = Arc::new(MemorySource::<Nothing>::new());
        source.set_summary("users", summary(&[("active", 10.0)]));
        let cache = QueryCache::default();
        let options = QueryOptions::default().with_max_retries(0);
        let poller = TrendPoller::new(cache, Arc::clone(&source), "users", Duration::from_secs(30), options).unwrap();
        let mut metrics = TrendMetrics::new(poller).unwrap();
        while metrics.is_loading() {
            metrics.changed().await;
        }

        source.fail_next(SourceError::Network("unreachable".into()));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(metrics.error(), Some(SourceError::Network("unreachable".into())));
        assert_eq!(metrics.values().get("active"), Some(&10.0));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let source = Arc::new(MemorySource::<Nothing>::new());
        let result = TrendPoller::new(QueryCache::default(), source, "users", Duration::ZERO, QueryOptions::default());
        assert!(matches!(result, Err(ConfigurationError::Zero { .. })));
    }
}
