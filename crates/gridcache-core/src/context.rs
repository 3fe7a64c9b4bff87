//! Cache context: one query cache plus the defaults and shared pollers built
//! on top of it. Consumers receive a context instead of reaching for a
//! global, so independent caches can coexist (tests create one each).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::cache::store::lock;
use crate::cache::{BaseQuery, QueryCache, QueryHandle, QueryKey, QueryOptions};
use crate::config::Settings;
use crate::error::{ConfigurationError, SourceError};
use crate::grid::{Column, VirtualizedGrid};
use crate::scroll::{ScrollCoordinator, DEFAULT_PREFETCH_THRESHOLD};
use crate::source::RecordSource;
use crate::trend::{TrendMetrics, TrendPoller};
use crate::window::{WindowSpec, DEFAULT_OVERSCAN};

/// Rows per page unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDefaults {
    pub page_size: usize,
    pub prefetch_threshold: usize,
    pub overscan: usize,
}

impl Default for GridDefaults {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            prefetch_threshold: DEFAULT_PREFETCH_THRESHOLD,
            overscan: DEFAULT_OVERSCAN,
        }
    }
}

pub struct CacheContext {
    cache: QueryCache,
    settings: Settings,
    pollers: Mutex<HashMap<String, TrendPoller>>,
}

impl Default for CacheContext {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl CacheContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            cache: QueryCache::new(settings.sweep_interval),
            settings,
            pollers: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to `key` with the context's default options
    pub fn query<T, F, Fut>(&self, key: QueryKey, fetch: F) -> Result<QueryHandle<T>, ConfigurationError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SourceError>> + Send + 'static,
    {
        self.cache.query(key, fetch, self.settings.query_options)
    }

    pub fn query_with<T, F, Fut>(
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
        self.cache.query(key, fetch, options)
    }

    /// Build a grid over `resource` and request its first page.
    pub fn virtualized_grid<S: RecordSource>(
        &self,
        source: Arc<S>,
        resource: &str,
        columns: Vec<Column<S::Row>>,
        row_height: f32,
        viewport_height: f32,
    ) -> Result<VirtualizedGrid<S>, ConfigurationError> {
        let grid = self.settings.grid;
        let spec = WindowSpec::new(row_height, viewport_height)?.with_overscan(grid.overscan);
        let coordinator = ScrollCoordinator::new(
            self.cache.clone(),
            source,
            BaseQuery::new(resource, grid.page_size),
            self.settings.query_options,
        )
        .with_threshold(grid.prefetch_threshold);
        Ok(VirtualizedGrid::new(coordinator, columns, spec))
    }

    /// Start (or join) polling of a metric group. Every group has a single
    /// poller shared by all of its consumers; the interval of the first
    /// request is kept.
    pub fn trend_metrics<S: RecordSource>(
        &self,
        source: Arc<S>,
        group: &str,
        interval: Option<Duration>,
    ) -> Result<TrendMetrics, ConfigurationError> {
        let poller = {
            let mut pollers = lock(&self.pollers);
            match pollers.get(group) {
                Some(poller) => poller.clone(),
                None => {
                    let poller = TrendPoller::new(
                        self.cache.clone(),
                        source,
                        group,
                        interval.unwrap_or(self.settings.trend_interval),
                        self.settings.query_options,
                    )?;
                    debug!(group = %group, "Trend poller created");
                    pollers.insert(group.to_string(), poller.clone());
                    poller
                }
            }
        };
        TrendMetrics::new(poller)
    }

    pub fn poller(&self, group: &str) -> Option<TrendPoller> {
        lock(&self.pollers).get(group).cloned()
    }

    /// Invalidate every cached query matching `predicate`
    pub fn invalidate<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryKey) -> bool,
    {
        self.cache.invalidate(predicate)
    }
}
