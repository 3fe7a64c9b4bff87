use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::accumulator::{Accumulator, AppendOutcome};
use crate::cache::{BaseQuery, Filters, QueryCache, QueryOptions};
use crate::error::{ConsistencyFault, QueryError};
use crate::source::{Page, PageRequest, RecordSource};
use crate::window::VisibleWindow;

/// Rows left below the visible window that trigger the next page.
pub const DEFAULT_PREFETCH_THRESHOLD: usize = 10;

/// Buffer size for the page arrival channel
const CHANNEL_BUFFER_SIZE: usize = 32;

/// Consecutive consistency faults tolerated before giving up on a list
const MAX_RECOVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollState {
    Idle,
    FetchingFirstPage,
    Ready,
    FetchingNextPage,
    /// Every page has been loaded; stays here until invalidated
    Exhausted,
}

impl fmt::Display for ScrollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScrollState::Idle => "idle",
            ScrollState::FetchingFirstPage => "loading",
            ScrollState::Ready => "ready",
            ScrollState::FetchingNextPage => "loading more",
            ScrollState::Exhausted => "all rows loaded",
        };
        f.write_str(label)
    }
}

/// Result of one page fetch, tagged with what was current when it was issued.
struct PageArrival<R> {
    generation: u64,
    base: BaseQuery,
    page_index: usize,
    result: Result<Arc<Page<R>>, QueryError>,
}

/// Drives incremental page loading for one scrollable list.
///
/// Fetches run in background tasks through the query cache and report back
/// over a channel; `sync` (or `next_arrival`) applies them. Every fetch is
/// tagged with a generation that changes on each reset, so pages issued for
/// a superseded search or filter set are dropped on arrival.
pub struct ScrollCoordinator<S: RecordSource> {
    cache: QueryCache,
    source: Arc<S>,
    options: QueryOptions,
    threshold: usize,
    accumulator: Accumulator<S::Row>,
    state: ScrollState,
    generation: u64,
    in_flight: Option<usize>,
    last_error: Option<QueryError>,
    consecutive_faults: u32,
    consistency_faults: usize,
    stale_dropped: usize,
    arrival_tx: mpsc::Sender<PageArrival<S::Row>>,
    arrival_rx: mpsc::Receiver<PageArrival<S::Row>>,
}

impl<S: RecordSource> ScrollCoordinator<S> {
    pub fn new(cache: QueryCache, source: Arc<S>, base: BaseQuery, options: QueryOptions) -> Self {
        let (arrival_tx, arrival_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        Self {
            cache,
            source,
            options,
            threshold: DEFAULT_PREFETCH_THRESHOLD,
            accumulator: Accumulator::new(base),
            state: ScrollState::Idle,
            generation: 0,
            in_flight: None,
            last_error: None,
            consecutive_faults: 0,
            consistency_faults: 0,
            stale_dropped: 0,
            arrival_tx,
            arrival_rx,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    // ===== Accessors =====

    pub fn state(&self) -> ScrollState {
        self.state
    }

    pub fn base(&self) -> &BaseQuery {
        self.accumulator.base()
    }

    pub fn rows(&self) -> &[S::Row] {
        self.accumulator.rows()
    }

    /// Total reported by the newest page, 0 before the first one lands
    pub fn total_count(&self) -> usize {
        self.accumulator.total_count().unwrap_or(0)
    }

    pub fn has_next_page(&self) -> bool {
        self.accumulator.has_next_page()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_fetching_first_page(&self) -> bool {
        self.state == ScrollState::FetchingFirstPage
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.state == ScrollState::FetchingNextPage
    }

    pub fn last_error(&self) -> Option<&QueryError> {
        self.last_error.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn consistency_faults(&self) -> usize {
        self.consistency_faults
    }

    /// Arrivals dropped because their generation or base query was superseded
    pub fn stale_dropped(&self) -> usize {
        self.stale_dropped
    }

    // ===== Transitions =====

    /// Fetch the first page if nothing has been loaded yet
    pub fn start(&mut self) -> bool {
        if self.state != ScrollState::Idle || self.in_flight.is_some() {
            return false;
        }
        self.issue(0);
        true
    }

    /// Called after the renderer materialized `window`. Requests the next
    /// page when the window is close enough to the end of the loaded rows.
    ///
    /// A failed page is not requested again from here; it waits for
    /// `retry`, `invalidate` or a query change.
    pub fn on_items_rendered(&mut self, window: Option<VisibleWindow>) -> bool {
        if self.state != ScrollState::Ready || self.in_flight.is_some() {
            return false;
        }
        if self.last_error.is_some() {
            return false;
        }
        if !self.accumulator.has_next_page() {
            self.state = ScrollState::Exhausted;
            return false;
        }

        let loaded = self.accumulator.len();
        let rendered_to = window.map_or(0, |w| w.stop_index + 1);
        if loaded.saturating_sub(rendered_to) > self.threshold {
            return false;
        }
        self.fetch_next_page()
    }

    /// Switch to a new search term. Resets synchronously; returns false if
    /// the term did not change.
    pub fn set_search(&mut self, search: Option<String>) -> bool {
        let next = self.base().clone().with_search(search);
        self.switch_base(next)
    }

    pub fn set_filters(&mut self, filters: Filters) -> bool {
        let next = self.base().clone().with_filters(filters);
        self.switch_base(next)
    }

    /// Mark this list's cached pages stale and load it again from page 0.
    /// This is the only way out of `Exhausted`.
    pub fn invalidate(&mut self) {
        let base = self.base().clone();
        self.cache.invalidate(|key| key.belongs_to(&base));
        info!(base = %base, "List invalidated");
        self.reset(base);
        self.start();
    }

    /// Reissue the page whose fetch failed
    pub fn retry(&mut self) -> bool {
        if self.last_error.is_none() || self.in_flight.is_some() {
            return false;
        }
        self.last_error = None;
        if self.accumulator.pages_appended() == 0 {
            self.state = ScrollState::Idle;
            self.start()
        } else {
            self.fetch_next_page()
        }
    }

    // ===== Arrivals =====

    /// Apply every page that has arrived so far. Returns how many were
    /// applied (stale ones are not counted).
    pub fn sync(&mut self) -> usize {
        let mut arrivals = Vec::new();
        while let Ok(arrival) = self.arrival_rx.try_recv() {
            arrivals.push(arrival);
        }

        let mut applied = 0;
        for arrival in arrivals {
            if self.apply(arrival) {
                applied += 1;
            }
        }
        applied
    }

    /// Wait for the next page to arrive and apply it. Returns immediately
    /// with false when nothing is in flight.
    pub async fn next_arrival(&mut self) -> bool {
        if self.in_flight.is_none() {
            return self.sync() > 0;
        }
        match self.arrival_rx.recv().await {
            Some(arrival) => self.apply(arrival),
            None => false,
        }
    }

    /// Wait until no fetch is in flight
    pub async fn settle(&mut self) {
        while self.in_flight.is_some() {
            self.next_arrival().await;
        }
    }

    fn apply(&mut self, arrival: PageArrival<S::Row>) -> bool {
        if arrival.generation != self.generation || &arrival.base != self.base() {
            debug!(
                base = %arrival.base,
                page = arrival.page_index,
                "Dropping page from superseded query"
            );
            self.stale_dropped += 1;
            return false;
        }
        if self.in_flight != Some(arrival.page_index) {
            debug!(page = arrival.page_index, "Dropping unexpected page arrival");
            self.stale_dropped += 1;
            return false;
        }
        self.in_flight = None;

        let page = match arrival.result {
            Ok(page) => page,
            Err(e) => {
                warn!(base = %arrival.base, page = arrival.page_index, error = %e, "Page fetch failed");
                self.last_error = Some(e);
                self.state = if self.accumulator.pages_appended() == 0 {
                    ScrollState::Idle
                } else {
                    ScrollState::Ready
                };
                return true;
            }
        };

        match self.accumulator.offer(&page) {
            AppendOutcome::Appended { added, duplicates } => {
                self.last_error = None;
                self.consecutive_faults = 0;
                if duplicates > 0 {
                    debug!(page = page.page_index, duplicates, "Skipped rows already in the list");
                }
                self.state = if self.accumulator.has_next_page() {
                    ScrollState::Ready
                } else {
                    ScrollState::Exhausted
                };
                debug!(
                    base = %arrival.base,
                    page = page.page_index,
                    added,
                    loaded = self.accumulator.len(),
                    total = self.total_count(),
                    state = %self.state,
                    "Page appended"
                );
            }
            AppendOutcome::Rejected(fault) => self.recover(fault),
        }
        true
    }

    // ===== Internals =====

    fn switch_base(&mut self, next: BaseQuery) -> bool {
        if &next == self.base() {
            return false;
        }
        info!(base = %next, "Query changed, resetting list");
        self.reset(next);
        self.start();
        true
    }

    fn reset(&mut self, base: BaseQuery) {
        self.generation = self.generation.wrapping_add(1);
        self.accumulator.reset(base);
        self.state = ScrollState::Idle;
        self.in_flight = None;
        self.last_error = None;
        self.consecutive_faults = 0;
    }

    fn fetch_next_page(&mut self) -> bool {
        if !self.accumulator.is_aligned() {
            // Rows shifted between pages; the next page would not continue
            // the list where it ends
            let fault = ConsistencyFault {
                base: self.base().to_string(),
                expected: self.accumulator.len() / self.base().page_size.max(1),
                received: self.accumulator.pages_appended(),
            };
            self.recover(fault);
            return self.in_flight.is_some();
        }
        self.issue(self.accumulator.expected_page());
        true
    }

    fn recover(&mut self, fault: ConsistencyFault) {
        self.consistency_faults += 1;
        self.consecutive_faults += 1;
        warn!(fault = %fault, "Consistency fault");

        if self.consecutive_faults > MAX_RECOVERY_ATTEMPTS {
            error!(
                base = %self.base(),
                attempts = self.consecutive_faults,
                "Source keeps returning inconsistent pages, not loading more"
            );
            self.state = ScrollState::Exhausted;
            return;
        }

        let base = self.base().clone();
        let derived = self.accumulator.len() / base.page_size.max(1);
        if derived == self.accumulator.pages_appended() && self.accumulator.is_aligned() {
            // Drop the bad copy so the refetch reaches the source
            self.cache.remove(&base.page(derived));
            self.issue(derived);
        } else {
            self.cache.invalidate(|key| key.belongs_to(&base));
            let faults = self.consecutive_faults;
            self.reset(base);
            self.consecutive_faults = faults;
            self.issue(0);
        }
    }

    fn issue(&mut self, page_index: usize) {
        self.state = if page_index == 0 {
            ScrollState::FetchingFirstPage
        } else {
            ScrollState::FetchingNextPage
        };
        self.in_flight = Some(page_index);

        let base = self.base().clone();
        let key = base.page(page_index);
        let request = PageRequest::for_page(&base, page_index);
        let generation = self.generation;
        let cache = self.cache.clone();
        let source = Arc::clone(&self.source);
        let options = self.options;
        let tx = self.arrival_tx.clone();

        debug!(key = %key, generation, "Requesting page");

        tokio::spawn(async move {
            let result = cache
                .fetch(
                    key,
                    move || {
                        let source = Arc::clone(&source);
                        let request = request.clone();
                        async move { source.fetch_page(request).await }
                    },
                    options,
                )
                .await;

            let arrival = PageArrival {
                generation,
                base,
                page_index,
                result,
            };
            if tx.send(arrival).await.is_err() {
                debug!(page = page_index, "Coordinator gone before page arrived");
            }
        });
    }
}

impl<S: RecordSource> fmt::Debug for ScrollCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrollCoordinator")
            .field("base", self.base())
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("loaded", &self.accumulator.len())
            .field("total", &self.accumulator.total_count())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
