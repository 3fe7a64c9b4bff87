use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use super::{validate_rows, Page, PageRequest, RecordSource, Row, Summary};
use crate::cache::store::lock;
use crate::error::SourceError;

/// In-process record source.
///
/// Holds one table per resource, answers searches with `Row::matches_search`
/// and filters with `Row::field`. Latency and scripted failures make it
/// usable for exercising retries and in-flight races.
pub struct MemorySource<R> {
    tables: Mutex<HashMap<String, Vec<R>>>,
    summaries: Mutex<HashMap<String, Summary>>,
    latency: Duration,
    failures: Mutex<VecDeque<SourceError>>,
    page_calls: AtomicUsize,
    summary_calls: AtomicUsize,
}

impl<R: Row> Default for MemorySource<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Row> MemorySource<R> {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            page_calls: AtomicUsize::new(0),
            summary_calls: AtomicUsize::new(0),
        }
    }

    /// Delay every response by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_table(self, resource: impl Into<String>, rows: Vec<R>) -> Self {
        self.set_rows(resource, rows);
        self
    }

    /// Replace a whole table
    pub fn set_rows(&self, resource: impl Into<String>, rows: Vec<R>) {
        lock(&self.tables).insert(resource.into(), rows);
    }

    /// Append rows to a table, creating it if needed
    pub fn push_rows(&self, resource: &str, rows: impl IntoIterator<Item = R>) {
        lock(&self.tables)
            .entry(resource.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn row_count(&self, resource: &str) -> usize {
        lock(&self.tables).get(resource).map_or(0, Vec::len)
    }

    pub fn set_summary(&self, resource: impl Into<String>, summary: Summary) {
        lock(&self.summaries).insert(resource.into(), summary);
    }

    /// Make the next call (page or summary) fail with `error`
    pub fn fail_next(&self, error: SourceError) {
        lock(&self.failures).push_back(error);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Option<SourceError> {
        lock(&self.failures).pop_front()
    }

    fn answer_page(&self, request: &PageRequest) -> Result<Page<R>, SourceError> {
        let tables = lock(&self.tables);
        let table = tables
            .get(&request.resource)
            .ok_or_else(|| SourceError::NotFound(request.resource.clone()))?;

        let matching: Vec<&R> = table
            .iter()
            .filter(|row| {
                request
                    .search
                    .as_deref()
                    .map_or(true, |term| row.matches_search(term))
            })
            .filter(|row| {
                request
                    .filters
                    .iter()
                    .all(|(column, value)| row.field(column).as_deref() == Some(value))
            })
            .collect();

        let rows: Vec<R> = matching
            .iter()
            .skip(request.offset())
            .take(request.page_size)
            .map(|row| (*row).clone())
            .collect();
        validate_rows(&request.resource, &rows)?;

        Ok(Page {
            rows,
            total_count: matching.len(),
            page_index: request.page_index,
        })
    }
}

impl<R: Row> RecordSource for MemorySource<R> {
    type Row = R;

    async fn fetch_page(&self, request: PageRequest) -> Result<Page<R>, SourceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = self.take_failure() {
            debug!(resource = %request.resource, page = request.page_index, error = %err, "Scripted failure");
            return Err(err);
        }
        self.answer_page(&request)
    }

    async fn fetch_summary(&self, resource: &str) -> Result<Summary, SourceError> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        lock(&self.summaries)
            .get(resource)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("{}/summary", resource)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BaseQuery, Filters};

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: usize,
        name: String,
        plan: &'static str,
    }

    impl Row for Item {
        type Id = usize;

        fn id(&self) -> usize {
            self.id
        }

        fn matches_search(&self, term: &str) -> bool {
            self.name.contains(term)
        }

        fn field(&self, name: &str) -> Option<String> {
            match name {
                "plan" => Some(self.plan.to_string()),
                _ => None,
            }
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|id| Item {
                id,
                name: format!("item-{}", id),
                plan: if id % 2 == 0 { "free" } else { "pro" },
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pages_slice_the_table() {
        let source = MemorySource::new().with_table("items", items(120));
        let base = BaseQuery::new("items", 50);

        let last = source.fetch_page(PageRequest::for_page(&base, 2)).await.unwrap();
        assert_eq!(last.total_count, 120);
        assert_eq!(last.rows.len(), 20);
        assert_eq!(last.rows[0].id, 100);
        assert_eq!(source.page_calls(), 1);
    }

    #[tokio::test]
    async fn test_search_and_filters() {
        let source = MemorySource::new().with_table("items", items(120));
        let base = BaseQuery::new("items", 50)
            .with_search(Some("item-1".into()))
            .with_filters(Filters::new().with("plan", "pro"));

        let page = source.fetch_page(PageRequest::for_page(&base, 0)).await.unwrap();
        // item-1, item-11, item-13, ..., item-19, item-101, ..., item-119
        assert!(page.rows.iter().all(|r| r.plan == "pro" && r.name.starts_with("item-1")));
        assert_eq!(page.total_count, page.rows.len());
        assert_eq!(page.total_count, 16);
    }

    #[tokio::test]
    async fn test_scripted_failure_then_recovery() {
        let source = MemorySource::new().with_table("items", items(3));
        source.fail_next(SourceError::RateLimited);
        let base = BaseQuery::new("items", 50);

        let first = source.fetch_page(PageRequest::for_page(&base, 0)).await;
        assert_eq!(first.unwrap_err(), SourceError::RateLimited);
        let second = source.fetch_page(PageRequest::for_page(&base, 0)).await;
        assert_eq!(second.unwrap().rows.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_resource_and_summary() {
        let source: MemorySource<Item> = MemorySource::new();
        let base = BaseQuery::new("missing", 10);
        assert!(matches!(
            source.fetch_page(PageRequest::for_page(&base, 0)).await,
            Err(SourceError::NotFound(_))
        ));

        let mut summary = Summary::new();
        summary.insert("active".into(), 10.0);
        source.set_summary("items", summary.clone());
        assert_eq!(source.fetch_summary("items").await.unwrap(), summary);
        assert_eq!(source.summary_calls(), 1);
    }
}
