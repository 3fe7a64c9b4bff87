//! Record sources: where pages and summaries come from.
//!
//! - `http`: a remote tabular data service reached over HTTP/JSON
//! - `memory`: an in-process table, for tests and demo mode
//!
//! Every row type declares its schema through the `Row` trait; sources
//! validate rows as they cross this boundary, so nothing loosely-typed
//! reaches the cache.

pub mod http;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

use crate::cache::{BaseQuery, Filters};
use crate::error::SourceError;

pub use http::HttpRecordSource;
pub use memory::MemorySource;

/// Scalar metrics of a resource, keyed by metric name.
pub type Summary = BTreeMap<String, f64>;

/// Declared schema of one record type.
pub trait Row: Clone + Send + Sync + 'static {
    type Id: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// Stable identity, used to keep the accumulated list free of duplicates
    fn id(&self) -> Self::Id;

    /// Reject rows that do not satisfy the schema
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Whether the row matches a free-text search term
    fn matches_search(&self, _term: &str) -> bool {
        true
    }

    /// Column value used for equality filters
    fn field(&self, _name: &str) -> Option<String> {
        None
    }
}

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<R> {
    pub rows: Vec<R>,
    pub total_count: usize,
    pub page_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub resource: String,
    pub page_index: usize,
    pub page_size: usize,
    pub search: Option<String>,
    pub filters: Filters,
}

impl PageRequest {
    pub fn for_page(base: &BaseQuery, page_index: usize) -> Self {
        Self {
            resource: base.resource.clone(),
            page_index,
            page_size: base.page_size,
            search: base.search.clone(),
            filters: base.filters.clone(),
        }
    }

    /// Offset of the first row of this page
    pub fn offset(&self) -> usize {
        self.page_index.saturating_mul(self.page_size)
    }
}

/// The data service the cache reads from. Both calls must be idempotent:
/// the cache retries them freely.
pub trait RecordSource: Send + Sync + 'static {
    type Row: Row;

    fn fetch_page(
        &self,
        request: PageRequest,
    ) -> impl Future<Output = Result<Page<Self::Row>, SourceError>> + Send;

    fn fetch_summary(
        &self,
        resource: &str,
    ) -> impl Future<Output = Result<Summary, SourceError>> + Send;
}

/// Check every row of a page against its schema
pub fn validate_rows<R: Row>(resource: &str, rows: &[R]) -> Result<(), SourceError> {
    for (index, row) in rows.iter().enumerate() {
        row.validate().map_err(|reason| SourceError::Schema {
            resource: resource.to_string(),
            index,
            reason,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Named(u32, String);

    impl Row for Named {
        type Id = u32;

        fn id(&self) -> u32 {
            self.0
        }

        fn validate(&self) -> Result<(), String> {
            if self.1.is_empty() {
                Err("name is empty".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_validate_rows_reports_first_bad_row() {
        let rows = vec![Named(1, "a".into()), Named(2, String::new())];
        let err = validate_rows("users", &rows).unwrap_err();
        assert_eq!(
            err,
            SourceError::Schema {
                resource: "users".into(),
                index: 1,
                reason: "name is empty".into()
            }
        );
        assert!(validate_rows("users", &rows[..1]).is_ok());
    }

    #[test]
    fn test_page_request_offset() {
        let base = BaseQuery::new("users", 50);
        assert_eq!(PageRequest::for_page(&base, 0).offset(), 0);
        assert_eq!(PageRequest::for_page(&base, 3).offset(), 150);
    }
}
