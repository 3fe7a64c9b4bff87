//! Core library for gridcache.
//!
//! A client-side query cache with staleness, retries and deduplicated
//! fetches, and on top of it an incrementally loaded, windowed data grid and
//! a metric trend poller.
//!
//! - `cache`: query keys, entries, the entry store, policy and the engine
//! - `source`: the record source trait and its HTTP and in-memory versions
//! - `scroll`: page accumulation and the infinite scroll state machine
//! - `window`: visible row computation, placeholders and frame throttling
//! - `grid`: the virtualized grid combining the two above
//! - `trend`: summary polling and up/down/stable classification
//! - `context`: an injectable bundle of cache, defaults and pollers
//! - `config`: on-disk configuration

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod grid;
pub mod scroll;
pub mod source;
pub mod trend;
pub mod window;

pub use cache::{BaseQuery, Filters, FetchStatus, QueryCache, QueryHandle, QueryKey, QueryOptions, QueryState};
pub use config::{GridCacheConfig, Settings};
pub use context::{CacheContext, GridDefaults};
pub use error::{ConfigurationError, ConsistencyFault, QueryError, SourceError};
pub use grid::{Column, ColumnWidth, VirtualizedGrid};
pub use scroll::{ScrollCoordinator, ScrollState};
pub use source::{HttpRecordSource, MemorySource, Page, PageRequest, RecordSource, Row, Summary};
pub use trend::{MetricSnapshot, Trend, TrendMetrics, TrendPoller, TrendView};
pub use window::{compute_window, Placeholder, VisibleWindow, WindowSpec};
