//! Virtualized grid.
//!
//! Glues a `ScrollCoordinator` to the windowing functions: scroll events
//! recompute the visible window (at most once per frame), every recomputed
//! window is reported back to the coordinator so it can prefetch, and only
//! the rows inside the window are handed to the renderer.

use tokio::time::Instant;

use crate::cache::Filters;
use crate::error::{ConfigurationError, QueryError};
use crate::scroll::{ScrollCoordinator, ScrollState};
use crate::source::RecordSource;
use crate::window::{compute_window, materialize, FrameThrottle, Placeholder, VisibleWindow, WindowSpec};

/// Column definition for the grid
pub struct Column<R> {
    /// Column identifier
    pub id: String,
    /// Column header label
    pub label: String,
    pub width: ColumnWidth,
    /// Cell renderer function
    pub render: Box<dyn Fn(&R) -> String + Send + Sync>,
}

/// Column width, in terminal cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnWidth {
    Fixed(u16),
    /// Takes what is left, at least `min`
    Flex { min: u16 },
    /// Percentage of the available width
    Percent(u16),
}

impl Default for ColumnWidth {
    fn default() -> Self {
        ColumnWidth::Flex { min: 0 }
    }
}

impl<R: 'static> Column<R> {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        render: impl Fn(&R) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            width: ColumnWidth::default(),
            render: Box::new(render),
        }
    }

    pub fn fixed_width(mut self, width: u16) -> Self {
        self.width = ColumnWidth::Fixed(width);
        self
    }

    pub fn flex_width(mut self, min: u16) -> Self {
        self.width = ColumnWidth::Flex { min };
        self
    }

    pub fn percent_width(mut self, percent: u16) -> Self {
        self.width = ColumnWidth::Percent(percent);
        self
    }

    pub fn render_cell(&self, row: &R) -> String {
        (self.render)(row)
    }
}

impl<R> std::fmt::Debug for Column<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("width", &self.width)
            .finish()
    }
}

pub struct VirtualizedGrid<S: RecordSource> {
    coordinator: ScrollCoordinator<S>,
    columns: Vec<Column<S::Row>>,
    spec: WindowSpec,
    throttle: FrameThrottle,
    scroll_offset: f32,
    window: Option<VisibleWindow>,
}

impl<S: RecordSource> VirtualizedGrid<S> {
    /// Build the grid and request the first page.
    pub fn new(coordinator: ScrollCoordinator<S>, columns: Vec<Column<S::Row>>, spec: WindowSpec) -> Self {
        let mut grid = Self {
            coordinator,
            columns,
            spec,
            throttle: FrameThrottle::default(),
            scroll_offset: 0.0,
            window: None,
        };
        grid.coordinator.start();
        grid
    }

    pub fn with_throttle(mut self, throttle: FrameThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    // ===== Scrolling =====

    /// Handle a scroll event. Returns true if the window was recomputed;
    /// events within the same frame are coalesced and applied by `sync`.
    pub fn on_scroll(&mut self, offset: f32) -> bool {
        match self.throttle.offer(offset, Instant::now()) {
            Some(offset) => {
                self.apply_scroll(offset);
                true
            }
            None => false,
        }
    }

    /// Scroll so that `index` is the first visible row
    pub fn scroll_to_index(&mut self, index: usize) -> bool {
        self.on_scroll(self.spec.offset_of(index))
    }

    /// Scroll by a number of rows, negative for up
    pub fn scroll_by_rows(&mut self, rows: isize) -> bool {
        let delta = rows as f32 * self.spec.row_height;
        self.on_scroll(self.scroll_offset + delta)
    }

    /// Report the current window to the coordinator. Returns true if this
    /// started a page fetch.
    pub fn on_items_rendered(&mut self) -> bool {
        self.coordinator.on_items_rendered(self.window)
    }

    /// Apply pending scroll events and arrived pages, then re-check whether
    /// the next page is needed. Meant to run once per UI tick.
    pub fn sync(&mut self) -> usize {
        if let Some(offset) = self.throttle.flush(Instant::now()) {
            self.apply_scroll(offset);
        }
        let applied = self.coordinator.sync();
        if applied > 0 {
            self.recompute();
        }
        applied
    }

    /// Wait for the next page and apply it
    pub async fn next_arrival(&mut self) -> bool {
        let applied = self.coordinator.next_arrival().await;
        if applied {
            self.recompute();
        }
        applied
    }

    /// Wait until no page fetch is in flight
    pub async fn settle(&mut self) {
        self.coordinator.settle().await;
        self.recompute();
    }

    fn apply_scroll(&mut self, offset: f32) {
        let max = self.spec.max_offset(self.coordinator.rows().len());
        self.scroll_offset = if offset.is_finite() { offset.clamp(0.0, max) } else { 0.0 };
        self.recompute();
    }

    fn recompute(&mut self) {
        self.window = compute_window(&self.spec, self.scroll_offset, self.coordinator.rows().len());
        self.coordinator.on_items_rendered(self.window);
    }

    // ===== Query changes =====

    /// Reset to the top and load the first page for `search`
    pub fn set_search(&mut self, search: Option<String>) -> bool {
        if !self.coordinator.set_search(search) {
            return false;
        }
        self.reset_view();
        true
    }

    pub fn set_filters(&mut self, filters: Filters) -> bool {
        if !self.coordinator.set_filters(filters) {
            return false;
        }
        self.reset_view();
        true
    }

    /// Invalidate the cached pages and reload from the top
    pub fn refresh(&mut self) {
        self.coordinator.invalidate();
        self.reset_view();
    }

    pub fn retry(&mut self) -> bool {
        self.coordinator.retry()
    }

    pub fn set_viewport_height(&mut self, height: f32) -> Result<(), ConfigurationError> {
        let spec = WindowSpec {
            viewport_height: height,
            ..self.spec
        };
        spec.validate()?;
        if spec != self.spec {
            self.spec = spec;
            self.apply_scroll(self.scroll_offset);
        }
        Ok(())
    }

    fn reset_view(&mut self) {
        self.scroll_offset = 0.0;
        self.window = None;
        self.throttle = FrameThrottle::default();
    }

    // ===== Reading =====

    pub fn columns(&self) -> &[Column<S::Row>] {
        &self.columns
    }

    /// Materialized rows with their absolute indices
    pub fn visible_rows(&self) -> Vec<(usize, &S::Row)> {
        materialize(self.coordinator.rows(), self.window).collect()
    }

    /// Cell text of a row, one entry per column
    pub fn render_row(&self, row: &S::Row) -> Vec<String> {
        self.columns.iter().map(|column| column.render_cell(row)).collect()
    }

    /// The underlying row at `index`, if it is currently materialized
    pub fn row_at(&self, index: usize) -> Option<&S::Row> {
        match self.window {
            Some(window) if window.contains(index) => self.coordinator.rows().get(index),
            _ => None,
        }
    }

    pub fn placeholder(&self) -> Placeholder {
        Placeholder::new(&self.spec, self.coordinator.rows().len(), self.window)
    }

    pub fn window(&self) -> Option<VisibleWindow> {
        self.window
    }

    pub fn window_spec(&self) -> &WindowSpec {
        &self.spec
    }

    pub fn scroll_offset(&self) -> f32 {
        self.scroll_offset
    }

    /// Index of the first row in the viewport
    pub fn first_visible_index(&self) -> usize {
        (self.scroll_offset / self.spec.row_height).floor() as usize
    }

    pub fn loaded_count(&self) -> usize {
        self.coordinator.rows().len()
    }

    pub fn total_count(&self) -> usize {
        self.coordinator.total_count()
    }

    pub fn has_next_page(&self) -> bool {
        self.coordinator.has_next_page()
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.coordinator.is_fetching_next_page()
    }

    pub fn is_loading(&self) -> bool {
        self.coordinator.is_fetching_first_page()
    }

    pub fn state(&self) -> ScrollState {
        self.coordinator.state()
    }

    pub fn search(&self) -> Option<&str> {
        self.coordinator.base().search.as_deref()
    }

    pub fn last_error(&self) -> Option<&QueryError> {
        self.coordinator.last_error()
    }

    pub fn coordinator(&self) -> &ScrollCoordinator<S> {
        &self.coordinator
    }
}
