//! Application state for the viewer.
//!
//! `App` owns the user grid and the metric trends, plus the cursor and the
//! search box. Nothing here blocks: page fetches run on the runtime and
//! `tick` folds their results in once per UI loop iteration.

use std::sync::Arc;

use anyhow::Result;
use gridcache_core::{CacheContext, Column, Filters, TrendMetrics, VirtualizedGrid};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::models::{Plan, User};
use crate::source::UserSource;
use crate::utils::{format_money, truncate_string};

/// Rows moved by a mouse wheel notch
pub const WHEEL_SCROLL_ROWS: usize = 3;

/// Metric group polled for the side panel
pub const METRICS_GROUP: &str = "users";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Normal,
    Searching,
    ShowingHelp,
    ShowingDetail,
    Quitting,
}

pub struct App {
    pub state: AppState,
    pub grid: VirtualizedGrid<UserSource>,
    pub metrics: TrendMetrics,
    /// Absolute index of the highlighted row
    pub cursor: usize,
    /// First row of the viewport as last requested
    pub view_top: usize,
    viewport_rows: usize,
    pub search_query: String,
    pub plan_filter: Option<Plan>,
    pub selected: Option<User>,
    pub status_message: Option<String>,
    pub source_label: String,
    drift: Option<JoinHandle<()>>,
}

fn user_columns() -> Vec<Column<User>> {
    vec![
        Column::new("id", "ID", |u: &User| format!("{:>6}", u.id)).fixed_width(7),
        Column::new("name", "Name", |u: &User| u.name.clone()).percent_width(25),
        Column::new("email", "Email", |u: &User| truncate_string(&u.email, 40)).flex_width(20),
        Column::new("plan", "Plan", |u: &User| u.plan.to_string()).fixed_width(6),
        Column::new("status", "Status", |u: &User| u.status.to_string()).fixed_width(8),
        Column::new("mrr", "MRR", |u: &User| format!("{:>6}", format_money(u.mrr))).fixed_width(8),
        Column::new("created", "Created", |u: &User| u.created_str()).fixed_width(10),
    ]
}

impl App {
    pub fn new(
        context: &CacheContext,
        source: Arc<UserSource>,
        resource: &str,
        viewport_rows: usize,
    ) -> Result<Self> {
        let viewport_rows = viewport_rows.max(1);
        let source_label = source.label();
        let grid = context.virtualized_grid(
            Arc::clone(&source),
            resource,
            user_columns(),
            1.0,
            viewport_rows as f32,
        )?;
        let metrics = context.trend_metrics(source, METRICS_GROUP, None)?;
        info!(resource = %resource, source = %source_label, "Viewer ready");

        Ok(Self {
            state: AppState::Normal,
            grid,
            metrics,
            cursor: 0,
            view_top: 0,
            viewport_rows,
            search_query: String::new(),
            plan_filter: None,
            selected: None,
            status_message: None,
            source_label,
            drift: None,
        })
    }

    /// Keep a background task alive for as long as the app runs
    pub fn with_drift(mut self, drift: JoinHandle<()>) -> Self {
        self.drift = Some(drift);
        self
    }

    /// Fold in arrived pages and coalesced scroll events
    pub fn tick(&mut self) {
        self.grid.sync();
        self.clamp_cursor();
    }

    pub fn viewport_rows(&self) -> usize {
        self.viewport_rows
    }

    /// Follow a terminal resize
    pub fn resize(&mut self, viewport_rows: usize) -> Result<()> {
        let viewport_rows = viewport_rows.max(1);
        if viewport_rows == self.viewport_rows {
            return Ok(());
        }
        self.grid.set_viewport_height(viewport_rows as f32)?;
        self.viewport_rows = viewport_rows;
        self.scroll_to(self.view_top);
        Ok(())
    }

    // ===== Navigation =====

    pub fn move_selection(&mut self, delta: isize) {
        let loaded = self.grid.loaded_count();
        if loaded == 0 {
            return;
        }
        self.cursor = self.cursor.saturating_add_signed(delta).min(loaded - 1);

        if self.cursor < self.view_top {
            self.scroll_to(self.cursor);
        } else if self.cursor >= self.view_top + self.viewport_rows {
            self.scroll_to(self.cursor + 1 - self.viewport_rows);
        }
    }

    pub fn page_down(&mut self) {
        self.move_selection(self.viewport_rows as isize);
    }

    pub fn page_up(&mut self) {
        self.move_selection(-(self.viewport_rows as isize));
    }

    pub fn go_top(&mut self) {
        self.cursor = 0;
        self.scroll_to(0);
    }

    /// Jump to the last loaded row; more rows load as it comes into view
    pub fn go_bottom(&mut self) {
        let loaded = self.grid.loaded_count();
        if loaded > 0 {
            self.move_selection(loaded as isize);
        }
    }

    /// Move the viewport without moving the cursor, unless it would leave
    /// the screen
    pub fn scroll_view(&mut self, delta: isize) {
        self.scroll_to(self.view_top.saturating_add_signed(delta));
        self.clamp_cursor();
    }

    fn scroll_to(&mut self, top: usize) {
        let max_top = self.grid.loaded_count().saturating_sub(self.viewport_rows);
        self.view_top = top.min(max_top);
        self.grid.scroll_to_index(self.view_top);
    }

    fn clamp_cursor(&mut self) {
        let loaded = self.grid.loaded_count();
        if loaded == 0 {
            self.cursor = 0;
            return;
        }
        let bottom = (self.view_top + self.viewport_rows).min(loaded) - 1;
        self.cursor = self.cursor.clamp(self.view_top.min(bottom), bottom);
    }

    pub fn select_current(&mut self) {
        self.selected = self.grid.row_at(self.cursor).cloned();
        if self.selected.is_some() {
            self.state = AppState::ShowingDetail;
        }
    }

    // ===== Query changes =====

    pub fn start_search(&mut self) {
        self.state = AppState::Searching;
    }

    /// Push the search box to the grid. Called on every keystroke.
    pub fn apply_search(&mut self) {
        let search = Some(self.search_query.trim().to_string()).filter(|s| !s.is_empty());
        if self.grid.set_search(search) {
            debug!(query = %self.search_query, "Search changed");
            self.reset_cursor();
        }
    }

    pub fn clear_search(&mut self) {
        self.search_query.clear();
        self.apply_search();
    }

    /// Cycle the plan filter: all, free, pro, team
    pub fn cycle_plan_filter(&mut self) {
        self.plan_filter = match self.plan_filter {
            None => Some(Plan::Free),
            Some(Plan::Free) => Some(Plan::Pro),
            Some(Plan::Pro) => Some(Plan::Team),
            Some(Plan::Team) => None,
        };
        let filters = match self.plan_filter {
            Some(plan) => Filters::new().with("plan", plan.as_str()),
            None => Filters::new(),
        };
        if self.grid.set_filters(filters) {
            self.reset_cursor();
        }
    }

    /// Drop cached pages and reload from the top
    pub fn refresh(&mut self) {
        self.grid.refresh();
        self.reset_cursor();
    }

    /// Re-issue the page that failed
    pub fn retry(&mut self) {
        self.status_message = if self.grid.retry() {
            None
        } else {
            Some("Nothing to retry".to_string())
        };
    }

    fn reset_cursor(&mut self) {
        self.cursor = 0;
        self.view_top = 0;
        self.selected = None;
    }

    pub fn filter_label(&self) -> String {
        match self.plan_filter {
            Some(plan) => format!("plan={}", plan),
            None => "all plans".to_string(),
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(drift) = self.drift.take() {
            drift.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{demo_users, summarize};
    use gridcache_core::{MemorySource, ScrollState};

    fn demo_app(rows: u64, viewport_rows: usize) -> (App, Arc<MemorySource<User>>) {
        let users = demo_users(rows, 5);
        let memory = MemorySource::new().with_table("users", users.clone());
        memory.set_summary("users", summarize(&users));
        let memory = Arc::new(memory);
        let context = CacheContext::default();
        let app = App::new(&context, Arc::new(UserSource::Demo(Arc::clone(&memory))), "users", viewport_rows).unwrap();
        (app, memory)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_drives_loading() {
        let (mut app, memory) = demo_app(300, 20);
        app.grid.settle().await;
        assert_eq!(app.grid.loaded_count(), 50);

        // Walk down until the next page is due
        for _ in 0..40 {
            app.move_selection(1);
            tokio::time::advance(std::time::Duration::from_millis(20)).await;
            app.tick();
        }
        app.grid.settle().await;
        app.tick();

        assert_eq!(app.cursor, 40);
        assert_eq!(app.view_top, 21);
        assert_eq!(app.grid.loaded_count(), 100);
        assert_eq!(memory.page_calls(), 2);
        assert_eq!(app.grid.state(), ScrollState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_stays_within_loaded_rows() {
        let (mut app, _) = demo_app(30, 10);
        app.grid.settle().await;

        app.move_selection(-5);
        assert_eq!(app.cursor, 0);
        app.go_bottom();
        assert_eq!(app.cursor, 29);
        app.page_down();
        assert_eq!(app.cursor, 29);
        app.go_top();
        assert_eq!(app.cursor, 0);
        assert_eq!(app.view_top, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_resets_cursor() {
        let (mut app, _) = demo_app(400, 10);
        app.grid.settle().await;
        app.move_selection(25);
        assert_eq!(app.cursor, 25);

        app.search_query = "lovelace".to_string();
        app.apply_search();
        assert_eq!(app.cursor, 0);
        assert_eq!(app.grid.search(), Some("lovelace"));
        app.grid.settle().await;
        assert!(app.grid.total_count() > 0);

        // Whitespace only is no search at all
        app.search_query = "   ".to_string();
        app.apply_search();
        app.grid.settle().await;
        assert_eq!(app.grid.search(), None);
        assert_eq!(app.grid.total_count(), 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_filter_cycles() {
        let (mut app, _) = demo_app(200, 10);
        app.grid.settle().await;

        app.cycle_plan_filter();
        assert_eq!(app.plan_filter, Some(Plan::Free));
        app.grid.settle().await;
        app.tick();
        let visible = app.grid.visible_rows();
        assert!(!visible.is_empty());
        assert!(visible.iter().all(|(_, u)| u.plan == Plan::Free));

        app.cycle_plan_filter();
        app.cycle_plan_filter();
        app.cycle_plan_filter();
        assert_eq!(app.plan_filter, None);
        assert_eq!(app.filter_label(), "all plans");
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_current_opens_detail() {
        let (mut app, _) = demo_app(40, 10);
        app.grid.settle().await;
        app.move_selection(3);
        app.select_current();
        assert_eq!(app.state, AppState::ShowingDetail);
        assert_eq!(app.selected.as_ref().map(|u| u.id), Some(3));
    }
}
