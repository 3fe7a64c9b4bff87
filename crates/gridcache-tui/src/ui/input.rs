//! Keyboard and mouse input handling.
//!
//! Translates terminal events into `App` calls. Nothing here waits on the
//! network: every call that needs data only schedules a fetch.

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, MouseEvent, MouseEventKind};

use crate::app::{App, AppState, WHEEL_SCROLL_ROWS};

/// Handle keyboard input. Returns true if the app should quit.
pub fn handle_input(app: &mut App, key: KeyEvent) -> Result<bool> {
    // Handle help overlay
    if matches!(app.state, AppState::ShowingHelp) {
        if matches!(key.code, KeyCode::Esc | KeyCode::Char('?') | KeyCode::Char('q')) {
            app.state = AppState::Normal;
        }
        return Ok(false);
    }

    if matches!(app.state, AppState::ShowingDetail) {
        if matches!(key.code, KeyCode::Esc | KeyCode::Enter | KeyCode::Char('q')) {
            app.state = AppState::Normal;
            app.selected = None;
        }
        return Ok(false);
    }

    // Handle search mode
    if matches!(app.state, AppState::Searching) {
        return handle_search_input(app, key);
    }

    app.status_message = None;

    match key.code {
        KeyCode::Char('q') => {
            app.state = AppState::Quitting;
            return Ok(true);
        }
        KeyCode::Char('?') => app.state = AppState::ShowingHelp,
        KeyCode::Char('/') => app.start_search(),
        KeyCode::Esc => {
            if !app.search_query.is_empty() {
                app.clear_search();
            }
        }
        KeyCode::Down | KeyCode::Char('j') => app.move_selection(1),
        KeyCode::Up | KeyCode::Char('k') => app.move_selection(-1),
        KeyCode::PageDown => app.page_down(),
        KeyCode::PageUp => app.page_up(),
        KeyCode::Home | KeyCode::Char('g') => app.go_top(),
        KeyCode::End | KeyCode::Char('G') => app.go_bottom(),
        KeyCode::Enter => app.select_current(),
        KeyCode::Char('p') => app.cycle_plan_filter(),
        KeyCode::Char('r') => app.refresh(),
        KeyCode::Char('R') => app.retry(),
        _ => {}
    }
    Ok(false)
}

/// Every keystroke is pushed to the grid; the grid drops the old list and
/// ignores pages still in flight for it.
fn handle_search_input(app: &mut App, key: KeyEvent) -> Result<bool> {
    match key.code {
        KeyCode::Esc => {
            app.state = AppState::Normal;
            app.clear_search();
        }
        KeyCode::Enter => {
            app.state = AppState::Normal;
        }
        KeyCode::Backspace => {
            app.search_query.pop();
            app.apply_search();
        }
        KeyCode::Char(c) => {
            app.search_query.push(c);
            app.apply_search();
        }
        _ => {}
    }
    Ok(false)
}

pub fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    match mouse.kind {
        MouseEventKind::ScrollDown => app.scroll_view(WHEEL_SCROLL_ROWS as isize),
        MouseEventKind::ScrollUp => app.scroll_view(-(WHEEL_SCROLL_ROWS as isize)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crossterm::event::KeyModifiers;
    use gridcache_core::{CacheContext, MemorySource};

    use crate::source::{demo_users, UserSource};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn app(rows: u64) -> App {
        let memory = Arc::new(MemorySource::new().with_table("users", demo_users(rows, 9)));
        let context = CacheContext::default();
        App::new(&context, Arc::new(UserSource::Demo(memory)), "users", 10).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_keys() {
        let mut app = app(100);
        app.grid.settle().await;

        handle_input(&mut app, key(KeyCode::Char('j'))).unwrap();
        handle_input(&mut app, key(KeyCode::Down)).unwrap();
        assert_eq!(app.cursor, 2);
        handle_input(&mut app, key(KeyCode::Char('k'))).unwrap();
        assert_eq!(app.cursor, 1);
        handle_input(&mut app, key(KeyCode::PageDown)).unwrap();
        assert_eq!(app.cursor, 11);
        handle_input(&mut app, key(KeyCode::Char('g'))).unwrap();
        assert_eq!(app.cursor, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_mode_typing() {
        let mut app = app(100);
        app.grid.settle().await;

        handle_input(&mut app, key(KeyCode::Char('/'))).unwrap();
        assert_eq!(app.state, AppState::Searching);
        for c in "ada".chars() {
            handle_input(&mut app, key(KeyCode::Char(c))).unwrap();
        }
        assert_eq!(app.search_query, "ada");
        assert_eq!(app.grid.search(), Some("ada"));

        handle_input(&mut app, key(KeyCode::Backspace)).unwrap();
        assert_eq!(app.grid.search(), Some("ad"));

        handle_input(&mut app, key(KeyCode::Enter)).unwrap();
        assert_eq!(app.state, AppState::Normal);
        assert_eq!(app.search_query, "ad");

        // Esc in normal mode clears an active search
        handle_input(&mut app, key(KeyCode::Esc)).unwrap();
        assert!(app.search_query.is_empty());
        assert_eq!(app.grid.search(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_help_and_quit() {
        let mut app = app(10);
        handle_input(&mut app, key(KeyCode::Char('?'))).unwrap();
        assert_eq!(app.state, AppState::ShowingHelp);
        // 'q' only closes the overlay
        assert!(!handle_input(&mut app, key(KeyCode::Char('q'))).unwrap());
        assert_eq!(app.state, AppState::Normal);
        assert!(handle_input(&mut app, key(KeyCode::Char('q'))).unwrap());
        assert_eq!(app.state, AppState::Quitting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wheel_scrolls_view() {
        let mut app = app(100);
        app.grid.settle().await;

        let wheel = MouseEvent {
            kind: MouseEventKind::ScrollDown,
            column: 0,
            row: 0,
            modifiers: KeyModifiers::NONE,
        };
        handle_mouse(&mut app, wheel);
        assert_eq!(app.view_top, WHEEL_SCROLL_ROWS);
        assert_eq!(app.cursor, WHEEL_SCROLL_ROWS);
    }
}
