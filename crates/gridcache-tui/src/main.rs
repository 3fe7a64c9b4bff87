//! gridcache - a terminal viewer for large, frequently-changing record sets.
//!
//! Rows are loaded page by page as the cursor approaches the end of what is
//! loaded, and only the rows on screen are rendered. A side panel polls the
//! resource's summary metrics and shows which way each one is moving.

mod app;
mod models;
mod source;
mod ui;
mod utils;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use gridcache_core::{CacheContext, GridCacheConfig, HttpRecordSource, RecordSource};
use ratatui::{backend::CrosstermBackend, layout::Rect, Terminal};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::{App, AppState};
use source::UserSource;
use ui::input::{handle_input, handle_mouse};
use ui::render::{grid_viewport_rows, render};

// ============================================================================
// Constants
// ============================================================================

/// Timeout for polling terminal events (in milliseconds)
const EVENT_POLL_TIMEOUT_MS: u64 = 100;

/// Log file name inside the cache directory
const LOG_FILE: &str = "gridcache.log";

/// Initialize the tracing subscriber for logging.
///
/// The terminal belongs to the UI, so logs go to a daily-rotated file.
/// Use RUST_LOG to control the level (e.g., RUST_LOG=gridcache_core=debug).
fn init_tracing(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
    Ok(guard)
}

/// Pick the record source: the configured service, or demo data
fn build_source(config: &GridCacheConfig, demo: bool) -> Result<UserSource> {
    let base_url = std::env::var("GRIDCACHE_BASE_URL")
        .ok()
        .or_else(|| config.base_url.clone())
        .filter(|_| !demo);

    match base_url {
        Some(url) => {
            let mut source = HttpRecordSource::new(url).context("Failed to create HTTP client")?;
            if let Ok(token) = std::env::var("GRIDCACHE_TOKEN") {
                source = source.with_token(token);
            }
            Ok(UserSource::Remote(source))
        }
        None => Ok(UserSource::Demo(source::demo_source(&config.resource))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let demo = std::env::args().skip(1).any(|arg| arg == "--demo");

    let config = GridCacheConfig::load().context("Failed to load configuration")?;
    let settings = config.validate().context("Invalid configuration")?;

    // Initialize logging
    let _log_guard = init_tracing(&config.cache_dir()?).context("Failed to set up logging")?;
    info!("gridcache starting");

    let context = CacheContext::new(settings);
    let source = Arc::new(build_source(&config, demo)?);

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = start(&mut terminal, &context, source, &config.resource).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(e) = result {
        warn!(error = %e, "gridcache exited with an error");
        eprintln!("Error: {}", e);
    }

    info!("gridcache shutting down");
    Ok(())
}

/// Build the app for the current terminal size and run it
async fn start(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    context: &CacheContext,
    records: Arc<UserSource>,
    resource: &str,
) -> Result<()> {
    let viewport_rows = grid_viewport_rows(terminal_area(terminal)?);
    let mut app = App::new(context, Arc::clone(&records), resource, viewport_rows)?;

    if let UserSource::Demo(ref memory) = *records {
        let base = memory.fetch_summary(resource).await?;
        app = app.with_drift(source::spawn_demo_drift(Arc::clone(memory), resource.to_string(), base));
    }

    run_app(terminal, &mut app).await
}

fn terminal_area(terminal: &Terminal<CrosstermBackend<io::Stdout>>) -> Result<Rect> {
    let size = terminal.size()?;
    Ok(Rect::new(0, 0, size.width, size.height))
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<()> {
    loop {
        // Follow terminal resizes before laying out the frame
        app.resize(grid_viewport_rows(terminal_area(terminal)?))?;

        // Draw UI
        terminal.draw(|f| render(f, app))?;

        // Poll for events with timeout to allow background updates
        if event::poll(Duration::from_millis(EVENT_POLL_TIMEOUT_MS))? {
            match event::read()? {
                Event::Key(key) => {
                    // Ctrl+C to quit
                    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
                        return Ok(());
                    }

                    if handle_input(app, key)? {
                        return Ok(());
                    }
                }
                Event::Mouse(mouse) => handle_mouse(app, mouse),
                _ => {}
            }
        }

        // Fold in pages that arrived while we waited
        app.tick();

        // Check if we should quit
        if matches!(app.state, AppState::Quitting) {
            return Ok(());
        }
    }
}
