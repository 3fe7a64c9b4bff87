use chrono::Utc;
use gridcache_core::{ColumnWidth, Trend};
use ratatui::{
    layout::{Constraint, Direction, Layout, Margin, Rect},
    text::{Line, Span},
    widgets::{
        Block, Borders, Cell, Clear, Paragraph, Row, Scrollbar, ScrollbarOrientation,
        ScrollbarState, Table,
    },
    Frame,
};

use crate::app::{App, AppState};
use crate::utils::{age_display, format_count, format_money};

use super::styles;

/// Width of the metrics panel
const METRICS_PANEL_WIDTH: u16 = 30;

/// Borders plus the header row
const GRID_CHROME_ROWS: u16 = 3;

struct Areas {
    title: Rect,
    search: Rect,
    grid: Rect,
    metrics: Rect,
    status: Rect,
}

fn split(area: Rect) -> Areas {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // Title bar
            Constraint::Length(3), // Search box
            Constraint::Min(5),    // Grid and metrics
            Constraint::Length(1), // Status bar
        ])
        .split(area);

    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(40), Constraint::Length(METRICS_PANEL_WIDTH)])
        .split(chunks[2]);

    Areas {
        title: chunks[0],
        search: chunks[1],
        grid: main[0],
        metrics: main[1],
        status: chunks[3],
    }
}

/// Number of data rows the grid can show in a terminal of this size
pub fn grid_viewport_rows(area: Rect) -> usize {
    split(area).grid.height.saturating_sub(GRID_CHROME_ROWS).max(1) as usize
}

pub fn render(frame: &mut Frame, app: &App) {
    let areas = split(frame.area());

    render_title_bar(frame, app, areas.title);
    render_search_box(frame, app, areas.search);
    render_grid(frame, app, areas.grid);
    render_metrics(frame, app, areas.metrics);
    render_status_bar(frame, app, areas.status);

    // Render overlays
    match app.state {
        AppState::ShowingHelp => render_help_overlay(frame),
        AppState::ShowingDetail => render_detail_overlay(frame, app),
        _ => {}
    }
}

fn render_title_bar(frame: &mut Frame, app: &App, area: Rect) {
    let title = "  gridcache";
    let source = format!("  {}", app.source_label);
    let help_hint = "[?] Help";

    let title_line = Line::from(vec![
        Span::styled(title, styles::title_style()),
        Span::styled(source.clone(), styles::muted_style()),
        Span::raw(" ".repeat(
            (area.width as usize)
                .saturating_sub(title.len() + source.chars().count() + help_hint.len() + 2),
        )),
        Span::styled(help_hint, styles::muted_style()),
    ]);

    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(styles::muted_style());

    frame.render_widget(Paragraph::new(title_line).block(block), area);
}

fn render_search_box(frame: &mut Frame, app: &App, area: Rect) {
    let searching = matches!(app.state, AppState::Searching);
    let mut spans = vec![Span::styled(" / ", styles::muted_style())];
    if app.search_query.is_empty() && !searching {
        spans.push(Span::styled("type / to search names and emails", styles::muted_style()));
    } else {
        spans.push(Span::styled(app.search_query.clone(), styles::search_style()));
        if searching {
            spans.push(Span::styled("_", styles::highlight_style()));
        }
    }

    let block = Block::default()
        .title(format!(" Search ({}) ", app.filter_label()))
        .title_style(styles::muted_style())
        .borders(Borders::ALL)
        .border_style(styles::border_style(searching));

    frame.render_widget(Paragraph::new(Line::from(spans)).block(block), area);
}

fn column_constraint(width: ColumnWidth) -> Constraint {
    match width {
        ColumnWidth::Fixed(n) => Constraint::Length(n),
        ColumnWidth::Flex { min } => Constraint::Min(min),
        ColumnWidth::Percent(p) => Constraint::Percentage(p),
    }
}

fn render_grid(frame: &mut Frame, app: &App, area: Rect) {
    let grid = &app.grid;
    let focused = matches!(app.state, AppState::Normal);
    let title = format!(
        " Users ({} of {}) - {} ",
        format_count(grid.loaded_count() as f64),
        format_count(grid.total_count() as f64),
        grid.state()
    );
    let block = Block::default()
        .title(title)
        .title_style(styles::muted_style())
        .borders(Borders::ALL)
        .border_style(styles::border_style(focused));

    if grid.loaded_count() == 0 {
        let message = if let Some(err) = grid.last_error() {
            Line::from(vec![
                Span::styled(format!(" {} ", err), styles::error_style()),
                Span::styled(" [R] retry", styles::help_key_style()),
            ])
        } else if grid.is_loading() {
            Line::from(Span::styled(" Loading...", styles::muted_style()))
        } else {
            Line::from(Span::styled(" No matching users", styles::muted_style()))
        };
        frame.render_widget(Paragraph::new(message).block(block), area);
        return;
    }

    let header = Row::new(grid.columns().iter().map(|c| Cell::from(c.label.clone())))
        .style(styles::title_style())
        .height(1);

    // The window carries overscan rows; only the viewport is drawn
    let top = grid.first_visible_index();
    let bottom = top + app.viewport_rows();
    let rows: Vec<Row> = grid
        .visible_rows()
        .into_iter()
        .filter(|(index, _)| (top..bottom).contains(index))
        .map(|(index, user)| {
            let style = if index == app.cursor {
                styles::selected_style()
            } else {
                styles::list_item_style()
            };
            Row::new(grid.render_row(user).into_iter().map(Cell::from)).style(style)
        })
        .collect();

    let widths: Vec<Constraint> = grid.columns().iter().map(|c| column_constraint(c.width)).collect();
    let table = Table::new(rows, widths).header(header).block(block);
    frame.render_widget(table, area);

    let placeholder = grid.placeholder();
    let mut scrollbar_state = ScrollbarState::new(placeholder.total_height as usize)
        .position(top)
        .viewport_content_length(app.viewport_rows());
    frame.render_stateful_widget(
        Scrollbar::new(ScrollbarOrientation::VerticalRight),
        area.inner(Margin {
            vertical: 1,
            horizontal: 0,
        }),
        &mut scrollbar_state,
    );
}

fn render_metrics(frame: &mut Frame, app: &App, area: Rect) {
    let view = app.metrics.snapshot();
    let mut lines = vec![Line::from("")];

    if view.values.is_empty() && view.is_loading {
        lines.push(Line::from(Span::styled(" Loading...", styles::muted_style())));
    }

    for (name, value) in &view.values {
        let trend = view.trends.get(name).copied().unwrap_or(Trend::Stable);
        let shown = if name == "mrr" {
            format_money(*value)
        } else {
            format_count(*value)
        };
        lines.push(Line::from(vec![
            Span::styled(format!(" {:<9}", name), styles::muted_style()),
            Span::styled(format!("{:>12} ", shown), styles::list_item_style()),
            Span::styled(trend.arrow(), styles::trend_style(trend)),
        ]));
    }

    lines.push(Line::from(""));
    if let Some(updated) = view.last_updated {
        lines.push(Line::from(Span::styled(
            format!(" Updated {}", age_display(updated, Utc::now())),
            styles::muted_style(),
        )));
    }
    if let Some(ref err) = view.error {
        lines.push(Line::from(Span::styled(format!(" {}", err), styles::error_style())));
    }

    let block = Block::default()
        .title(format!(" Metrics: {} ", app.metrics.group()))
        .title_style(styles::muted_style())
        .borders(Borders::ALL)
        .border_style(styles::border_style(false));

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let shortcuts = "[/]search [p]lan [r]efresh [q]uit";

    let (left_text, left_style) = if let Some(ref msg) = app.status_message {
        (format!(" {} ", msg), styles::highlight_style())
    } else if let Some(err) = app.grid.last_error() {
        (format!(" {} [R] retry ", err), styles::error_style())
    } else if app.grid.is_fetching_next_page() {
        (" Loading more rows... ".to_string(), styles::muted_style())
    } else {
        (
            format!(" Row {} of {} ", app.cursor + 1, format_count(app.grid.total_count() as f64)),
            styles::muted_style(),
        )
    };

    let right_text = format!(" {} ", shortcuts);
    let padding_len = (area.width as usize)
        .saturating_sub(left_text.chars().count())
        .saturating_sub(right_text.len());

    let status_line = Line::from(vec![
        Span::styled(left_text, left_style),
        Span::raw(" ".repeat(padding_len)),
        Span::styled(right_text, styles::muted_style()),
    ]);
    frame.render_widget(Paragraph::new(status_line).style(styles::status_bar_style()), area);
}

fn help_line(key: &'static str, desc: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("  {:<10}", key), styles::help_key_style()),
        Span::styled(desc, styles::help_desc_style()),
    ])
}

fn render_help_overlay(frame: &mut Frame) {
    let area = centered_rect_fixed(48, 20, frame.area());
    frame.render_widget(Clear, area);

    let version = env!("CARGO_PKG_VERSION");
    let help_text = vec![
        Line::from(Span::styled(format!("  gridcache {}", version), styles::title_style())),
        Line::from(""),
        Line::from(Span::styled(" Navigation", styles::highlight_style())),
        help_line("↑/↓ j/k", "Move up/down"),
        help_line("PgUp/PgDn", "Move a screen"),
        help_line("g/G", "First/last loaded row"),
        help_line("Enter", "Show row details"),
        help_line("Wheel", "Scroll"),
        Line::from(""),
        Line::from(Span::styled(" Data", styles::highlight_style())),
        help_line("/", "Search names and emails"),
        help_line("Esc", "Clear search"),
        help_line("p", "Cycle plan filter"),
        help_line("r", "Refresh from the service"),
        help_line("R", "Retry a failed page"),
        Line::from(""),
        help_line("?", "Toggle help"),
        help_line("q", "Quit"),
    ];

    let block = Block::default()
        .title(" Help ")
        .title_style(styles::title_style())
        .borders(Borders::ALL)
        .border_style(styles::border_style(true));

    frame.render_widget(Paragraph::new(help_text).block(block), area);
}

fn render_detail_overlay(frame: &mut Frame, app: &App) {
    let Some(ref user) = app.selected else {
        return;
    };
    let area = centered_rect_fixed(52, 11, frame.area());
    frame.render_widget(Clear, area);

    let field = |label: &'static str, value: String| {
        Line::from(vec![
            Span::styled(format!("  {:<9}", label), styles::muted_style()),
            Span::styled(value, styles::list_item_style()),
        ])
    };
    let lines = vec![
        Line::from(""),
        field("Name", user.name.clone()),
        field("Email", user.email.clone()),
        field("Plan", user.plan.to_string()),
        field("Status", user.status.to_string()),
        field("MRR", format_money(user.mrr)),
        field("Created", user.created_str()),
        Line::from(""),
        Line::from(Span::styled("  [Esc] close", styles::muted_style())),
    ];

    let block = Block::default()
        .title(format!(" User #{} ", user.id))
        .title_style(styles::title_style())
        .borders(Borders::ALL)
        .border_style(styles::border_style(true));

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn centered_rect_fixed(width: u16, height: u16, r: Rect) -> Rect {
    let x = r.x + (r.width.saturating_sub(width)) / 2;
    let y = r.y + (r.height.saturating_sub(height)) / 2;
    Rect::new(x, y, width.min(r.width), height.min(r.height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_rows_follow_terminal_height() {
        // 2 title + 3 search + 1 status, then 3 rows of grid chrome
        assert_eq!(grid_viewport_rows(Rect::new(0, 0, 120, 40)), 31);
        assert_eq!(grid_viewport_rows(Rect::new(0, 0, 120, 12)), 3);
    }

    #[test]
    fn test_centered_rect_fits_small_terminals() {
        let rect = centered_rect_fixed(48, 20, Rect::new(0, 0, 30, 10));
        assert_eq!(rect, Rect::new(0, 0, 30, 10));
        let rect = centered_rect_fixed(10, 4, Rect::new(0, 0, 30, 10));
        assert_eq!(rect, Rect::new(10, 3, 10, 4));
    }
}
