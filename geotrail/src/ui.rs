//! UI rendering for the TUI.

use geotrail_core::display::HEADERS;
use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Cell, Paragraph, Row, Table},
    Frame,
};

use crate::app::App;

/// Dim color for rows without a position
const UNAVAILABLE_COLOR: Color = Color::Rgb(120, 120, 120);
/// Pending (not yet committed) id color
const PENDING_COLOR: Color = Color::Rgb(220, 180, 0);
/// Border color for the history table
const BORDER_HISTORY: Color = Color::Rgb(0, 150, 150);

/// Render the application UI.
pub fn render(frame: &mut Frame, app: &mut App) {
    let area = frame.area();

    // Layout: header, table, footer
    let chunks = Layout::vertical([
        Constraint::Length(2), // Header
        Constraint::Min(5),    // Table
        Constraint::Length(1), // Footer
    ])
    .split(area);

    render_header(frame, app, chunks[0]);
    render_table(frame, app, chunks[1]);
    render_footer(frame, app, chunks[2]);
}

fn render_header(frame: &mut Frame, app: &App, area: Rect) {
    let line = Line::from(vec![
        Span::styled(" geotrail", Style::default().fg(Color::Cyan).bold()),
        Span::raw("  "),
        Span::styled(
            format!("user {}", app.user_id),
            Style::default().fg(Color::DarkGray),
        ),
    ]);
    let header = Paragraph::new(line).block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, area);
}

/// Render the location history table.
fn render_table(frame: &mut Frame, app: &mut App, area: Rect) {
    let header_cells = HEADERS
        .into_iter()
        .map(|h| Cell::from(h).style(Style::default().fg(Color::Yellow).bold()));
    let header = Row::new(header_cells).height(1);

    let surface = app.surface.clone();
    let rows_guard = surface.rows();
    let rows = rows_guard.iter().map(|row| {
        let style = if row.is_unavailable() {
            Style::default().fg(UNAVAILABLE_COLOR)
        } else {
            Style::default()
        };
        let id_style = if row.location_id == geotrail_core::display::PENDING_ID {
            Style::default().fg(PENDING_COLOR)
        } else {
            Style::default()
        };

        let [id, user, timestamp, lon, lat, elevation] = row.cells();
        Row::new([
            Cell::from(id.to_string()).style(id_style),
            Cell::from(user.to_string()),
            Cell::from(timestamp.to_string()),
            Cell::from(lon.to_string()),
            Cell::from(lat.to_string()),
            Cell::from(elevation.to_string()),
        ])
        .style(style)
    });

    let widths = [
        Constraint::Length(11), // Location ID
        Constraint::Fill(1),    // User ID (flexible)
        Constraint::Length(19), // Timestamp
        Constraint::Length(10), // Longitude
        Constraint::Length(9),  // Latitude
        Constraint::Length(11), // Elevation
    ];

    let table = Table::new(rows, widths)
        .header(header)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(Style::default().fg(BORDER_HISTORY))
                .title(" Locations "),
        )
        .row_highlight_style(
            Style::default()
                .add_modifier(Modifier::REVERSED)
                .fg(Color::Cyan),
        )
        .highlight_symbol("▶ ");

    frame.render_stateful_widget(table, area, &mut app.table_state);
}

/// Render the footer with key hints and pipeline status.
fn render_footer(frame: &mut Frame, app: &App, area: Rect) {
    let mut spans = vec![
        Span::styled(" r", Style::default().fg(Color::Yellow)),
        Span::raw(" refresh  "),
        Span::styled("s", Style::default().fg(Color::Yellow)),
        Span::raw(" sync  "),
        Span::styled("f", Style::default().fg(Color::Yellow)),
        Span::raw(" record now  "),
        Span::styled("q", Style::default().fg(Color::Yellow)),
        Span::raw(" quit  "),
        Span::raw("│ "),
    ];

    if app.is_online() {
        spans.push(Span::styled(
            "● ONLINE",
            Style::default()
                .fg(Color::Green)
                .add_modifier(Modifier::BOLD),
        ));
    } else {
        spans.push(Span::styled(
            "○ OFFLINE",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
    }

    spans.push(Span::raw(" │ "));
    match app.pending {
        Some(n) => spans.push(Span::styled(
            format!("{} pending", n),
            Style::default().fg(if n > 0 { PENDING_COLOR } else { Color::DarkGray }),
        )),
        None if !app.queue_available() => spans.push(Span::styled(
            "queue unavailable",
            Style::default().fg(Color::Red),
        )),
        None => spans.push(Span::styled("? pending", Style::default().fg(Color::DarkGray))),
    }

    spans.push(Span::raw(" │ "));
    spans.push(Span::styled(
        format!("{} rows", app.row_count()),
        Style::default().fg(Color::DarkGray),
    ));

    if !app.is_visible() {
        spans.push(Span::raw(" │ "));
        spans.push(Span::styled("paused", Style::default().fg(Color::DarkGray)));
    }

    if let Some(notice) = &app.notice {
        spans.push(Span::raw(" │ "));
        spans.push(Span::styled(notice.as_str(), Style::default().fg(Color::Cyan)));
    }

    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}
