//! Application state for the TUI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossterm::event::{KeyCode, KeyEvent};
use geotrail_core::capture::Surface;
use geotrail_core::connectivity::NetworkStatus;
use geotrail_core::display::DisplayRow;
use geotrail_core::lifecycle::Visibility;
use geotrail_core::{LocationQueue, UserId};
use ratatui::widgets::TableState;
use tokio::sync::watch;

/// Row store shared between the pipeline tasks and the render loop
#[derive(Default)]
pub struct TableSurface {
    rows: Mutex<Vec<DisplayRow>>,
    generation: AtomicU64,
}

impl TableSurface {
    pub fn rows(&self) -> MutexGuard<'_, Vec<DisplayRow>> {
        // A panicked writer leaves plain data behind; keep rendering it
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bumped on every change
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Surface for TableSurface {
    fn append_row(&self, row: DisplayRow) {
        self.rows().push(row);
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn replace_rows(&self, rows: Vec<DisplayRow>) {
        *self.rows() = rows;
        self.generation.fetch_add(1, Ordering::Release);
    }
}

/// What the main loop should do after a key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    None,
    Refresh,
    SyncNow,
    Flush,
}

/// Main application state.
pub struct App {
    pub surface: Arc<TableSurface>,
    pub table_state: TableState,
    pub user_id: UserId,
    pub should_quit: bool,
    /// Keep the selection on the newest row while nothing else is selected
    follow_tail: bool,
    seen_generation: u64,
    network: NetworkStatus,
    visibility: watch::Receiver<Visibility>,
    queue: Option<Arc<LocationQueue>>,
    /// Cached pending count; `None` when the queue is unavailable
    pub pending: Option<usize>,
    /// Last user-facing notice for the footer
    pub notice: Option<String>,
}

impl App {
    pub fn new(
        surface: Arc<TableSurface>,
        user_id: UserId,
        network: NetworkStatus,
        visibility: watch::Receiver<Visibility>,
        queue: Option<Arc<LocationQueue>>,
    ) -> Self {
        let mut app = Self {
            surface,
            table_state: TableState::default(),
            user_id,
            should_quit: false,
            follow_tail: true,
            seen_generation: 0,
            network,
            visibility,
            queue,
            pending: None,
            notice: None,
        };
        app.refresh_pending();
        app
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    pub fn is_visible(&self) -> bool {
        *self.visibility.borrow() == Visibility::Visible
    }

    pub fn queue_available(&self) -> bool {
        self.queue.is_some()
    }

    pub fn row_count(&self) -> usize {
        self.surface.rows().len()
    }

    /// Re-read the pending count from the queue
    pub fn refresh_pending(&mut self) {
        self.pending = self.queue.as_ref().and_then(|q| match q.len() {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read pending count");
                None
            }
        });
    }

    /// Pick up rows added by the pipeline since the last frame
    pub fn sync_selection(&mut self) {
        let generation = self.surface.generation();
        if generation == self.seen_generation {
            return;
        }
        self.seen_generation = generation;

        let len = self.row_count();
        if len == 0 {
            self.table_state.select(None);
        } else if self.follow_tail {
            self.table_state.select(Some(len - 1));
        } else if let Some(i) = self.table_state.selected() {
            self.table_state.select(Some(i.min(len - 1)));
        }
    }

    /// Handle keyboard input.
    pub fn handle_key(&mut self, key: KeyEvent) -> KeyAction {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
                KeyAction::None
            }
            KeyCode::Char('r') => {
                self.notice = Some("Refreshing history...".to_string());
                KeyAction::Refresh
            }
            KeyCode::Char('s') => {
                self.notice = Some("Sync requested".to_string());
                KeyAction::SyncNow
            }
            KeyCode::Char('f') => {
                self.notice = Some("Recording now".to_string());
                KeyAction::Flush
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.select_next();
                KeyAction::None
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.select_previous();
                KeyAction::None
            }
            KeyCode::Home | KeyCode::Char('g') => {
                self.select_first();
                KeyAction::None
            }
            KeyCode::End | KeyCode::Char('G') => {
                self.select_last();
                KeyAction::None
            }
            _ => KeyAction::None,
        }
    }

    fn select_next(&mut self) {
        let len = self.row_count();
        if len == 0 {
            return;
        }
        let i = match self.table_state.selected() {
            Some(i) if i + 1 < len => i + 1,
            Some(i) => i,
            None => 0,
        };
        self.table_state.select(Some(i));
        self.follow_tail = i + 1 == len;
    }

    fn select_previous(&mut self) {
        if self.row_count() == 0 {
            return;
        }
        let i = self.table_state.selected().map_or(0, |i| i.saturating_sub(1));
        self.table_state.select(Some(i));
        self.follow_tail = false;
    }

    fn select_first(&mut self) {
        if self.row_count() > 0 {
            self.table_state.select(Some(0));
            self.follow_tail = false;
        }
    }

    fn select_last(&mut self) {
        let len = self.row_count();
        if len > 0 {
            self.table_state.select(Some(len - 1));
            self.follow_tail = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crossterm::event::KeyModifiers;

    fn app() -> App {
        let (_tx, rx) = watch::channel(Visibility::Visible);
        App::new(
            Arc::new(TableSurface::default()),
            UserId::new("u"),
            NetworkStatus::new(false),
            rx,
            None,
        )
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn push_rows(app: &App, n: usize) {
        for _ in 0..n {
            app.surface
                .append_row(DisplayRow::unavailable(&UserId::new("u"), Utc::now()));
        }
    }

    #[test]
    fn test_selection_follows_new_rows() {
        let mut app = app();
        push_rows(&app, 3);
        app.sync_selection();
        assert_eq!(app.table_state.selected(), Some(2));

        app.handle_key(key(KeyCode::Char('k')));
        push_rows(&app, 1);
        app.sync_selection();
        assert_eq!(app.table_state.selected(), Some(1));

        app.handle_key(key(KeyCode::Char('G')));
        push_rows(&app, 1);
        app.sync_selection();
        assert_eq!(app.table_state.selected(), Some(4));
    }

    #[test]
    fn test_key_actions() {
        let mut app = app();
        assert_eq!(app.handle_key(key(KeyCode::Char('s'))), KeyAction::SyncNow);
        assert_eq!(app.handle_key(key(KeyCode::Char('f'))), KeyAction::Flush);
        assert_eq!(app.handle_key(key(KeyCode::Char('r'))), KeyAction::Refresh);
        assert!(!app.should_quit);
        app.handle_key(key(KeyCode::Char('q')));
        assert!(app.should_quit);
    }

    #[test]
    fn test_no_queue_has_no_pending_count() {
        let app = app();
        assert!(!app.queue_available());
        assert_eq!(app.pending, None);
    }
}
