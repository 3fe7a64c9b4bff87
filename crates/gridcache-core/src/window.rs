//! Row windowing.
//!
//! Given a fixed row height and a viewport height, decides which contiguous
//! range of rows has to be materialized for a scroll offset. Everything
//! outside that range is represented by placeholder space so the scrollbar
//! keeps the proportions of the full list.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::ConfigurationError;

/// Rows rendered beyond each edge of the viewport.
pub const DEFAULT_OVERSCAN: usize = 2;

/// One animation frame at 60 Hz.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Inclusive index range of materialized rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleWindow {
    pub start_index: usize,
    pub stop_index: usize,
}

impl VisibleWindow {
    /// Number of materialized rows; a window is never empty
    pub fn count(&self) -> usize {
        self.stop_index - self.start_index + 1
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start_index..=self.stop_index).contains(&index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpec {
    pub row_height: f32,
    pub viewport_height: f32,
    pub overscan: usize,
}

impl WindowSpec {
    pub fn new(row_height: f32, viewport_height: f32) -> Result<Self, ConfigurationError> {
        let spec = Self {
            row_height,
            viewport_height,
            overscan: DEFAULT_OVERSCAN,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_overscan(mut self, overscan: usize) -> Self {
        self.overscan = overscan;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.row_height.is_finite() && self.row_height > 0.0) {
            return Err(ConfigurationError::InvalidDimension {
                field: "row_height",
                value: self.row_height,
            });
        }
        if !(self.viewport_height.is_finite() && self.viewport_height >= 0.0) {
            return Err(ConfigurationError::InvalidDimension {
                field: "viewport_height",
                value: self.viewport_height,
            });
        }
        Ok(())
    }

    /// Number of rows that fit in the viewport, rounding partial rows up
    pub fn rows_per_viewport(&self) -> usize {
        (self.viewport_height / self.row_height).ceil() as usize
    }

    /// Scroll offset that puts `index` at the top of the viewport
    pub fn offset_of(&self, index: usize) -> f32 {
        index as f32 * self.row_height
    }

    /// Largest meaningful scroll offset for `row_count` rows
    pub fn max_offset(&self, row_count: usize) -> f32 {
        (row_count as f32 * self.row_height - self.viewport_height).max(0.0)
    }
}

/// Compute the rows to materialize at `scroll_offset`.
///
/// Returns `None` when there are no rows. Otherwise the window always lies
/// inside `[0, row_count)`, even for offsets past the end of the list.
pub fn compute_window(spec: &WindowSpec, scroll_offset: f32, row_count: usize) -> Option<VisibleWindow> {
    if row_count == 0 {
        return None;
    }
    let last = row_count - 1;

    let offset = if scroll_offset.is_finite() { scroll_offset.max(0.0) } else { 0.0 };
    let first_visible = ((offset / spec.row_height).floor() as usize).min(last);

    let start_index = first_visible.saturating_sub(spec.overscan);
    let stop_index = first_visible
        .saturating_add(spec.rows_per_viewport())
        .saturating_add(spec.overscan)
        .min(last);

    Some(VisibleWindow {
        start_index,
        stop_index,
    })
}

/// Space reserved for rows that are not materialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placeholder {
    /// Height of the whole list as if every row were rendered
    pub total_height: f32,
    /// Space above the first materialized row
    pub offset_top: f32,
    /// Space below the last materialized row
    pub offset_bottom: f32,
}

impl Placeholder {
    pub fn new(spec: &WindowSpec, row_count: usize, window: Option<VisibleWindow>) -> Self {
        let total_height = row_count as f32 * spec.row_height;
        match window {
            Some(w) => {
                let offset_top = w.start_index as f32 * spec.row_height;
                let rendered = w.count() as f32 * spec.row_height;
                Self {
                    total_height,
                    offset_top,
                    offset_bottom: (total_height - offset_top - rendered).max(0.0),
                }
            }
            None => Self {
                total_height,
                offset_top: 0.0,
                offset_bottom: total_height,
            },
        }
    }

    /// Scrollbar thumb position and length, both as fractions of the track
    pub fn scrollbar(&self, scroll_offset: f32, viewport_height: f32) -> (f32, f32) {
        if self.total_height <= viewport_height || self.total_height <= 0.0 {
            return (0.0, 1.0);
        }
        let length = viewport_height / self.total_height;
        let position = (scroll_offset / self.total_height).clamp(0.0, 1.0 - length);
        (position, length)
    }
}

/// Coalesces scroll events so the window is recomputed at most once per
/// frame. The newest offset always wins.
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    frame: Duration,
    last_run: Option<Instant>,
    pending: Option<f32>,
}

impl Default for FrameThrottle {
    fn default() -> Self {
        Self::new(FRAME_INTERVAL)
    }
}

impl FrameThrottle {
    pub fn new(frame: Duration) -> Self {
        Self {
            frame,
            last_run: None,
            pending: None,
        }
    }

    /// Record a scroll event. Returns the offset to recompute with now, or
    /// `None` when this frame already ran; the offset is then kept for
    /// `flush`.
    pub fn offer(&mut self, offset: f32, now: Instant) -> Option<f32> {
        if self.frame_elapsed(now) {
            self.last_run = Some(now);
            self.pending = None;
            Some(offset)
        } else {
            self.pending = Some(offset);
            None
        }
    }

    /// Release the coalesced offset once its frame has passed
    pub fn flush(&mut self, now: Instant) -> Option<f32> {
        if self.pending.is_some() && self.frame_elapsed(now) {
            self.last_run = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn frame_elapsed(&self, now: Instant) -> bool {
        self.last_run
            .map_or(true, |last| now.saturating_duration_since(last) >= self.frame)
    }
}

/// Materialized rows of `window`, with their absolute indices. Rows are
/// borrowed as they are, so a click on a rendered row resolves to the very
/// same value.
pub fn materialize<R>(rows: &[R], window: Option<VisibleWindow>) -> impl Iterator<Item = (usize, &R)> {
    let range = match window {
        Some(w) if w.start_index < rows.len() => w.start_index..(w.stop_index + 1).min(rows.len()),
        _ => 0..0,
    };
    rows[range.clone()]
        .iter()
        .enumerate()
        .map(move |(i, row)| (range.start + i, row))
}
