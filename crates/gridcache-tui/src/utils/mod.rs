//! Utility functions for string formatting.

pub mod format;

pub use format::{age_display, format_count, format_money, truncate_string};
