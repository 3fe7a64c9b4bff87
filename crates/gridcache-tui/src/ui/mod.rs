//! Terminal UI module using ratatui.
//!
//! - `render`: Frame layout, the grid, the metrics panel and overlays
//! - `input`: Keyboard and mouse event handling
//! - `styles`: Color palette and text styling

pub mod input;
pub mod render;
pub mod styles;
