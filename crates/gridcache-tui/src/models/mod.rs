//! Record types shown by the viewer.
//!
//! - `User`: one account row, with its plan and status

pub mod user;

pub use user::{Plan, Status, User};
