//! Infinite scrolling: assembling consecutive pages into one list and
//! deciding when to ask for the next one.

pub mod accumulator;
pub mod coordinator;

pub use accumulator::{Accumulator, AppendOutcome};
pub use coordinator::{ScrollCoordinator, ScrollState, DEFAULT_PREFETCH_THRESHOLD};
