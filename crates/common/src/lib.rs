//! Shared helpers for the codelexa gateway crates.

pub mod clock;
pub mod fs;

pub use clock::{Clock, ManualClock, SystemClock};
