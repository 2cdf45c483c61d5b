//! Debug utilities for tracking allocator calls.
//!
//! Backtraces are only captured when the `debug` feature is enabled.

mod backtrace;
mod tracker;

pub use tracker::{DebugAllocatorManager, TrackedCall, TrackedOperation};
