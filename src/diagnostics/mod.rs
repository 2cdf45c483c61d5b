//! Diagnostics and profiling.
//!
//! This module provides:
//! - **Runtime diagnostics**: allocator-aware error messages with codes
//! - **Profiling**: per-allocator usage samples, see [`AllocatorProfiler`]
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | PA0xx | Allocation contract violations |
//! | PA1xx | Composite growth limits        |
//! | PA2xx | Debug tracking                 |
//!
//! Errors are followed by a panic carrying the code and the call site.
//! Warnings accompany a null return or a dropped tracking call.

pub mod emit;
pub mod kind;
pub mod profiler;

pub use emit::{emit, emit_with_context, is_suppressed, suppress_diagnostics};
pub use kind::{Diagnostic, DiagnosticKind};
pub use profiler::{AllocatorProfile, AllocatorProfiler, ProfileEvent};

pub use kind::{PA001, PA002, PA003, PA004, PA101, PA102, PA103, PA201};
