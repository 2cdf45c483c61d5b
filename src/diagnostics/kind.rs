//! Diagnostic kinds and the predefined allocator diagnostics.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error - the allocator is about to crash.
    Error,
    /// A warning - the request was refused but the allocator is sound.
    Warning,
    /// Additional context about another diagnostic.
    Note,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `PA0xx` - Allocation contract violations
/// - `PA1xx` - Composite allocator growth
/// - `PA2xx` - Debug tracking and profiling
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "PA001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.kind.prefix(), self.message)
    }
}

// =============================================================================
// PA0xx - Allocation contract
// =============================================================================

/// PA001: Allocation could not be satisfied.
pub const PA001: Diagnostic = Diagnostic::error(
    "PA001",
    "allocator exhausted, allocation failed"
).with_note("the allocator crashes on failure unless told otherwise")
 .with_help("grow the allocator, or call exit_crash_on_allocation_failure() and check for null");

/// PA002: Deallocation of a pointer the allocator does not own.
pub const PA002: Diagnostic = Diagnostic::error(
    "PA002",
    "invalid deallocation, pointer does not belong to this allocator"
).with_note("the back-offset header or block index did not match a live allocation")
 .with_help("use deallocate_no_assert()/deallocate_if_belongs() for speculative frees");

/// PA003: Operation not supported by this allocator kind.
pub const PA003: Diagnostic = Diagnostic::error(
    "PA003",
    "operation not supported by this allocator"
).with_note("this indicates a programming error, not a runtime condition");

/// PA004: Alignment outside what the back-offset header can encode.
pub const PA004: Diagnostic = Diagnostic::warning(
    "PA004",
    "alignment exceeds the cache line size"
).with_note("the 1-byte back-offset header must stay below the cache line size");

// =============================================================================
// PA1xx - Composite growth
// =============================================================================

/// PA101: Memory manager ran out of pool slots.
pub const PA101: Diagnostic = Diagnostic::warning(
    "PA101",
    "memory manager has no free pool slot"
).with_help("raise the size of new pools so fewer are needed");

/// PA102: Request larger than any pool the backup could create.
pub const PA102: Diagnostic = Diagnostic::warning(
    "PA102",
    "allocation exceeds the maximum size of a new pool"
).with_help("allocate large blocks from the backup allocator directly");

/// PA103: Resizable linear allocator ran out of backup chunk slots.
pub const PA103: Diagnostic = Diagnostic::warning(
    "PA103",
    "resizable linear allocator has no free backup chunk slot"
).with_help("increase the backup chunk size or rewind with markers more often");

// =============================================================================
// PA2xx - Debug tracking
// =============================================================================

/// PA201: Debug tracking requested before the manager was initialized.
pub const PA201: Diagnostic = Diagnostic::warning(
    "PA201",
    "debug allocator manager is not initialized, call is not tracked"
).with_help("call DebugAllocatorManager::initialize() at startup");
