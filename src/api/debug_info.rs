//! Call-site information carried through every allocator operation.

use std::fmt;
use std::panic::Location;

/// Where an allocator call came from.
///
/// Non-`_ex` free functions fill this from `#[track_caller]`, which knows
/// the file and line but not the enclosing function. Use [`debug_info!`]
/// to capture the module path as well.
///
/// [`debug_info!`]: crate::debug_info
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugInfo {
    /// Source file of the call.
    pub file: &'static str,
    /// Enclosing function or module path.
    pub function: &'static str,
    /// Line of the call.
    pub line: u32,
}

impl DebugInfo {
    /// Placeholder used when the function is not known.
    pub const UNKNOWN_FUNCTION: &'static str = "<unknown>";

    /// Build debug info from its parts.
    pub const fn new(file: &'static str, function: &'static str, line: u32) -> Self {
        Self { file, function, line }
    }

    /// Debug info of the caller of the current `#[track_caller]` function.
    #[track_caller]
    #[inline]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            function: Self::UNKNOWN_FUNCTION,
            line: location.line(),
        }
    }

    /// Empty debug info for internal calls.
    pub const fn none() -> Self {
        Self {
            file: "",
            function: "",
            line: 0,
        }
    }

    /// Whether this carries no location.
    pub fn is_none(&self) -> bool {
        self.file.is_empty() && self.line == 0
    }
}

impl Default for DebugInfo {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("<no location>");
        }
        write!(f, "{}:{} in {}", self.file, self.line, self.function)
    }
}

/// Capture the current file, module path and line as a [`DebugInfo`].
///
/// ```rust
/// let info = polyalloc::debug_info!();
/// assert_eq!(info.line, line!() - 1);
/// ```
#[macro_export]
macro_rules! debug_info {
    () => {
        $crate::DebugInfo::new(file!(), module_path!(), line!())
    };
}
