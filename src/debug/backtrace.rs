//! Backtrace capture for tracked calls.

/// Capture the current stack as text.
///
/// Returns `None` unless the `debug` feature is enabled.
#[cfg(feature = "debug")]
pub(crate) fn capture() -> Option<String> {
    let bt = backtrace::Backtrace::new();
    Some(format!("{:?}", bt))
}

#[cfg(not(feature = "debug"))]
pub(crate) fn capture() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_matches_feature() {
        assert_eq!(capture().is_some(), cfg!(feature = "debug"));
    }
}
