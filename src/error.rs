//! Error type for fallible, non-hot-path operations.
//!
//! Allocation itself never returns a `Result`: capacity exhaustion is
//! either a crash or a null pointer, depending on the instance's failure
//! policy. Construction of composite allocators and the debug dump are the
//! places where a typed error makes sense.

use thiserror::Error;

/// Errors returned when building allocators or writing diagnostics.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The backup allocator returned null for a buffer request.
    #[error("backup allocator could not provide {size} bytes")]
    BackupExhausted {
        /// Requested buffer size.
        size: usize,
    },

    /// A configuration value is out of range.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(&'static str),

    /// The process-wide debug manager has not been initialized.
    #[error("debug allocator manager is not initialized")]
    NotInitialized,

    /// Writing the debug state failed.
    #[error("failed to write debug allocator state: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, AllocatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AllocatorError::BackupExhausted { size: 4096 };
        assert_eq!(err.to_string(), "backup allocator could not provide 4096 bytes");

        let err = AllocatorError::InvalidConfig("allocator_count must be non-zero");
        assert!(err.to_string().contains("allocator_count"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: AllocatorError = io.into();
        assert!(matches!(err, AllocatorError::Io(_)));
    }
}
