//! Allocator configuration.

use crate::allocators::CreateBaseAllocatorInfo;
use crate::error::{AllocatorError, Result};
use crate::util::size::{kb, mb};

/// Environment variable overriding [`DebugManagerConfig::ring_capacity`].
pub const DEBUG_RING_CAPACITY_ENV: &str = "POLYALLOC_DEBUG_RING_CAPACITY";

/// Configuration for a [`MemoryManager`](crate::MemoryManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    /// The first pool, created eagerly (default: 1 MB multipool)
    pub initial: CreateBaseAllocatorInfo,

    /// Pools created on demand once the existing ones are full
    pub growth: CreateBaseAllocatorInfo,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            initial: CreateBaseAllocatorInfo::default(),
            growth: CreateBaseAllocatorInfo::default(),
        }
    }
}

impl MemoryManagerConfig {
    /// Create a minimal config for testing or constrained environments.
    pub fn minimal() -> Self {
        Self {
            initial: CreateBaseAllocatorInfo::minimal(),
            growth: CreateBaseAllocatorInfo::minimal(),
        }
    }

    /// Builder pattern: set the first pool.
    pub fn with_initial(mut self, initial: CreateBaseAllocatorInfo) -> Self {
        self.initial = initial;
        self
    }

    /// Builder pattern: set the pools created on growth.
    pub fn with_growth(mut self, growth: CreateBaseAllocatorInfo) -> Self {
        self.growth = growth;
        self
    }
}

/// Configuration for a [`ResizableLinearAllocator`](crate::ResizableLinearAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizableLinearConfig {
    /// Size of the initial buffer (default: 1 MB, 0 = start with chunks)
    pub initial_size: usize,

    /// Minimum size of each backup chunk (default: 256 KB)
    pub backup_chunk_size: usize,
}

impl Default for ResizableLinearConfig {
    fn default() -> Self {
        Self {
            initial_size: mb(1),
            backup_chunk_size: kb(256),
        }
    }
}

impl ResizableLinearConfig {
    /// Create a minimal config for testing or constrained environments.
    pub fn minimal() -> Self {
        Self {
            initial_size: kb(16),
            backup_chunk_size: kb(16),
        }
    }

    /// Builder pattern: set the initial buffer size.
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Builder pattern: set the backup chunk size.
    pub fn with_backup_chunk_size(mut self, size: usize) -> Self {
        self.backup_chunk_size = size;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.backup_chunk_size == 0 {
            return Err(AllocatorError::InvalidConfig("backup_chunk_size must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration for the [`DebugAllocatorManager`](crate::debug::DebugAllocatorManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugManagerConfig {
    /// Calls kept per allocator before the oldest are overwritten (default: 256)
    pub ring_capacity: usize,

    /// Whether allocators registered lazily get a growable log
    pub default_resizable: bool,

    /// Capture a backtrace with every tracked call (needs the `debug` feature)
    pub capture_backtraces: bool,
}

impl Default for DebugManagerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 256,
            default_resizable: false,
            capture_backtraces: false,
        }
    }
}

impl DebugManagerConfig {
    /// Default config with `ring_capacity` taken from
    /// `POLYALLOC_DEBUG_RING_CAPACITY` when it is set to a positive number.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        match std::env::var(DEBUG_RING_CAPACITY_ENV) {
            Ok(value) => match value.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.ring_capacity = capacity,
                _ => log::warn!(
                    "ignoring {}={:?}: expected a positive integer",
                    DEBUG_RING_CAPACITY_ENV,
                    value
                ),
            },
            Err(_) => {}
        }
        config
    }

    /// Builder pattern: set the ring capacity.
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    /// Builder pattern: give lazily registered allocators a growable log.
    pub fn with_default_resizable(mut self, resizable: bool) -> Self {
        self.default_resizable = resizable;
        self
    }

    /// Builder pattern: capture backtraces.
    pub fn with_backtraces(mut self, enable: bool) -> Self {
        self.capture_backtraces = enable;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            return Err(AllocatorError::InvalidConfig("ring_capacity must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration for the [`AllocatorProfiler`](crate::diagnostics::AllocatorProfiler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// Samples buffered before they are folded inline (default: 4096)
    pub queue_capacity: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
        }
    }
}

impl ProfilerConfig {
    /// Builder pattern: set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(AllocatorError::InvalidConfig("queue_capacity must be non-zero"));
        }
        Ok(())
    }
}
