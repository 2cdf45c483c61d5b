//! # polyalloc
//!
//! Composable, manually managed allocators behind one type-erased handle.
//!
//! ## Features
//!
//! - Stack allocator with markers and undo-last
//! - Multipool allocator over a block-range free list
//! - Arenas of N homogeneous sub-allocators, nestable
//! - Memory manager that grows pools from a backup allocator
//! - Resizable linear allocator with rewind across backup chunks
//! - Malloc fallback behind null handles
//! - Single-threaded and thread-safe variants of every operation
//! - Optional per-instance call tracking and usage profiling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use polyalloc::{
//!     allocate, deallocate, AllocatorBase, AllocatorPolymorphic, ConcurrencyMode,
//!     CreateBaseAllocatorInfo, MemoryManager, MemoryManagerConfig,
//! };
//!
//! let config = MemoryManagerConfig::default()
//!     .with_growth(CreateBaseAllocatorInfo::multipool(4 << 20, 4096));
//! let mut manager = MemoryManager::new(AllocatorPolymorphic::malloc(), config)?;
//! let handle = unsafe { manager.polymorphic(ConcurrencyMode::ThreadSafe) };
//!
//! let block = allocate(handle, 256, 16);
//! // ... use block ...
//! unsafe { deallocate(handle, block) };
//! # Ok::<(), polyalloc::AllocatorError>(())
//! ```
//!
//! Allocation failure crashes by default with a `PA001` diagnostic. Call
//! [`AllocatorBase::exit_crash_on_allocation_failure`] to get null instead.

pub mod api;
pub mod debug;
pub mod diagnostics;

mod allocators;
mod error;
mod sync;
mod util;

// Re-export public API at crate root for convenience
pub use api::base::{AllocatorBase, AllocatorHeader, MemoryRegion};
pub use api::config::{DebugManagerConfig, MemoryManagerConfig, ProfilerConfig, ResizableLinearConfig};
pub use api::debug_info::DebugInfo;
pub use api::kind::{AllocatorKind, ConcurrencyMode, ALLOCATOR_KIND_COUNT};
pub use api::polymorphic::{
    allocate, allocate_ex, allocator_buffer, allocator_current_usage, allocator_regions,
    belongs_to_allocator, clear_allocator, deallocate, deallocate_ex, deallocate_if_belongs,
    deallocate_no_assert, deallocate_no_assert_ex, free_allocator, reallocate, reallocate_ex,
    reallocate_with_copy, AllocatorPolymorphic,
};

// Allocators
pub use allocators::{
    BaseAllocator, CreateBaseAllocatorInfo, LinearMarker, MallocAllocator, MemoryArena, MemoryManager,
    MultipoolAllocator, ResizableLinearAllocator, StackAllocator, MALLOC_ALLOCATOR,
    MAX_MEMORY_MANAGER_POOLS, MAX_RESIZABLE_LINEAR_CHUNKS,
};

// Debug tracking and profiling
pub use debug::{DebugAllocatorManager, TrackedCall, TrackedOperation};
pub use diagnostics::{AllocatorProfile, AllocatorProfiler, ProfileEvent};

// Errors
pub use error::{AllocatorError, Result};

// Synchronization primitives, usable on their own
pub use sync::{ReadWriteLock, SpinLock, SpinMutex};

// Size helpers
pub use util::size::{kb, mb};
