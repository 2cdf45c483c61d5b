//! Allocation backends.
//!
//! This module contains the concrete allocator implementations.
//! **These are the only modules that should touch raw buffers.**

pub(crate) mod block_range;

mod arena;
mod base;
mod malloc;
mod manager;
mod multipool;
mod resizable_linear;
mod stack;

pub use arena::MemoryArena;
pub use base::{BaseAllocator, CreateBaseAllocatorInfo};
pub use malloc::{MallocAllocator, MALLOC_ALLOCATOR};
pub use manager::{MemoryManager, MAX_MEMORY_MANAGER_POOLS};
pub use multipool::MultipoolAllocator;
pub use resizable_linear::{LinearMarker, ResizableLinearAllocator, MAX_RESIZABLE_LINEAR_CHUNKS};
pub use stack::StackAllocator;
