//! Synchronization primitives.
//!
//! Allocators use the hand-rolled [`SpinLock`]/[`SpinMutex`] for their
//! thread-safe paths and the debug manager uses [`ReadWriteLock`].
//! [`Mutex`] is a thin wrapper over std or parking_lot for cold
//! bookkeeping such as the profiler's aggregated state.

pub mod atomics;
pub mod mutex;
pub mod rwlock;
pub mod spin;

pub use atomics::UsageGauge;
pub use mutex::Mutex;
pub use rwlock::ReadWriteLock;
pub use spin::{SpinLock, SpinMutex};
