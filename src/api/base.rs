//! The contract every concrete allocator implements.

use crate::debug::{DebugAllocatorManager, TrackedCall, TrackedOperation};
use crate::diagnostics::emit::fatal;
use crate::diagnostics::kind::{PA001, PA002, PA003};
use crate::diagnostics::profiler::{AllocatorProfiler, ProfileEvent};

use super::debug_info::DebugInfo;
use super::kind::{AllocatorKind, ConcurrencyMode};
use super::polymorphic::AllocatorPolymorphic;

pub(crate) mod sealed {
    use crate::allocators::{
        MallocAllocator, MemoryArena, MemoryManager, MultipoolAllocator, ResizableLinearAllocator,
        StackAllocator,
    };

    /// Types whose own address is what the dispatch table for their kind
    /// expects. `BaseAllocator` is not one: its handle points at the
    /// wrapped allocator, not at the enum.
    pub trait Concrete {}

    impl Concrete for StackAllocator {}
    impl Concrete for MultipoolAllocator {}
    impl Concrete for MemoryArena {}
    impl Concrete for MemoryManager {}
    impl Concrete for ResizableLinearAllocator {}
    impl Concrete for MallocAllocator {}
}

/// A contiguous span of memory owned by an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First byte of the region.
    pub start: *mut u8,
    /// Size in bytes.
    pub size: usize,
}

impl MemoryRegion {
    /// Create a region.
    pub const fn new(start: *mut u8, size: usize) -> Self {
        Self { start, size }
    }

    /// Whether `ptr` lies inside the region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        crate::util::layout::in_range(ptr, self.start, self.size)
    }
}

/// Flags shared by every allocator.
///
/// Both observer flags are checked on each hot-path call; with both off
/// the cost is two predictable branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorHeader {
    pub(crate) crash_on_allocation_failure: bool,
    pub(crate) debug_mode: bool,
    pub(crate) profiling_mode: bool,
}

impl AllocatorHeader {
    /// Default header: crash on failure, no observers.
    pub const fn new() -> Self {
        Self {
            crash_on_allocation_failure: true,
            debug_mode: false,
            profiling_mode: false,
        }
    }

    /// Header for sub-allocators owned by a composite, which must report
    /// failure as null so the composite can try elsewhere.
    pub(crate) const fn nested() -> Self {
        Self {
            crash_on_allocation_failure: false,
            debug_mode: false,
            profiling_mode: false,
        }
    }

    /// Whether a failed allocation crashes.
    pub fn crash_on_allocation_failure(&self) -> bool {
        self.crash_on_allocation_failure
    }

    /// Whether calls are recorded in the debug manager.
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Whether usage samples are sent to the profiler.
    pub fn profiling_mode(&self) -> bool {
        self.profiling_mode
    }

    /// Apply the failure policy and notify observers after an allocation.
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_allocate(
        &self,
        key: usize,
        kind: AllocatorKind,
        ptr: *mut u8,
        size: usize,
        alignment: usize,
        info: DebugInfo,
        usage: impl FnOnce() -> usize,
    ) -> *mut u8 {
        if ptr.is_null() {
            if self.crash_on_allocation_failure {
                allocation_failure(kind, key, size, alignment, info);
            }
            return ptr;
        }

        if self.debug_mode {
            DebugAllocatorManager::global().record(
                key,
                kind,
                TrackedCall::new(TrackedOperation::Allocate, info)
                    .with_pointer(ptr)
                    .with_size(size, alignment),
            );
        }
        if self.profiling_mode {
            AllocatorProfiler::global().record(key, kind, ProfileEvent::Allocate, usage());
        }
        ptr
    }

    /// Notify observers after a deallocation attempt.
    #[inline]
    pub(crate) fn on_deallocate(
        &self,
        key: usize,
        kind: AllocatorKind,
        ptr: *mut u8,
        succeeded: bool,
        info: DebugInfo,
        usage: impl FnOnce() -> usize,
    ) -> bool {
        if !succeeded {
            return false;
        }

        if self.debug_mode {
            DebugAllocatorManager::global().record(
                key,
                kind,
                TrackedCall::new(TrackedOperation::Deallocate, info).with_pointer(ptr),
            );
        }
        if self.profiling_mode {
            AllocatorProfiler::global().record(key, kind, ProfileEvent::Deallocate, usage());
        }
        true
    }

    /// Apply the failure policy and notify observers after a reallocation.
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_reallocate(
        &self,
        key: usize,
        kind: AllocatorKind,
        old: *mut u8,
        new: *mut u8,
        size: usize,
        alignment: usize,
        info: DebugInfo,
        usage: impl FnOnce() -> usize,
    ) -> *mut u8 {
        if new.is_null() {
            if self.crash_on_allocation_failure {
                allocation_failure(kind, key, size, alignment, info);
            }
            return new;
        }

        if self.debug_mode {
            DebugAllocatorManager::global().record(
                key,
                kind,
                TrackedCall::new(TrackedOperation::Reallocate, info)
                    .with_pointer(old)
                    .with_new_pointer(new)
                    .with_size(size, alignment),
            );
        }
        if self.profiling_mode {
            AllocatorProfiler::global().record(key, kind, ProfileEvent::Reallocate, usage());
        }
        new
    }

    /// Notify observers of a whole-allocator operation (clear, free, rewind).
    #[inline]
    pub(crate) fn on_operation(
        &self,
        key: usize,
        kind: AllocatorKind,
        operation: TrackedOperation,
        info: DebugInfo,
        usage: impl FnOnce() -> usize,
    ) {
        if self.debug_mode {
            DebugAllocatorManager::global().record(key, kind, TrackedCall::new(operation, info));
        }
        if self.profiling_mode {
            let event = match operation {
                TrackedOperation::ReturnToMarker => ProfileEvent::Rewind,
                _ => ProfileEvent::Clear,
            };
            AllocatorProfiler::global().record(key, kind, event, usage());
        }
    }
}

impl Default for AllocatorHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Address used to identify an allocator in the debug manager and profiler.
#[inline]
pub(crate) fn instance_key<T: ?Sized>(instance: &T) -> usize {
    (instance as *const T).cast::<()>() as usize
}

#[cold]
#[track_caller]
fn allocation_failure(
    kind: AllocatorKind,
    key: usize,
    size: usize,
    alignment: usize,
    info: DebugInfo,
) -> ! {
    fatal(
        &PA001,
        &format!(
            "{} allocator {:#x} failed to allocate {} bytes (alignment {}) at {}",
            kind, key, size, alignment, info
        ),
    )
}

/// Crash for a deallocation the allocator rejected.
#[cold]
#[track_caller]
pub(crate) fn invalid_deallocation(kind: AllocatorKind, ptr: *const u8, info: DebugInfo) -> ! {
    fatal(
        &PA002,
        &format!("{} allocator cannot deallocate {:p} at {}", kind, ptr, info),
    )
}

/// Crash for an operation the allocator kind does not support.
#[cold]
#[track_caller]
pub(crate) fn unsupported(kind: AllocatorKind, operation: &str, info: DebugInfo) -> ! {
    fatal(
        &PA003,
        &format!("{} is not supported by the {} allocator at {}", operation, kind, info),
    )
}

/// Uniform interface of every allocator.
///
/// The single-threaded methods take `&mut self` and never lock. The `_ts`
/// methods take `&self` and may be called concurrently. Allocation failure
/// follows the header's policy: crash by default, null after
/// [`exit_crash_on_allocation_failure`](Self::exit_crash_on_allocation_failure).
///
/// Allocators that have debug or profiling mode enabled are identified by
/// address and must not move afterwards.
pub trait AllocatorBase {
    /// The kind tag of this allocator.
    fn kind(&self) -> AllocatorKind;

    /// Shared flags.
    fn header(&self) -> &AllocatorHeader;

    /// Shared flags, mutably.
    fn header_mut(&mut self) -> &mut AllocatorHeader;

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    fn allocate(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8;

    /// Thread-safe [`allocate`](Self::allocate).
    fn allocate_ts(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8;

    /// Release `ptr`, returning `false` if it does not look like a live
    /// allocation of this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null. If it lies inside one of this allocator's
    /// regions, the byte before it must be readable.
    unsafe fn deallocate_no_assert(&mut self, ptr: *mut u8, info: DebugInfo) -> bool;

    /// Thread-safe [`deallocate_no_assert`](Self::deallocate_no_assert).
    ///
    /// # Safety
    ///
    /// Same as [`deallocate_no_assert`](Self::deallocate_no_assert).
    unsafe fn deallocate_no_assert_ts(&self, ptr: *mut u8, info: DebugInfo) -> bool;

    /// Release `ptr`, crashing if the allocator rejects it.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not yet released.
    #[track_caller]
    unsafe fn deallocate(&mut self, ptr: *mut u8, info: DebugInfo) {
        if !self.deallocate_no_assert(ptr, info) {
            invalid_deallocation(self.kind(), ptr, info);
        }
    }

    /// Thread-safe [`deallocate`](Self::deallocate).
    ///
    /// # Safety
    ///
    /// Same as [`deallocate`](Self::deallocate).
    #[track_caller]
    unsafe fn deallocate_ts(&self, ptr: *mut u8, info: DebugInfo) {
        if !self.deallocate_no_assert_ts(ptr, info) {
            invalid_deallocation(self.kind(), ptr, info);
        }
    }

    /// Resize the block at `ptr`.
    ///
    /// Whether the payload is carried over depends on the allocator; see
    /// each implementation. Returns null on failure (or crashes, per policy)
    /// and leaves the old block untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not yet released.
    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8;

    /// Thread-safe [`reallocate`](Self::reallocate).
    ///
    /// # Safety
    ///
    /// Same as [`reallocate`](Self::reallocate).
    unsafe fn reallocate_ts(
        &self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8;

    /// Drop every allocation at once, keeping the backing memory.
    fn clear(&mut self, info: DebugInfo);

    /// Release the backing memory. Only allocators that own their memory
    /// support this.
    #[track_caller]
    fn free(&mut self, info: DebugInfo) {
        unsupported(self.kind(), "free", info);
    }

    /// Whether `ptr` lies in memory managed by this allocator.
    fn belongs(&self, ptr: *const u8) -> bool;

    /// Bytes currently handed out, including alignment overhead.
    fn current_usage(&self) -> usize;

    /// Whether nothing is allocated.
    fn is_empty(&self) -> bool {
        self.current_usage() == 0
    }

    /// The memory spans this allocator manages.
    fn regions(&self) -> Vec<MemoryRegion>;

    /// The primary backing buffer, or null if there is none.
    fn buffer(&self) -> *mut u8;

    /// Return null instead of crashing when an allocation fails.
    fn exit_crash_on_allocation_failure(&mut self) {
        self.header_mut().crash_on_allocation_failure = false;
    }

    /// Restore or change the failure policy.
    fn set_crash_on_allocation_failure(&mut self, crash: bool) {
        self.header_mut().crash_on_allocation_failure = crash;
    }

    /// Record calls into the debug manager.
    ///
    /// `resizable` selects an unbounded log instead of the fixed ring;
    /// calling again with `true` promotes an existing ring.
    fn set_debug_mode(&mut self, enabled: bool, resizable: bool) {
        self.header_mut().debug_mode = enabled;
        if enabled {
            let kind = self.kind();
            DebugAllocatorManager::global().register(instance_key(&*self), kind, resizable);
        }
    }

    /// Send usage samples to the profiler.
    fn set_profiling_mode(&mut self, enabled: bool) {
        self.header_mut().profiling_mode = enabled;
    }

    /// Create a type-erased handle to this allocator.
    ///
    /// # Safety
    ///
    /// The allocator must outlive every copy of the handle and must not
    /// move while a handle is in use. With [`ConcurrencyMode::SingleThreaded`]
    /// the caller must also ensure no other access happens concurrently.
    unsafe fn polymorphic(&mut self, mode: ConcurrencyMode) -> AllocatorPolymorphic
    where
        Self: Sized + sealed::Concrete,
    {
        AllocatorPolymorphic::new(self, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_defaults() {
        let header = AllocatorHeader::default();
        assert!(header.crash_on_allocation_failure());
        assert!(!header.debug_mode());
        assert!(!header.profiling_mode());

        let nested = AllocatorHeader::nested();
        assert!(!nested.crash_on_allocation_failure());
    }

    #[test]
    fn test_null_without_crash_policy() {
        let header = AllocatorHeader::nested();
        let ptr = header.on_allocate(
            0x1000,
            AllocatorKind::Stack,
            std::ptr::null_mut(),
            64,
            8,
            DebugInfo::none(),
            || 0,
        );
        assert!(ptr.is_null());
    }

    #[test]
    #[should_panic(expected = "PA001")]
    fn test_crash_policy() {
        crate::diagnostics::suppress_diagnostics(true);
        let header = AllocatorHeader::new();
        header.on_allocate(
            0x1000,
            AllocatorKind::Multipool,
            std::ptr::null_mut(),
            64,
            8,
            DebugInfo::none(),
            || 0,
        );
    }

    #[test]
    fn test_region_contains() {
        let mut buffer = [0u8; 32];
        let region = MemoryRegion::new(buffer.as_mut_ptr(), buffer.len());
        assert!(region.contains(buffer.as_ptr()));
        assert!(region.contains(unsafe { buffer.as_ptr().add(31) }));
        assert!(!region.contains(unsafe { buffer.as_ptr().add(32) }));
    }
}
