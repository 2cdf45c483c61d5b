//! Type-erased allocator handles and the free-function API.
//!
//! A handle is a `(pointer, kind, mode)` triple. Every operation indexes a
//! function-pointer table by the kind tag and picks the single-threaded or
//! thread-safe entry by the mode, so a call costs one indirect jump and no
//! vtable lookup. A null instance routes to [`MALLOC_ALLOCATOR`].
//!
//! [`MALLOC_ALLOCATOR`]: crate::allocators::MALLOC_ALLOCATOR

use std::ptr;

use crate::allocators::MALLOC_ALLOCATOR;

use super::base::{invalid_deallocation, sealed, unsupported, AllocatorBase, MemoryRegion};
use super::debug_info::DebugInfo;
use super::kind::{for_each_allocator_kind, AllocatorKind, ConcurrencyMode, ALLOCATOR_KIND_COUNT};

/// Non-owning, type-erased reference to an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorPolymorphic {
    instance: *mut (),
    kind: AllocatorKind,
    mode: ConcurrencyMode,
}

// SAFETY: the handle is a plain address. Whether concurrent use is sound
// is part of the contract of the unsafe constructors.
unsafe impl Send for AllocatorPolymorphic {}
unsafe impl Sync for AllocatorPolymorphic {}

impl AllocatorPolymorphic {
    /// Handle to the process-wide malloc fallback.
    pub const fn malloc() -> Self {
        Self {
            instance: ptr::null_mut(),
            kind: AllocatorKind::Malloc,
            mode: ConcurrencyMode::ThreadSafe,
        }
    }

    /// Create a handle to `allocator`.
    ///
    /// # Safety
    ///
    /// `allocator` must outlive every copy of the handle and must not move
    /// while the handle is in use. Single-threaded handles must not be used
    /// from more than one thread at a time.
    ///
    /// Only concrete allocator types are accepted; use
    /// [`BaseAllocator::polymorphic`](crate::BaseAllocator::polymorphic) for
    /// the composite wrapper.
    pub unsafe fn new<A>(allocator: &mut A, mode: ConcurrencyMode) -> Self
    where
        A: AllocatorBase + sealed::Concrete,
    {
        Self {
            instance: (allocator as *mut A).cast(),
            kind: allocator.kind(),
            mode,
        }
    }

    /// Create a handle from raw parts.
    ///
    /// # Safety
    ///
    /// `instance` must be null or point to a live allocator whose concrete
    /// type matches `kind`, under the same rules as [`new`](Self::new).
    pub const unsafe fn from_raw_parts(
        instance: *mut (),
        kind: AllocatorKind,
        mode: ConcurrencyMode,
    ) -> Self {
        Self { instance, kind, mode }
    }

    /// The same allocator with a different concurrency mode.
    pub const fn with_mode(self, mode: ConcurrencyMode) -> Self {
        Self { mode, ..self }
    }

    /// Whether this is the malloc fallback.
    pub fn is_malloc(&self) -> bool {
        self.instance.is_null()
    }

    /// The instance address (null for the malloc fallback).
    pub fn instance(&self) -> *mut () {
        self.instance
    }

    /// Kind tag.
    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    /// Concurrency mode.
    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }
}

impl Default for AllocatorPolymorphic {
    fn default() -> Self {
        Self::malloc()
    }
}

type AllocateFn = unsafe fn(*mut (), usize, usize, DebugInfo) -> *mut u8;
type DeallocateFn = unsafe fn(*mut (), *mut u8, DebugInfo) -> bool;
type ReallocateFn = unsafe fn(*mut (), *mut u8, usize, usize, DebugInfo) -> *mut u8;
type BelongsFn = unsafe fn(*mut (), *const u8) -> bool;
type ClearFn = unsafe fn(*mut (), DebugInfo);
type BufferFn = unsafe fn(*mut ()) -> *mut u8;
type UsageFn = unsafe fn(*mut ()) -> usize;
type RegionsFn = unsafe fn(*mut ()) -> Vec<MemoryRegion>;

unsafe fn allocate_st<A: AllocatorBase>(
    instance: *mut (),
    size: usize,
    alignment: usize,
    info: DebugInfo,
) -> *mut u8 {
    (*instance.cast::<A>()).allocate(size, alignment, info)
}

unsafe fn allocate_ts<A: AllocatorBase>(
    instance: *mut (),
    size: usize,
    alignment: usize,
    info: DebugInfo,
) -> *mut u8 {
    (*instance.cast::<A>().cast_const()).allocate_ts(size, alignment, info)
}

unsafe fn deallocate_st<A: AllocatorBase>(instance: *mut (), ptr: *mut u8, info: DebugInfo) -> bool {
    (*instance.cast::<A>()).deallocate_no_assert(ptr, info)
}

unsafe fn deallocate_ts<A: AllocatorBase>(instance: *mut (), ptr: *mut u8, info: DebugInfo) -> bool {
    (*instance.cast::<A>().cast_const()).deallocate_no_assert_ts(ptr, info)
}

unsafe fn reallocate_st<A: AllocatorBase>(
    instance: *mut (),
    ptr: *mut u8,
    new_size: usize,
    alignment: usize,
    info: DebugInfo,
) -> *mut u8 {
    (*instance.cast::<A>()).reallocate(ptr, new_size, alignment, info)
}

unsafe fn reallocate_ts<A: AllocatorBase>(
    instance: *mut (),
    ptr: *mut u8,
    new_size: usize,
    alignment: usize,
    info: DebugInfo,
) -> *mut u8 {
    (*instance.cast::<A>().cast_const()).reallocate_ts(ptr, new_size, alignment, info)
}

unsafe fn belongs<A: AllocatorBase>(instance: *mut (), ptr: *const u8) -> bool {
    (*instance.cast::<A>().cast_const()).belongs(ptr)
}

unsafe fn clear<A: AllocatorBase>(instance: *mut (), info: DebugInfo) {
    (*instance.cast::<A>()).clear(info)
}

unsafe fn free<A: AllocatorBase>(instance: *mut (), info: DebugInfo) {
    (*instance.cast::<A>()).free(info)
}

unsafe fn buffer<A: AllocatorBase>(instance: *mut ()) -> *mut u8 {
    (*instance.cast::<A>().cast_const()).buffer()
}

unsafe fn current_usage<A: AllocatorBase>(instance: *mut ()) -> usize {
    (*instance.cast::<A>().cast_const()).current_usage()
}

unsafe fn regions<A: AllocatorBase>(instance: *mut ()) -> Vec<MemoryRegion> {
    (*instance.cast::<A>().cast_const()).regions()
}

macro_rules! define_dispatch_tables {
    ($($kind:ident => $ty:ty),* $(,)?) => {
        static ALLOCATE: [AllocateFn; ALLOCATOR_KIND_COUNT] = [$(allocate_st::<$ty>),*];
        static ALLOCATE_TS: [AllocateFn; ALLOCATOR_KIND_COUNT] = [$(allocate_ts::<$ty>),*];
        static DEALLOCATE: [DeallocateFn; ALLOCATOR_KIND_COUNT] = [$(deallocate_st::<$ty>),*];
        static DEALLOCATE_TS: [DeallocateFn; ALLOCATOR_KIND_COUNT] = [$(deallocate_ts::<$ty>),*];
        static REALLOCATE: [ReallocateFn; ALLOCATOR_KIND_COUNT] = [$(reallocate_st::<$ty>),*];
        static REALLOCATE_TS: [ReallocateFn; ALLOCATOR_KIND_COUNT] = [$(reallocate_ts::<$ty>),*];
        static BELONGS: [BelongsFn; ALLOCATOR_KIND_COUNT] = [$(belongs::<$ty>),*];
        static CLEAR: [ClearFn; ALLOCATOR_KIND_COUNT] = [$(clear::<$ty>),*];
        static FREE: [ClearFn; ALLOCATOR_KIND_COUNT] = [$(free::<$ty>),*];
        static BUFFER: [BufferFn; ALLOCATOR_KIND_COUNT] = [$(buffer::<$ty>),*];
        static CURRENT_USAGE: [UsageFn; ALLOCATOR_KIND_COUNT] = [$(current_usage::<$ty>),*];
        static REGIONS: [RegionsFn; ALLOCATOR_KIND_COUNT] = [$(regions::<$ty>),*];
    };
}

for_each_allocator_kind!(define_dispatch_tables);

/// Allocate through a handle, recording the caller as debug info.
#[track_caller]
#[inline]
pub fn allocate(allocator: AllocatorPolymorphic, size: usize, alignment: usize) -> *mut u8 {
    allocate_ex(allocator, size, alignment, DebugInfo::caller())
}

/// Allocate through a handle.
#[inline]
pub fn allocate_ex(
    allocator: AllocatorPolymorphic,
    size: usize,
    alignment: usize,
    info: DebugInfo,
) -> *mut u8 {
    if allocator.is_malloc() {
        return MALLOC_ALLOCATOR.allocate_ts(size, alignment, info);
    }

    let index = allocator.kind as usize;
    // SAFETY: the handle's constructor guarantees a live instance of the
    // type registered for its kind.
    unsafe {
        match allocator.mode {
            ConcurrencyMode::SingleThreaded => ALLOCATE[index](allocator.instance, size, alignment, info),
            ConcurrencyMode::ThreadSafe => ALLOCATE_TS[index](allocator.instance, size, alignment, info),
        }
    }
}

/// Deallocate through a handle, crashing if the allocator rejects `ptr`.
/// Null is ignored.
///
/// # Safety
///
/// `ptr` must have been returned by this allocator and not yet released.
#[track_caller]
#[inline]
pub unsafe fn deallocate(allocator: AllocatorPolymorphic, ptr: *mut u8) {
    deallocate_ex(allocator, ptr, DebugInfo::caller())
}

/// Deallocate through a handle with explicit debug info.
///
/// # Safety
///
/// Same as [`deallocate`].
#[track_caller]
pub unsafe fn deallocate_ex(allocator: AllocatorPolymorphic, ptr: *mut u8, info: DebugInfo) {
    if ptr.is_null() {
        return;
    }
    if !deallocate_no_assert_ex(allocator, ptr, info) {
        invalid_deallocation(allocator.kind, ptr, info);
    }
}

/// Deallocate through a handle, returning `false` when the allocator
/// rejects `ptr`.
///
/// # Safety
///
/// `ptr` must be non-null, and if it lies inside the allocator's memory
/// the byte before it must be readable.
#[track_caller]
#[inline]
pub unsafe fn deallocate_no_assert(allocator: AllocatorPolymorphic, ptr: *mut u8) -> bool {
    deallocate_no_assert_ex(allocator, ptr, DebugInfo::caller())
}

/// [`deallocate_no_assert`] with explicit debug info.
///
/// # Safety
///
/// Same as [`deallocate_no_assert`].
pub unsafe fn deallocate_no_assert_ex(
    allocator: AllocatorPolymorphic,
    ptr: *mut u8,
    info: DebugInfo,
) -> bool {
    if allocator.is_malloc() {
        return MALLOC_ALLOCATOR.deallocate_no_assert_ts(ptr, info);
    }

    let index = allocator.kind as usize;
    match allocator.mode {
        ConcurrencyMode::SingleThreaded => DEALLOCATE[index](allocator.instance, ptr, info),
        ConcurrencyMode::ThreadSafe => DEALLOCATE_TS[index](allocator.instance, ptr, info),
    }
}

/// Deallocate `ptr` only if it belongs to the allocator.
///
/// Not available for the malloc fallback, which cannot answer ownership.
///
/// # Safety
///
/// If `ptr` belongs to the allocator it must be a live allocation of it.
#[track_caller]
pub unsafe fn deallocate_if_belongs(allocator: AllocatorPolymorphic, ptr: *mut u8) -> bool {
    let info = DebugInfo::caller();
    if ptr.is_null() || !belongs_to_allocator(allocator, ptr) {
        return false;
    }
    deallocate_ex(allocator, ptr, info);
    true
}

/// Reallocate through a handle, recording the caller as debug info.
///
/// A null `ptr` behaves like [`allocate`]. Whether the payload moves with
/// the block depends on the allocator; use [`reallocate_with_copy`] for
/// `realloc` semantics.
///
/// # Safety
///
/// `ptr` must be null or a live allocation of this allocator.
#[track_caller]
#[inline]
pub unsafe fn reallocate(
    allocator: AllocatorPolymorphic,
    ptr: *mut u8,
    new_size: usize,
    alignment: usize,
) -> *mut u8 {
    reallocate_ex(allocator, ptr, new_size, alignment, DebugInfo::caller())
}

/// Reallocate through a handle.
///
/// # Safety
///
/// Same as [`reallocate`].
pub unsafe fn reallocate_ex(
    allocator: AllocatorPolymorphic,
    ptr: *mut u8,
    new_size: usize,
    alignment: usize,
    info: DebugInfo,
) -> *mut u8 {
    if ptr.is_null() {
        return allocate_ex(allocator, new_size, alignment, info);
    }
    if allocator.is_malloc() {
        return MALLOC_ALLOCATOR.reallocate_ts(ptr, new_size, alignment, info);
    }

    let index = allocator.kind as usize;
    match allocator.mode {
        ConcurrencyMode::SingleThreaded => {
            REALLOCATE[index](allocator.instance, ptr, new_size, alignment, info)
        }
        ConcurrencyMode::ThreadSafe => {
            REALLOCATE_TS[index](allocator.instance, ptr, new_size, alignment, info)
        }
    }
}

/// Move a block into a new allocation of `new_size` bytes, copying
/// `min(old_size, new_size)` bytes, then release the old block.
///
/// Returns null (leaving the old block alive) if the new allocation fails.
///
/// # Safety
///
/// `ptr` must be null or a live allocation of this allocator of at least
/// `old_size` bytes.
#[track_caller]
pub unsafe fn reallocate_with_copy(
    allocator: AllocatorPolymorphic,
    ptr: *mut u8,
    old_size: usize,
    new_size: usize,
    alignment: usize,
) -> *mut u8 {
    let info = DebugInfo::caller();
    let new = allocate_ex(allocator, new_size, alignment, info);
    if new.is_null() || ptr.is_null() {
        return new;
    }

    ptr::copy_nonoverlapping(ptr, new, old_size.min(new_size));
    deallocate_ex(allocator, ptr, info);
    new
}

/// Drop every allocation of the allocator.
#[track_caller]
pub fn clear_allocator(allocator: AllocatorPolymorphic) {
    let info = DebugInfo::caller();
    if allocator.is_malloc() {
        unsupported(AllocatorKind::Malloc, "clear", info);
    }
    // SAFETY: see `allocate_ex`.
    unsafe { CLEAR[allocator.kind as usize](allocator.instance, info) }
}

/// Release the allocator's backing memory.
#[track_caller]
pub fn free_allocator(allocator: AllocatorPolymorphic) {
    let info = DebugInfo::caller();
    if allocator.is_malloc() {
        unsupported(AllocatorKind::Malloc, "free", info);
    }
    // SAFETY: see `allocate_ex`.
    unsafe { FREE[allocator.kind as usize](allocator.instance, info) }
}

/// Whether `ptr` belongs to the allocator.
///
/// Calling this on the malloc fallback is a programming error and crashes.
#[track_caller]
pub fn belongs_to_allocator(allocator: AllocatorPolymorphic, ptr: *const u8) -> bool {
    if allocator.is_malloc() {
        unsupported(AllocatorKind::Malloc, "belongs", DebugInfo::caller());
    }
    // SAFETY: see `allocate_ex`.
    unsafe { BELONGS[allocator.kind as usize](allocator.instance, ptr) }
}

/// Bytes currently handed out by the allocator.
pub fn allocator_current_usage(allocator: AllocatorPolymorphic) -> usize {
    if allocator.is_malloc() {
        return MALLOC_ALLOCATOR.current_usage();
    }
    // SAFETY: see `allocate_ex`.
    unsafe { CURRENT_USAGE[allocator.kind as usize](allocator.instance) }
}

/// Memory spans the allocator manages. Empty for the malloc fallback.
pub fn allocator_regions(allocator: AllocatorPolymorphic) -> Vec<MemoryRegion> {
    if allocator.is_malloc() {
        return Vec::new();
    }
    // SAFETY: see `allocate_ex`.
    unsafe { REGIONS[allocator.kind as usize](allocator.instance) }
}

/// The allocator's primary buffer. Null for the malloc fallback.
pub fn allocator_buffer(allocator: AllocatorPolymorphic) -> *mut u8 {
    if allocator.is_malloc() {
        return ptr::null_mut();
    }
    // SAFETY: see `allocate_ex`.
    unsafe { BUFFER[allocator.kind as usize](allocator.instance) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::{MultipoolAllocator, StackAllocator};
    use crate::util::layout::is_aligned;

    #[test]
    fn test_malloc_fallback() {
        let handle = AllocatorPolymorphic::malloc();
        assert!(handle.is_malloc());

        let ptr = allocate(handle, 100, 16);
        assert!(!ptr.is_null());
        assert!(is_aligned(ptr as usize, 16));

        unsafe {
            ptr.write_bytes(0xAB, 100);
            deallocate(handle, ptr);
        }
    }

    #[test]
    #[should_panic(expected = "PA003")]
    fn test_belongs_on_malloc_panics() {
        crate::diagnostics::suppress_diagnostics(true);
        let value = 0u8;
        belongs_to_allocator(AllocatorPolymorphic::malloc(), &value);
    }

    #[test]
    fn test_dispatch_matches_kind() {
        let mut buffer = vec![0u8; 4096];
        let mut stack = unsafe { StackAllocator::new(buffer.as_mut_ptr(), buffer.len()) };
        let handle = unsafe { stack.polymorphic(ConcurrencyMode::SingleThreaded) };
        assert_eq!(handle.kind(), AllocatorKind::Stack);

        let ptr = allocate(handle, 64, 8);
        assert!(belongs_to_allocator(handle, ptr));
        assert!(allocator_current_usage(handle) >= 64);
        assert_eq!(allocator_buffer(handle), buffer.as_mut_ptr());
        assert_eq!(allocator_regions(handle).len(), 1);

        clear_allocator(handle);
        assert_eq!(allocator_current_usage(handle), 0);
    }

    #[test]
    fn test_thread_safe_mode_dispatch() {
        let mut buffer = vec![0u8; 64 * 1024];
        let mut pool = unsafe { MultipoolAllocator::new(buffer.as_mut_ptr(), buffer.len(), 64) };
        let handle = unsafe { pool.polymorphic(ConcurrencyMode::ThreadSafe) };

        let a = allocate(handle, 128, 16);
        let b = allocate(handle, 256, 64);
        assert!(is_aligned(b as usize, 64));
        unsafe {
            assert!(deallocate_if_belongs(handle, a));
            deallocate(handle, b);
        }
        assert_eq!(allocator_current_usage(handle), 0);
    }

    #[test]
    fn test_deallocate_if_belongs_rejects_foreign() {
        let mut buffer = vec![0u8; 1024];
        let mut stack = unsafe { StackAllocator::new(buffer.as_mut_ptr(), buffer.len()) };
        let handle = unsafe { stack.polymorphic(ConcurrencyMode::SingleThreaded) };

        let mut other = [0u8; 16];
        assert!(!unsafe { deallocate_if_belongs(handle, other.as_mut_ptr()) });
        assert!(!unsafe { deallocate_if_belongs(handle, ptr::null_mut()) });
    }

    #[test]
    fn test_reallocate_with_copy_moves_payload() {
        let mut buffer = vec![0u8; 64 * 1024];
        let mut pool = unsafe { MultipoolAllocator::new(buffer.as_mut_ptr(), buffer.len(), 64) };
        let handle = unsafe { pool.polymorphic(ConcurrencyMode::SingleThreaded) };

        let old = allocate(handle, 32, 8);
        unsafe {
            for i in 0..32 {
                old.add(i).write(i as u8);
            }
            let new = reallocate_with_copy(handle, old, 32, 4096, 8);
            assert!(!new.is_null());
            for i in 0..32 {
                assert_eq!(new.add(i).read(), i as u8);
            }
            deallocate(handle, new);
        }
        assert_eq!(allocator_current_usage(handle), 0);
    }

    #[test]
    fn test_reallocate_null_allocates() {
        let handle = AllocatorPolymorphic::malloc();
        unsafe {
            let ptr = reallocate(handle, ptr::null_mut(), 48, 8);
            assert!(!ptr.is_null());
            deallocate(handle, ptr);
        }
    }
}
