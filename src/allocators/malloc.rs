//! Allocator over the system heap, also used as the process-wide fallback.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;

use crate::api::base::{instance_key, unsupported, AllocatorBase, AllocatorHeader, MemoryRegion};
use crate::api::debug_info::DebugInfo;
use crate::api::kind::AllocatorKind;
use crate::sync::UsageGauge;
use crate::util::layout::align_up;

/// Bytes in front of every block holding its size and alignment.
const HEADER_SIZE: usize = 2 * std::mem::size_of::<usize>();

/// Fill pattern for released blocks when the `debug` feature is on.
#[cfg(feature = "debug")]
const FREED_PATTERN: u8 = 0xCD;

/// The allocator behind null handles.
pub static MALLOC_ALLOCATOR: MallocAllocator = MallocAllocator::new();

/// Wrapper around the system allocator.
///
/// Each block carries a small header recording its size and alignment, so
/// deallocation needs only the pointer. Ownership queries, `clear` and
/// `free` are not supported: the system heap cannot enumerate its blocks.
#[derive(Debug)]
pub struct MallocAllocator {
    header: AllocatorHeader,
    usage: UsageGauge,
}

impl MallocAllocator {
    /// Create a new system heap wrapper.
    pub const fn new() -> Self {
        Self {
            header: AllocatorHeader::new(),
            usage: UsageGauge::new(),
        }
    }

    /// Live allocation count.
    pub fn allocation_count(&self) -> usize {
        self.usage.count()
    }

    /// Highest usage reached.
    pub fn peak_usage(&self) -> usize {
        self.usage.peak()
    }

    fn raw_allocate(&self, size: usize, alignment: usize) -> *mut u8 {
        // Any power of two; `Layout` rejects the ones the platform can't honour.
        if !alignment.is_power_of_two() {
            return ptr::null_mut();
        }
        let offset = align_up(HEADER_SIZE, alignment);
        let Some(total) = offset.checked_add(size) else {
            return ptr::null_mut();
        };
        let Ok(layout) = Layout::from_size_align(total, alignment.max(HEADER_SIZE)) else {
            return ptr::null_mut();
        };

        // SAFETY: the layout is non-zero sized because of the header.
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return base;
        }

        // SAFETY: `offset >= HEADER_SIZE`, so the header fits in front of
        // the block and inside the allocation.
        unsafe {
            let block = base.add(offset);
            let header = block.sub(HEADER_SIZE).cast::<usize>();
            header.write(size);
            header.add(1).write(alignment);
            self.usage.record_alloc(size);
            block
        }
    }

    /// Size of a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of a `MallocAllocator`.
    unsafe fn block_size(ptr: *mut u8) -> usize {
        ptr.sub(HEADER_SIZE).cast::<usize>().read()
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this allocator.
    unsafe fn raw_deallocate(&self, ptr: *mut u8) {
        let header = ptr.sub(HEADER_SIZE).cast::<usize>();
        let size = header.read();
        let alignment = header.add(1).read();
        let offset = align_up(HEADER_SIZE, alignment);

        #[cfg(feature = "debug")]
        ptr::write_bytes(ptr, FREED_PATTERN, size);

        // SAFETY: the layout was valid when the block was allocated.
        let layout = Layout::from_size_align_unchecked(offset + size, alignment.max(HEADER_SIZE));
        dealloc(ptr.sub(offset), layout);
        self.usage.record_dealloc(size);
    }

    /// Allocate, copy `min(old, new)` bytes, release the old block.
    unsafe fn raw_reallocate(&self, ptr: *mut u8, new_size: usize, alignment: usize) -> *mut u8 {
        let new = self.raw_allocate(new_size, alignment);
        if !new.is_null() {
            let old_size = Self::block_size(ptr);
            ptr::copy_nonoverlapping(ptr, new, old_size.min(new_size));
            self.raw_deallocate(ptr);
        }
        new
    }

    fn finish_allocate(&self, ptr: *mut u8, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        self.header.on_allocate(
            instance_key(self),
            AllocatorKind::Malloc,
            ptr,
            size,
            alignment,
            info,
            || self.usage.bytes(),
        )
    }

    unsafe fn finish_deallocate(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        self.raw_deallocate(ptr);
        self.header.on_deallocate(
            instance_key(self),
            AllocatorKind::Malloc,
            ptr,
            true,
            info,
            || self.usage.bytes(),
        )
    }

    unsafe fn finish_reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let new = self.raw_reallocate(ptr, new_size, alignment);
        self.header.on_reallocate(
            instance_key(self),
            AllocatorKind::Malloc,
            ptr,
            new,
            new_size,
            alignment,
            info,
            || self.usage.bytes(),
        )
    }
}

impl Default for MallocAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorBase for MallocAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Malloc
    }

    fn header(&self) -> &AllocatorHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut AllocatorHeader {
        &mut self.header
    }

    fn allocate(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.raw_allocate(size, alignment);
        self.finish_allocate(ptr, size, alignment, info)
    }

    fn allocate_ts(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.raw_allocate(size, alignment);
        self.finish_allocate(ptr, size, alignment, info)
    }

    unsafe fn deallocate_no_assert(&mut self, ptr: *mut u8, info: DebugInfo) -> bool {
        self.finish_deallocate(ptr, info)
    }

    unsafe fn deallocate_no_assert_ts(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        self.finish_deallocate(ptr, info)
    }

    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        self.finish_reallocate(ptr, new_size, alignment, info)
    }

    unsafe fn reallocate_ts(
        &self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        self.finish_reallocate(ptr, new_size, alignment, info)
    }

    #[track_caller]
    fn clear(&mut self, info: DebugInfo) {
        unsupported(AllocatorKind::Malloc, "clear", info)
    }

    #[track_caller]
    fn free(&mut self, info: DebugInfo) {
        unsupported(AllocatorKind::Malloc, "free", info)
    }

    #[track_caller]
    fn belongs(&self, _ptr: *const u8) -> bool {
        unsupported(AllocatorKind::Malloc, "belongs", DebugInfo::caller())
    }

    fn current_usage(&self) -> usize {
        self.usage.bytes()
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        Vec::new()
    }

    fn buffer(&self) -> *mut u8 {
        ptr::null_mut()
    }
}
