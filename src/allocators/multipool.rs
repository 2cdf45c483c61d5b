//! General-purpose allocator over a fixed buffer, backed by [`BlockRange`].

use crate::api::base::{instance_key, AllocatorBase, AllocatorHeader, MemoryRegion};
use crate::api::debug_info::DebugInfo;
use crate::api::kind::AllocatorKind;
use crate::debug::TrackedOperation;
use crate::diagnostics::emit::emit_with_context;
use crate::diagnostics::kind::PA004;
use crate::sync::SpinMutex;
use crate::util::layout::{align_up, in_range, is_valid_alignment, CACHE_LINE_SIZE};
use crate::util::size::{block_shift_for, div_ceil};

use super::block_range::BlockRange;

struct MultipoolState {
    /// Start of the managed memory.
    buffer: *mut u8,
    /// Buffer size in bytes.
    size: usize,
    /// Log2 of the block size.
    block_shift: u32,
    /// Free-list over the blocks.
    range: BlockRange,
}

// SAFETY: the buffer is only touched through the state.
unsafe impl Send for MultipoolState {}

impl MultipoolState {
    #[inline]
    fn scale(&self) -> usize {
        1 << self.block_shift
    }

    fn allocate(&mut self, size: usize, alignment: usize) -> *mut u8 {
        if !is_valid_alignment(alignment) {
            return std::ptr::null_mut();
        }
        // `size + alignment` covers the header byte and the worst-case
        // alignment slack.
        let Some(total) = size.checked_add(alignment) else {
            return std::ptr::null_mut();
        };
        let count = div_ceil(total, self.scale());
        let Ok(count) = u32::try_from(count) else {
            return std::ptr::null_mut();
        };
        let Some(block) = self.range.request(count) else {
            return std::ptr::null_mut();
        };

        let base = self.buffer as usize;
        let block_address = base + ((block as usize) << self.block_shift);
        let aligned = align_up(block_address + 1, alignment);
        // Below `alignment`, so always below the cache line size.
        let back_offset = aligned - 1 - block_address;

        // SAFETY: the block holds `size + alignment` bytes starting at
        // `block_address`, which covers the header and the payload.
        unsafe {
            let ptr = self.buffer.add(aligned - base);
            ptr.sub(1).write(back_offset as u8);
            ptr
        }
    }

    /// Recover `(block index, back offset)` from a returned pointer.
    ///
    /// # Safety
    ///
    /// If `ptr` is inside the buffer, the byte before it must be readable.
    unsafe fn block_of(&self, ptr: *const u8) -> Option<(u32, usize)> {
        let base = self.buffer as usize;
        let address = ptr as usize;
        if address <= base || address >= base + self.size {
            return None;
        }

        let back_offset = ptr.sub(1).read() as usize;
        if back_offset >= CACHE_LINE_SIZE {
            return None;
        }
        let header = address - base - 1;
        let block_start = header.checked_sub(back_offset)?;
        if block_start & (self.scale() - 1) != 0 {
            return None;
        }
        u32::try_from(block_start >> self.block_shift)
            .ok()
            .map(|block| (block, back_offset))
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8) -> bool {
        match self.block_of(ptr) {
            Some((block, _)) => self.range.free(block),
            None => false,
        }
    }

    unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize, alignment: usize) -> *mut u8 {
        if alignment <= CACHE_LINE_SIZE && alignment.is_power_of_two() && ptr as usize % alignment == 0 {
            if let Some((block, back_offset)) = self.block_of(ptr) {
                let needed = div_ceil(back_offset + 1 + new_size, self.scale());
                if let Ok(needed) = u32::try_from(needed) {
                    if self.range.reallocate_block(block, needed).is_some() {
                        return ptr;
                    }
                }
            }
        }

        // The new block is taken before the old one is released, so the
        // old payload is still intact if the caller wants to copy it.
        let new = self.allocate(new_size, alignment);
        if !new.is_null() {
            self.deallocate(ptr);
        }
        new
    }

    fn usage(&self) -> usize {
        (self.range.used_block_count() as usize) << self.block_shift
    }
}

/// Multipool allocator.
///
/// The buffer is split into blocks of `2^block_shift` bytes, the smallest
/// power of two that lets a `u32` index cover the whole buffer. Each
/// allocation takes `ceil((size + alignment) / block)` blocks and stores a
/// one-byte back offset right before the returned pointer: the distance from
/// the block start to that header byte. The offset is always below
/// [`CACHE_LINE_SIZE`], so alignments above it are rejected. Deallocation
/// validates the byte and the block index, which makes speculative
/// [`deallocate_no_assert`](AllocatorBase::deallocate_no_assert) calls safe
/// for pointers inside the buffer.
///
/// [`reallocate`](AllocatorBase::reallocate) resizes in place when the
/// neighbouring blocks allow it. Otherwise it moves to a new block and does
/// not copy the payload.
pub struct MultipoolAllocator {
    header: AllocatorHeader,
    state: SpinMutex<MultipoolState>,
}

impl MultipoolAllocator {
    /// Create a multipool allocator over `size` bytes at `buffer` that
    /// tracks at most `pool_count` live allocations.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `size` bytes for the
    /// allocator's whole lifetime and not be used by anything else.
    pub unsafe fn new(buffer: *mut u8, size: usize, pool_count: usize) -> Self {
        Self::with_header(buffer, size, pool_count, AllocatorHeader::new())
    }

    pub(crate) unsafe fn with_header(
        buffer: *mut u8,
        size: usize,
        pool_count: usize,
        header: AllocatorHeader,
    ) -> Self {
        let block_shift = block_shift_for(size);
        let block_count = (size >> block_shift) as u32;
        Self {
            header,
            state: SpinMutex::new(MultipoolState {
                buffer,
                size,
                block_shift,
                range: BlockRange::new(block_count, pool_count),
            }),
        }
    }

    /// Largest `size + alignment` a fresh allocator of `size` bytes can hold.
    pub const fn max_allocation_size(size: usize) -> usize {
        let shift = block_shift_for(size);
        (size >> shift) << shift
    }

    /// Size of one block in bytes.
    pub fn block_size(&self) -> usize {
        self.state.lock().scale()
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.state.lock().range.used_range_count()
    }

    fn finish_allocate(&self, ptr: *mut u8, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        if ptr.is_null() && alignment > CACHE_LINE_SIZE {
            emit_with_context(&PA004, &format!("alignment {} at {}", alignment, info));
        }
        self.header.on_allocate(
            instance_key(self),
            AllocatorKind::Multipool,
            ptr,
            size,
            alignment,
            info,
            || self.current_usage(),
        )
    }

    fn finish_reallocate(
        &self,
        old: *mut u8,
        new: *mut u8,
        size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        self.header.on_reallocate(
            instance_key(self),
            AllocatorKind::Multipool,
            old,
            new,
            size,
            alignment,
            info,
            || self.current_usage(),
        )
    }
}

impl AllocatorBase for MultipoolAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Multipool
    }

    fn header(&self) -> &AllocatorHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut AllocatorHeader {
        &mut self.header
    }

    fn allocate(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.state.get_mut().allocate(size, alignment);
        self.finish_allocate(ptr, size, alignment, info)
    }

    fn allocate_ts(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.state.lock().allocate(size, alignment);
        self.finish_allocate(ptr, size, alignment, info)
    }

    unsafe fn deallocate_no_assert(&mut self, ptr: *mut u8, info: DebugInfo) -> bool {
        let freed = self.state.get_mut().deallocate(ptr);
        self.header.on_deallocate(instance_key(self), AllocatorKind::Multipool, ptr, freed, info, || {
            self.current_usage()
        })
    }

    unsafe fn deallocate_no_assert_ts(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        let freed = self.state.lock().deallocate(ptr);
        self.header.on_deallocate(instance_key(self), AllocatorKind::Multipool, ptr, freed, info, || {
            self.current_usage()
        })
    }

    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let new = self.state.get_mut().reallocate(ptr, new_size, alignment);
        self.finish_reallocate(ptr, new, new_size, alignment, info)
    }

    unsafe fn reallocate_ts(
        &self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let new = self.state.lock().reallocate(ptr, new_size, alignment);
        self.finish_reallocate(ptr, new, new_size, alignment, info)
    }

    fn clear(&mut self, info: DebugInfo) {
        self.state.get_mut().range.clear();
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::Multipool,
            TrackedOperation::Clear,
            info,
            || 0,
        );
    }

    fn belongs(&self, ptr: *const u8) -> bool {
        let state = self.state.lock();
        in_range(ptr, state.buffer, state.size)
    }

    fn current_usage(&self) -> usize {
        self.state.lock().usage()
    }

    fn is_empty(&self) -> bool {
        self.state.lock().range.is_empty()
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        let state = self.state.lock();
        vec![MemoryRegion::new(state.buffer, state.size)]
    }

    fn buffer(&self) -> *mut u8 {
        self.state.lock().buffer
    }
}

impl std::fmt::Debug for MultipoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MultipoolAllocator")
            .field("size", &state.size)
            .field("block_shift", &state.block_shift)
            .field("range", &state.range)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::layout::is_aligned;

    fn multipool(buffer: &mut [u8], pool_count: usize) -> MultipoolAllocator {
        unsafe { MultipoolAllocator::new(buffer.as_mut_ptr(), buffer.len(), pool_count) }
    }

    #[test]
    fn test_reverse_free_empties() {
        let mut buffer = vec![0u8; 64 * 1024];
        let mut pool = multipool(&mut buffer, 128);

        let ptrs: Vec<_> = (0..32)
            .map(|i| pool.allocate(16 + i * 8, 8, DebugInfo::none()))
            .collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        assert_eq!(pool.allocation_count(), 32);

        for ptr in ptrs.into_iter().rev() {
            unsafe { pool.deallocate(ptr, DebugInfo::none()) };
        }
        assert!(pool.is_empty());
        assert_eq!(pool.current_usage(), 0);
    }

    #[test]
    fn test_alignments() {
        let mut buffer = vec![0u8; 64 * 1024];
        let mut pool = multipool(&mut buffer, 64);

        for alignment in [1, 4, 8, 16, 64] {
            for size in [1, 7, 4096] {
                let ptr = pool.allocate(size, alignment, DebugInfo::none());
                assert!(!ptr.is_null());
                assert!(is_aligned(ptr as usize, alignment));
                let back_offset = unsafe { ptr.sub(1).read() } as usize;
                assert!(back_offset < CACHE_LINE_SIZE);
            }
        }
    }

    #[test]
    fn test_oversized_alignment_rejected() {
        let mut buffer = vec![0u8; 4096];
        let mut pool = multipool(&mut buffer, 16);
        pool.exit_crash_on_allocation_failure();
        assert!(pool.allocate(16, 128, DebugInfo::none()).is_null());
    }

    #[test]
    fn test_invalid_deallocation_rejected() {
        let mut buffer = vec![0u8; 4096];
        let mut pool = multipool(&mut buffer, 16);

        let ptr = pool.allocate(64, 8, DebugInfo::none());
        unsafe {
            // Interior pointer: the byte before it is payload, not a header.
            ptr.write_bytes(0xFF, 64);
            assert!(!pool.deallocate_no_assert(ptr.add(8), DebugInfo::none()));

            // Outside the buffer.
            let mut other = [0u8; 8];
            assert!(!pool.deallocate_no_assert(other.as_mut_ptr().add(1), DebugInfo::none()));

            assert!(pool.deallocate_no_assert(ptr, DebugInfo::none()));
            // Double free.
            assert!(!pool.deallocate_no_assert(ptr, DebugInfo::none()));
        }
    }

    #[test]
    #[should_panic(expected = "PA002")]
    fn test_asserting_deallocate_crashes() {
        crate::diagnostics::suppress_diagnostics(true);
        let mut buffer = vec![0u8; 4096];
        let mut pool = multipool(&mut buffer, 16);
        let ptr = pool.allocate(64, 8, DebugInfo::none());
        unsafe {
            pool.deallocate(ptr, DebugInfo::none());
            pool.deallocate(ptr, DebugInfo::none());
        }
    }

    #[test]
    fn test_reallocate_in_place() {
        let mut buffer = vec![0u8; 4096];
        let mut pool = multipool(&mut buffer, 16);

        let ptr = pool.allocate(64, 8, DebugInfo::none());
        let grown = unsafe { pool.reallocate(ptr, 512, 8, DebugInfo::none()) };
        assert_eq!(ptr, grown);

        let shrunk = unsafe { pool.reallocate(grown, 16, 8, DebugInfo::none()) };
        assert_eq!(ptr, shrunk);
        assert!(pool.current_usage() < 64 + 8 + 1);
    }

    #[test]
    fn test_reallocate_moves_when_blocked() {
        let mut buffer = vec![0u8; 4096];
        let mut pool = multipool(&mut buffer, 16);

        let a = pool.allocate(64, 8, DebugInfo::none());
        let b = pool.allocate(64, 8, DebugInfo::none());
        let moved = unsafe { pool.reallocate(a, 256, 8, DebugInfo::none()) };
        assert!(!moved.is_null());
        assert_ne!(moved, a);
        assert_eq!(pool.allocation_count(), 2);

        unsafe {
            pool.deallocate(b, DebugInfo::none());
            pool.deallocate(moved, DebugInfo::none());
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn test_capacity_boundary() {
        let size = 4096;
        let mut buffer = vec![0u8; size];
        let mut pool = multipool(&mut buffer, 16);
        pool.exit_crash_on_allocation_failure();

        assert_eq!(MultipoolAllocator::max_allocation_size(size), size);
        let ptr = pool.allocate(size - 1, 1, DebugInfo::none());
        assert!(!ptr.is_null());
        assert!(pool.allocate(1, 1, DebugInfo::none()).is_null());
    }
}
