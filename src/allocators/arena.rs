//! Round-robin arena of homogeneous sub-allocators.

use crate::api::base::{instance_key, unsupported, AllocatorBase, AllocatorHeader, MemoryRegion};
use crate::api::debug_info::DebugInfo;
use crate::api::kind::AllocatorKind;
use crate::api::polymorphic::{allocate_ex, deallocate_ex, AllocatorPolymorphic};
use crate::debug::TrackedOperation;
use crate::error::{AllocatorError, Result};
use crate::sync::SpinMutex;
use crate::util::layout::{in_range, CACHE_LINE_SIZE};
use crate::util::size::format_bytes;

use super::base::{BaseAllocator, CreateBaseAllocatorInfo};

/// `allocator_count` identical base allocators over one contiguous buffer.
///
/// Each allocation starts at the next sub-allocator in turn and probes
/// the others, wrapping, until one succeeds. This spreads thread-safe
/// callers over different sub-allocator locks. Ownership is a single range
/// check and the owning sub-allocator is found by dividing the offset.
pub struct MemoryArena {
    header: AllocatorHeader,
    allocators: Box<[BaseAllocator]>,
    data_buffer: *mut u8,
    size_per_allocator: usize,
    current_index: SpinMutex<usize>,
    backup: Option<AllocatorPolymorphic>,
}

// SAFETY: `data_buffer` is only dereferenced through the sub-allocators,
// which synchronize themselves; `current_index` is behind a spinlock.
unsafe impl Send for MemoryArena {}
unsafe impl Sync for MemoryArena {}

impl MemoryArena {
    /// Create an arena whose buffer is taken from `backup`.
    ///
    /// The buffer is returned to `backup` by [`free`](AllocatorBase::free)
    /// or on drop, so `backup` must outlive the arena.
    pub fn new(
        backup: AllocatorPolymorphic,
        allocator_count: usize,
        base: &CreateBaseAllocatorInfo,
    ) -> Result<Self> {
        Self::validate(allocator_count, base)?;
        let size = allocator_count * base.buffer_size();
        let buffer = allocate_ex(backup, size, CACHE_LINE_SIZE, DebugInfo::none());
        if buffer.is_null() {
            return Err(AllocatorError::BackupExhausted { size });
        }

        // SAFETY: the buffer was just allocated with the required size.
        match unsafe { Self::from_buffer(buffer, allocator_count, base) } {
            Ok(mut arena) => {
                arena.backup = Some(backup);
                log::debug!(
                    "memory arena: {} x {} allocators over {}",
                    allocator_count,
                    base.kind(),
                    format_bytes(size)
                );
                Ok(arena)
            }
            Err(err) => {
                // SAFETY: allocated above and not handed out.
                unsafe { deallocate_ex(backup, buffer, DebugInfo::none()) };
                Err(err)
            }
        }
    }

    /// Create an arena over a caller-provided buffer of
    /// `allocator_count * base.buffer_size()` bytes.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for that many bytes for the arena's whole
    /// lifetime and not be used by anything else.
    pub unsafe fn from_buffer(
        buffer: *mut u8,
        allocator_count: usize,
        base: &CreateBaseAllocatorInfo,
    ) -> Result<Self> {
        Self::validate(allocator_count, base)?;
        let size_per_allocator = base.buffer_size();
        let allocators = (0..allocator_count)
            .map(|index| BaseAllocator::create_in(buffer.add(index * size_per_allocator), base))
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();

        Ok(Self {
            header: AllocatorHeader::new(),
            allocators,
            data_buffer: buffer,
            size_per_allocator,
            current_index: SpinMutex::new(0),
            backup: None,
        })
    }

    fn validate(allocator_count: usize, base: &CreateBaseAllocatorInfo) -> Result<()> {
        if allocator_count == 0 {
            return Err(AllocatorError::InvalidConfig("allocator_count must be non-zero"));
        }
        base.validate()
    }

    /// Number of sub-allocators.
    pub fn allocator_count(&self) -> usize {
        self.allocators.len()
    }

    /// Bytes of buffer per sub-allocator.
    pub fn size_per_allocator(&self) -> usize {
        self.size_per_allocator
    }

    /// The sub-allocator at `index`.
    pub fn allocator(&self, index: usize) -> Option<&BaseAllocator> {
        self.allocators.get(index)
    }

    /// Index of the sub-allocator the next allocation starts at.
    pub fn current_index(&self) -> usize {
        *self.current_index.lock()
    }

    /// Index of the sub-allocator whose slice contains `ptr`.
    pub fn owner_index(&self, ptr: *const u8) -> Option<usize> {
        if !self.belongs(ptr) {
            return None;
        }
        Some((ptr as usize - self.data_buffer as usize) / self.size_per_allocator)
    }

    #[inline]
    fn advance(index: &mut usize, count: usize) -> usize {
        let start = *index;
        *index = (start + 1) % count;
        start
    }

    fn probe(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let count = self.allocators.len();
        if count == 0 {
            return std::ptr::null_mut();
        }
        let start = Self::advance(self.current_index.get_mut(), count);
        for offset in 0..count {
            let ptr = self.allocators[(start + offset) % count].allocate(size, alignment, info);
            if !ptr.is_null() {
                return ptr;
            }
        }
        std::ptr::null_mut()
    }

    fn probe_ts(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let count = self.allocators.len();
        if count == 0 {
            return std::ptr::null_mut();
        }
        let start = Self::advance(&mut self.current_index.lock(), count);
        for offset in 0..count {
            let ptr = self.allocators[(start + offset) % count].allocate_ts(size, alignment, info);
            if !ptr.is_null() {
                return ptr;
            }
        }
        std::ptr::null_mut()
    }

    fn release_buffer(&mut self, backup: AllocatorPolymorphic) {
        self.allocators = Vec::new().into_boxed_slice();
        if !self.data_buffer.is_null() {
            // SAFETY: the buffer came from `backup` in `new`.
            unsafe { deallocate_ex(backup, self.data_buffer, DebugInfo::none()) };
            log::debug!("memory arena: released buffer {:p}", self.data_buffer);
        }
        self.data_buffer = std::ptr::null_mut();
        self.size_per_allocator = 0;
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
            AllocatorKind::Arena,
            old,
            new,
            size,
            alignment,
            info,
            || self.current_usage(),
        )
    }
}

impl AllocatorBase for MemoryArena {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Arena
    }

    fn header(&self) -> &AllocatorHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut AllocatorHeader {
        &mut self.header
    }

    fn allocate(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.probe(size, alignment, info);
        self.header.on_allocate(instance_key(self), AllocatorKind::Arena, ptr, size, alignment, info, || {
            self.current_usage()
        })
    }

    fn allocate_ts(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.probe_ts(size, alignment, info);
        self.header.on_allocate(instance_key(self), AllocatorKind::Arena, ptr, size, alignment, info, || {
            self.current_usage()
        })
    }

    unsafe fn deallocate_no_assert(&mut self, ptr: *mut u8, info: DebugInfo) -> bool {
        let freed = match self.owner_index(ptr) {
            Some(index) => self.allocators[index].deallocate_no_assert(ptr, info),
            None => false,
        };
        self.header.on_deallocate(instance_key(self), AllocatorKind::Arena, ptr, freed, info, || {
            self.current_usage()
        })
    }

    unsafe fn deallocate_no_assert_ts(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        let freed = match self.owner_index(ptr) {
            Some(index) => self.allocators[index].deallocate_no_assert_ts(ptr, info),
            None => false,
        };
        self.header.on_deallocate(instance_key(self), AllocatorKind::Arena, ptr, freed, info, || {
            self.current_usage()
        })
    }

    /// Delegates to the owning sub-allocator, then falls back to a new
    /// block anywhere in the arena. The payload is not copied.
    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let mut new = std::ptr::null_mut();
        if let Some(index) = self.owner_index(ptr) {
            new = self.allocators[index].reallocate(ptr, new_size, alignment, info);
            if new.is_null() {
                new = self.probe(new_size, alignment, info);
                if !new.is_null() {
                    self.allocators[index].deallocate_no_assert(ptr, info);
                }
            }
        }
        self.finish_reallocate(ptr, new, new_size, alignment, info)
    }

    unsafe fn reallocate_ts(
        &self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let mut new = std::ptr::null_mut();
        if let Some(index) = self.owner_index(ptr) {
            new = self.allocators[index].reallocate_ts(ptr, new_size, alignment, info);
            if new.is_null() {
                new = self.probe_ts(new_size, alignment, info);
                if !new.is_null() {
                    self.allocators[index].deallocate_no_assert_ts(ptr, info);
                }
            }
        }
        self.finish_reallocate(ptr, new, new_size, alignment, info)
    }

    fn clear(&mut self, info: DebugInfo) {
        for allocator in self.allocators.iter_mut() {
            allocator.clear(info);
        }
        *self.current_index.get_mut() = 0;
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::Arena,
            TrackedOperation::Clear,
            info,
            || 0,
        );
    }

    /// Returns the buffer to the backup allocator it came from. Arenas over
    /// a caller-provided buffer cannot be freed.
    fn free(&mut self, info: DebugInfo) {
        let Some(backup) = self.backup.take() else {
            unsupported(AllocatorKind::Arena, "free without a backup allocator", info);
        };
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::Arena,
            TrackedOperation::Free,
            info,
            || 0,
        );
        self.release_buffer(backup);
    }

    fn belongs(&self, ptr: *const u8) -> bool {
        in_range(
            ptr,
            self.data_buffer,
            self.size_per_allocator * self.allocators.len(),
        )
    }

    fn current_usage(&self) -> usize {
        self.allocators.iter().map(|allocator| allocator.current_usage()).sum()
    }

    fn is_empty(&self) -> bool {
        self.allocators.iter().all(|allocator| allocator.is_empty())
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        self.allocators
            .iter()
            .flat_map(|allocator| allocator.regions())
            .collect()
    }

    fn buffer(&self) -> *mut u8 {
        self.data_buffer
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            self.release_buffer(backup);
        }
    }
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("allocator_count", &self.allocators.len())
            .field("size_per_allocator", &self.size_per_allocator)
            .field("owns_buffer", &self.backup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::size::kb;

    fn arena(count: usize, base: CreateBaseAllocatorInfo) -> MemoryArena {
        MemoryArena::new(AllocatorPolymorphic::malloc(), count, &base).unwrap()
    }

    #[test]
    fn test_round_robin() {
        let mut arena = arena(4, CreateBaseAllocatorInfo::multipool(kb(4), 16));

        let owners: Vec<_> = (0..8)
            .map(|_| {
                let ptr = arena.allocate(32, 8, DebugInfo::none());
                arena.owner_index(ptr).unwrap()
            })
            .collect();
        assert_eq!(owners, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_probe_wraps_when_full() {
        let mut arena = arena(2, CreateBaseAllocatorInfo::stack(kb(1)));
        arena.exit_crash_on_allocation_failure();

        // One large request fills each sub-allocator; a third fits nowhere
        // but a small one still finds room after wrapping.
        let a = arena.allocate(900, 8, DebugInfo::none());
        let b = arena.allocate(900, 8, DebugInfo::none());
        assert_eq!(arena.owner_index(a), Some(0));
        assert_eq!(arena.owner_index(b), Some(1));
        assert!(arena.allocate(900, 8, DebugInfo::none()).is_null());
        assert!(!arena.allocate(64, 8, DebugInfo::none()).is_null());
    }

    #[test]
    fn test_deallocate_routes_to_owner() {
        let mut arena = arena(4, CreateBaseAllocatorInfo::multipool(kb(4), 16));
        let ptrs: Vec<_> = (0..4).map(|_| arena.allocate(100, 16, DebugInfo::none())).collect();
        assert!(arena.current_usage() > 0);

        for ptr in ptrs {
            assert!(arena.belongs(ptr));
            unsafe { arena.deallocate(ptr, DebugInfo::none()) };
        }
        assert!(arena.is_empty());
        assert_eq!(arena.current_usage(), 0);
    }

    /// Two 4 KB multipools: a 2 KB block in pool 0 boxed in by a small one,
    /// and a small block in pool 1.
    fn crowded_arena() -> (MemoryArena, *mut u8, Vec<*mut u8>) {
        let arena = arena(2, CreateBaseAllocatorInfo::multipool(kb(4), 16));
        let a = arena.allocate_ts(2000, 8, DebugInfo::none());
        let b = arena.allocate_ts(64, 8, DebugInfo::none());
        let c = arena.allocate_ts(64, 8, DebugInfo::none());
        assert_eq!(arena.owner_index(a), Some(0));
        assert_eq!(arena.owner_index(b), Some(1));
        assert_eq!(arena.owner_index(c), Some(0));
        (arena, a, vec![b, c])
    }

    #[test]
    fn test_reallocate_moves_to_other_allocator() {
        let (mut arena, a, rest) = crowded_arena();
        let owner_usage = arena.allocator(0).unwrap().current_usage();
        let total = arena.current_usage();

        let moved = unsafe { arena.reallocate(a, 3000, 8, DebugInfo::none()) };
        assert!(!moved.is_null());
        assert_eq!(arena.owner_index(moved), Some(1));
        assert!(arena.allocator(0).unwrap().current_usage() < owner_usage);
        assert!(arena.current_usage() > total);

        unsafe {
            arena.deallocate(moved, DebugInfo::none());
            for ptr in rest {
                arena.deallocate(ptr, DebugInfo::none());
            }
        }
        assert!(arena.is_empty());
    }

    #[test]
    fn test_reallocate_ts_moves_to_other_allocator() {
        let (arena, a, rest) = crowded_arena();
        let owner_usage = arena.allocator(0).unwrap().current_usage();

        let moved = unsafe { arena.reallocate_ts(a, 3000, 8, DebugInfo::none()) };
        assert!(!moved.is_null());
        assert_eq!(arena.owner_index(moved), Some(1));
        assert!(arena.allocator(0).unwrap().current_usage() < owner_usage);

        unsafe {
            arena.deallocate_ts(moved, DebugInfo::none());
            for ptr in rest {
                arena.deallocate_ts(ptr, DebugInfo::none());
            }
        }
        assert!(arena.is_empty());
    }

    #[test]
    fn test_reallocate_in_place_keeps_owner() {
        let mut arena = arena(2, CreateBaseAllocatorInfo::multipool(kb(4), 16));
        let a = arena.allocate(256, 8, DebugInfo::none());
        let grown = unsafe { arena.reallocate(a, 512, 8, DebugInfo::none()) };
        assert_eq!(arena.owner_index(grown), Some(0));
        unsafe { arena.deallocate(grown, DebugInfo::none()) };
        assert!(arena.is_empty());
    }

    #[test]
    fn test_belongs_range() {
        let arena = arena(2, CreateBaseAllocatorInfo::stack(kb(1)));
        let start = arena.buffer();
        assert!(arena.belongs(start));
        assert!(arena.belongs(unsafe { start.add(kb(2) - 1) }));
        assert!(!arena.belongs(unsafe { start.add(kb(2)) }));
        assert_eq!(arena.regions().len(), 2);
    }

    #[test]
    fn test_nested_arena() {
        let inner = CreateBaseAllocatorInfo::arena(2, CreateBaseAllocatorInfo::multipool(kb(2), 8));
        let mut arena = arena(2, inner);
        assert_eq!(arena.size_per_allocator(), kb(4));

        let ptrs: Vec<_> = (0..8).map(|_| arena.allocate(64, 8, DebugInfo::none())).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        for ptr in ptrs {
            unsafe { arena.deallocate(ptr, DebugInfo::none()) };
        }
        assert!(arena.is_empty());
    }

    #[test]
    fn test_clear_and_free() {
        let mut arena = arena(2, CreateBaseAllocatorInfo::multipool(kb(4), 16));
        arena.allocate(128, 8, DebugInfo::none());
        arena.allocate(128, 8, DebugInfo::none());
        arena.clear(DebugInfo::none());
        assert!(arena.is_empty());
        assert_eq!(arena.current_index(), 0);

        arena.free(DebugInfo::none());
        assert!(arena.buffer().is_null());
        assert_eq!(arena.allocator_count(), 0);
    }

    #[test]
    fn test_zero_allocators_rejected() {
        let result = MemoryArena::new(
            AllocatorPolymorphic::malloc(),
            0,
            &CreateBaseAllocatorInfo::minimal(),
        );
        assert!(matches!(result, Err(AllocatorError::InvalidConfig(_))));
    }
}
