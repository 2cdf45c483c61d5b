//! Chain of pools that grows from a backup allocator.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::api::base::{instance_key, unsupported, AllocatorBase, AllocatorHeader, MemoryRegion};
use crate::api::config::MemoryManagerConfig;
use crate::api::debug_info::DebugInfo;
use crate::api::kind::AllocatorKind;
use crate::api::polymorphic::{allocate_ex, deallocate_ex, AllocatorPolymorphic};
use crate::debug::TrackedOperation;
use crate::diagnostics::emit::emit_with_context;
use crate::diagnostics::kind::{PA101, PA102};
use crate::error::{AllocatorError, Result};
use crate::sync::SpinLock;
use crate::util::layout::CACHE_LINE_SIZE;
use crate::util::size::format_bytes;

use super::base::{BaseAllocator, CreateBaseAllocatorInfo};

/// Maximum number of pools a memory manager holds at once.
pub const MAX_MEMORY_MANAGER_POOLS: usize = 8;

/// A growable set of homogeneous pools.
///
/// Pool 0 is built from the initial description and lives as long as the
/// manager. When every pool rejects a request a new pool is built from the
/// growth description with memory from `backup`, unless the request could
/// never fit in such a pool or all [`MAX_MEMORY_MANAGER_POOLS`] slots are
/// taken. Requests are never escalated further.
///
/// The single-threaded deallocation path retires growth pools as soon as
/// they become empty. The thread-safe path only ever adds pools, since
/// removing one would race with concurrent readers of the pool array;
/// call [`trim`](Self::trim) from a single-threaded point instead.
pub struct MemoryManager {
    header: AllocatorHeader,
    pools: [UnsafeCell<MaybeUninit<BaseAllocator>>; MAX_MEMORY_MANAGER_POOLS],
    /// Slots below this index are initialized. Published with `Release`
    /// after the slot is written.
    pool_count: AtomicUsize,
    growth_lock: SpinLock,
    backup: AllocatorPolymorphic,
    initial_info: CreateBaseAllocatorInfo,
    growth_info: CreateBaseAllocatorInfo,
}

// SAFETY: pools are reached through `&self` only via their own thread-safe
// entry points; slots are written either through `&mut self` or by the
// holder of `growth_lock` before the slot is published.
unsafe impl Send for MemoryManager {}
unsafe impl Sync for MemoryManager {}

impl MemoryManager {
    /// Create a manager with its first pool taken from `backup`.
    ///
    /// `backup` must outlive the manager.
    pub fn new(backup: AllocatorPolymorphic, config: MemoryManagerConfig) -> Result<Self> {
        config.initial.validate()?;
        config.growth.validate()?;

        let mut manager = Self {
            header: AllocatorHeader::new(),
            pools: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            pool_count: AtomicUsize::new(0),
            growth_lock: SpinLock::new(),
            backup,
            initial_info: config.initial,
            growth_info: config.growth,
        };

        // SAFETY: exclusive access, slot 0 is empty.
        if !unsafe { manager.create_pool(0, &manager.initial_info) } {
            return Err(AllocatorError::BackupExhausted {
                size: manager.initial_info.buffer_size(),
            });
        }
        *manager.pool_count.get_mut() = 1;
        Ok(manager)
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.pool_count.load(Ordering::Acquire)
    }

    /// The backup allocator pools are taken from.
    pub fn backup(&self) -> AllocatorPolymorphic {
        self.backup
    }

    /// The pool at `index`, if live.
    pub fn pool(&self, index: usize) -> Option<&BaseAllocator> {
        (index < self.pool_count()).then(|| self.pool_ref(index))
    }

    /// Deallocate `ptr` if it belongs to one of the pools. Retires the
    /// owning pool if it becomes empty.
    ///
    /// # Safety
    ///
    /// If `ptr` belongs to the manager it must be a live allocation of it.
    #[track_caller]
    pub unsafe fn deallocate_if_belongs(&mut self, ptr: *mut u8, info: DebugInfo) -> bool {
        if ptr.is_null() || !self.belongs(ptr) {
            return false;
        }
        self.deallocate(ptr, info);
        true
    }

    /// Retire every empty growth pool, returning its memory to `backup`.
    ///
    /// Returns how many pools were retired.
    pub fn trim(&mut self) -> usize {
        let mut retired = 0;
        let mut index = *self.pool_count.get_mut();
        while index > 1 {
            index -= 1;
            if self.pool_ref(index).is_empty() {
                self.retire(index);
                retired += 1;
            }
        }
        retired
    }

    #[inline]
    fn pool_ref(&self, index: usize) -> &BaseAllocator {
        // SAFETY: callers only pass indices below the published count.
        unsafe { (*self.pools[index].get()).assume_init_ref() }
    }

    #[inline]
    fn pool_mut(&mut self, index: usize) -> &mut BaseAllocator {
        // SAFETY: as above, with exclusive access.
        unsafe { self.pools[index].get_mut().assume_init_mut() }
    }

    fn owner(&self, ptr: *const u8) -> Option<usize> {
        (0..self.pool_count()).find(|&index| self.pool_ref(index).belongs(ptr))
    }

    /// Build a pool in slot `index`.
    ///
    /// # Safety
    ///
    /// Slot `index` must be unpublished and the caller must either have
    /// exclusive access or hold `growth_lock`.
    unsafe fn create_pool(&self, index: usize, info: &CreateBaseAllocatorInfo) -> bool {
        let size = info.buffer_size();
        let buffer = allocate_ex(self.backup, size, CACHE_LINE_SIZE, DebugInfo::none());
        if buffer.is_null() {
            return false;
        }

        match BaseAllocator::create_in(buffer, info) {
            Ok(pool) => {
                (*self.pools[index].get()).write(pool);
                log::debug!(
                    "memory manager {:#x}: created pool {} ({})",
                    instance_key(self),
                    index,
                    format_bytes(size)
                );
                true
            }
            Err(err) => {
                log::warn!("memory manager {:#x}: pool creation failed: {}", instance_key(self), err);
                deallocate_ex(self.backup, buffer, DebugInfo::none());
                false
            }
        }
    }

    fn destroy_pool(&self, pool: BaseAllocator) {
        let buffer = pool.buffer();
        drop(pool);
        if !buffer.is_null() {
            // SAFETY: every pool buffer came from `backup` in `create_pool`.
            unsafe { deallocate_ex(self.backup, buffer, DebugInfo::none()) };
        }
    }

    /// Swap-remove the pool at `index` and return its memory.
    fn retire(&mut self, index: usize) {
        let last = *self.pool_count.get_mut() - 1;
        debug_assert!(index > 0 && index <= last);

        // SAFETY: both slots are initialized; after the reads `last` is
        // treated as empty and `index` is rewritten when it differs.
        let pool = unsafe { self.pools[index].get_mut().assume_init_read() };
        if index != last {
            let moved = unsafe { self.pools[last].get_mut().assume_init_read() };
            self.pools[index].get_mut().write(moved);
        }
        *self.pool_count.get_mut() = last;

        self.destroy_pool(pool);
        log::debug!(
            "memory manager {:#x}: retired pool {} ({} left)",
            instance_key(self),
            index,
            last
        );
    }

    fn release_all(&mut self) {
        let count = *self.pool_count.get_mut();
        *self.pool_count.get_mut() = 0;
        for index in (0..count).rev() {
            // SAFETY: slots below the old count are initialized and the
            // count is already zero.
            let pool = unsafe { self.pools[index].get_mut().assume_init_read() };
            self.destroy_pool(pool);
        }
    }

    fn can_grow(&self, size: usize, alignment: usize, count: usize) -> bool {
        if size.saturating_add(alignment) > self.growth_info.max_allocation_size() {
            emit_with_context(&PA102, &format!("{} bytes, alignment {}", size, alignment));
            return false;
        }
        if count >= MAX_MEMORY_MANAGER_POOLS {
            emit_with_context(&PA101, &format!("{} pools live", count));
            return false;
        }
        true
    }

    fn allocate_exclusive(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let count = *self.pool_count.get_mut();
        if count == 0 {
            unsupported(AllocatorKind::Manager, "allocating after free", info);
        }
        for index in 0..count {
            let ptr = self.pool_mut(index).allocate(size, alignment, info);
            if !ptr.is_null() {
                return ptr;
            }
        }

        if !self.can_grow(size, alignment, count) {
            return std::ptr::null_mut();
        }
        // SAFETY: exclusive access; slot `count` is unpublished.
        if !unsafe { self.create_pool(count, &self.growth_info) } {
            return std::ptr::null_mut();
        }
        *self.pool_count.get_mut() = count + 1;
        self.pool_mut(count).allocate(size, alignment, info)
    }

    fn allocate_shared(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        // Each pass either finds room, creates a pool, or waits for another
        // thread's pool; there are at most MAX_MEMORY_MANAGER_POOLS of those.
        for _ in 0..=MAX_MEMORY_MANAGER_POOLS {
            let count = self.pool_count.load(Ordering::Acquire);
            if count == 0 {
                unsupported(AllocatorKind::Manager, "allocating after free", info);
            }
            for index in 0..count {
                let ptr = self.pool_ref(index).allocate_ts(size, alignment, info);
                if !ptr.is_null() {
                    return ptr;
                }
            }

            if !self.can_grow(size, alignment, count) {
                return std::ptr::null_mut();
            }

            match self.growth_lock.try_lock() {
                Some(_guard) => {
                    if self.pool_count.load(Ordering::Acquire) != count {
                        // Someone grew while we were scanning.
                        continue;
                    }
                    // SAFETY: growth lock held; slot `count` is unpublished.
                    if !unsafe { self.create_pool(count, &self.growth_info) } {
                        return std::ptr::null_mut();
                    }
                    self.pool_count.store(count + 1, Ordering::Release);
                    return self.pool_ref(count).allocate_ts(size, alignment, info);
                }
                None => self.growth_lock.wait_locked(),
            }
        }
        std::ptr::null_mut()
    }

    unsafe fn deallocate_exclusive(&mut self, ptr: *mut u8, info: DebugInfo) -> bool {
        let Some(index) = self.owner(ptr) else {
            return false;
        };
        if !self.pool_mut(index).deallocate_no_assert(ptr, info) {
            return false;
        }
        if index > 0 && self.pool_ref(index).is_empty() {
            self.retire(index);
        }
        true
    }

    unsafe fn deallocate_shared(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        match self.owner(ptr) {
            Some(index) => self.pool_ref(index).deallocate_no_assert_ts(ptr, info),
            None => false,
        }
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
            AllocatorKind::Manager,
            old,
            new,
            size,
            alignment,
            info,
            || self.current_usage(),
        )
    }
}

impl AllocatorBase for MemoryManager {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Manager
    }

    fn header(&self) -> &AllocatorHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut AllocatorHeader {
        &mut self.header
    }

    fn allocate(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.allocate_exclusive(size, alignment, info);
        self.header.on_allocate(instance_key(self), AllocatorKind::Manager, ptr, size, alignment, info, || {
            self.current_usage()
        })
    }

    fn allocate_ts(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.allocate_shared(size, alignment, info);
        self.header.on_allocate(instance_key(self), AllocatorKind::Manager, ptr, size, alignment, info, || {
            self.current_usage()
        })
    }

    unsafe fn deallocate_no_assert(&mut self, ptr: *mut u8, info: DebugInfo) -> bool {
        let freed = self.deallocate_exclusive(ptr, info);
        self.header.on_deallocate(instance_key(self), AllocatorKind::Manager, ptr, freed, info, || {
            self.current_usage()
        })
    }

    unsafe fn deallocate_no_assert_ts(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        let freed = self.deallocate_shared(ptr, info);
        self.header.on_deallocate(instance_key(self), AllocatorKind::Manager, ptr, freed, info, || {
            self.current_usage()
        })
    }

    /// Resizes within the owning pool when possible, otherwise allocates
    /// through the general path and releases the old block. The payload is
    /// not copied.
    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let mut new = std::ptr::null_mut();
        if let Some(index) = self.owner(ptr) {
            new = self.pool_mut(index).reallocate(ptr, new_size, alignment, info);
            if new.is_null() {
                new = self.allocate_exclusive(new_size, alignment, info);
                if !new.is_null() {
                    self.deallocate_exclusive(ptr, info);
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
        if let Some(index) = self.owner(ptr) {
            new = self.pool_ref(index).reallocate_ts(ptr, new_size, alignment, info);
            if new.is_null() {
                new = self.allocate_shared(new_size, alignment, info);
                if !new.is_null() {
                    self.deallocate_shared(ptr, info);
                }
            }
        }
        self.finish_reallocate(ptr, new, new_size, alignment, info)
    }

    fn clear(&mut self, info: DebugInfo) {
        let count = *self.pool_count.get_mut();
        for index in 0..count {
            self.pool_mut(index).clear(info);
        }
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::Manager,
            TrackedOperation::Clear,
            info,
            || 0,
        );
    }

    /// Returns every pool, including pool 0, to the backup allocator.
    /// Allocating afterwards is a programming error and crashes.
    fn free(&mut self, info: DebugInfo) {
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::Manager,
            TrackedOperation::Free,
            info,
            || 0,
        );
        self.release_all();
    }

    fn belongs(&self, ptr: *const u8) -> bool {
        self.owner(ptr).is_some()
    }

    fn current_usage(&self) -> usize {
        (0..self.pool_count())
            .map(|index| self.pool_ref(index).current_usage())
            .sum()
    }

    fn is_empty(&self) -> bool {
        (0..self.pool_count()).all(|index| self.pool_ref(index).is_empty())
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        (0..self.pool_count())
            .flat_map(|index| self.pool_ref(index).regions())
            .collect()
    }

    fn buffer(&self) -> *mut u8 {
        self.pool(0)
            .map_or(std::ptr::null_mut(), |pool| pool.buffer())
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("pool_count", &self.pool_count())
            .field("initial", &self.initial_info)
            .field("growth", &self.growth_info)
            .finish()
    }
}
