//! The homogeneous sub-allocator type used by arenas and memory managers.

use crate::api::base::{AllocatorBase, AllocatorHeader, MemoryRegion};
use crate::api::debug_info::DebugInfo;
use crate::api::kind::{AllocatorKind, ConcurrencyMode};
use crate::api::polymorphic::AllocatorPolymorphic;
use crate::error::{AllocatorError, Result};
use crate::util::size::{kb, mb};

use super::arena::MemoryArena;
use super::multipool::MultipoolAllocator;
use super::stack::StackAllocator;

/// Describes a base allocator to be created over a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateBaseAllocatorInfo {
    /// A [`StackAllocator`] of `size` bytes.
    Stack {
        /// Buffer size.
        size: usize,
    },
    /// A [`MultipoolAllocator`] of `size` bytes with at most `pool_count`
    /// live allocations.
    Multipool {
        /// Buffer size.
        size: usize,
        /// Maximum number of live allocations.
        pool_count: usize,
    },
    /// A [`MemoryArena`] of `allocator_count` sub-allocators described by
    /// `base`.
    Arena {
        /// Number of sub-allocators.
        allocator_count: usize,
        /// Description of each sub-allocator.
        base: Box<CreateBaseAllocatorInfo>,
    },
}

impl CreateBaseAllocatorInfo {
    /// A stack allocator.
    pub const fn stack(size: usize) -> Self {
        Self::Stack { size }
    }

    /// A multipool allocator.
    pub const fn multipool(size: usize, pool_count: usize) -> Self {
        Self::Multipool { size, pool_count }
    }

    /// An arena of `allocator_count` copies of `base`.
    pub fn arena(allocator_count: usize, base: CreateBaseAllocatorInfo) -> Self {
        Self::Arena {
            allocator_count,
            base: Box::new(base),
        }
    }

    /// Small multipool for tests or constrained environments.
    pub fn minimal() -> Self {
        Self::multipool(kb(64), 128)
    }

    /// The kind of the allocator this describes.
    pub fn kind(&self) -> AllocatorKind {
        match self {
            Self::Stack { .. } => AllocatorKind::Stack,
            Self::Multipool { .. } => AllocatorKind::Multipool,
            Self::Arena { .. } => AllocatorKind::Arena,
        }
    }

    /// Bytes of backing buffer the allocator needs.
    pub fn buffer_size(&self) -> usize {
        match self {
            Self::Stack { size } | Self::Multipool { size, .. } => *size,
            Self::Arena {
                allocator_count,
                base,
            } => allocator_count * base.buffer_size(),
        }
    }

    /// Largest `size + alignment` a freshly created allocator is guaranteed
    /// to satisfy.
    pub fn max_allocation_size(&self) -> usize {
        match self {
            Self::Stack { size } => *size,
            Self::Multipool { size, .. } => MultipoolAllocator::max_allocation_size(*size),
            Self::Arena { base, .. } => base.max_allocation_size(),
        }
    }

    /// Check that the description can be built.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Stack { size } | Self::Multipool { size, .. } if *size == 0 => {
                Err(AllocatorError::InvalidConfig("allocator size must be non-zero"))
            }
            Self::Multipool { pool_count: 0, .. } => {
                Err(AllocatorError::InvalidConfig("pool_count must be non-zero"))
            }
            Self::Arena {
                allocator_count: 0, ..
            } => Err(AllocatorError::InvalidConfig("allocator_count must be non-zero")),
            Self::Arena { base, .. } => base.validate(),
            _ => Ok(()),
        }
    }
}

impl Default for CreateBaseAllocatorInfo {
    /// A 1 MB multipool with room for 1024 live allocations.
    fn default() -> Self {
        Self::multipool(mb(1), 1024)
    }
}

/// One of the allocator kinds that can live inside a composite.
///
/// Created over a slice of the composite's buffer with crashing disabled,
/// so a full sub-allocator reports null and the composite moves on.
#[derive(Debug)]
pub enum BaseAllocator {
    /// Stack allocator.
    Stack(StackAllocator),
    /// Multipool allocator.
    Multipool(MultipoolAllocator),
    /// Nested arena.
    Arena(MemoryArena),
}

macro_rules! delegate {
    ($self:expr, $allocator:ident => $body:expr) => {
        match $self {
            BaseAllocator::Stack($allocator) => $body,
            BaseAllocator::Multipool($allocator) => $body,
            BaseAllocator::Arena($allocator) => $body,
        }
    };
}

impl BaseAllocator {
    /// Build the allocator described by `info` over `buffer`.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `info.buffer_size()` bytes for the
    /// allocator's whole lifetime and not be used by anything else.
    pub unsafe fn create_in(buffer: *mut u8, info: &CreateBaseAllocatorInfo) -> Result<Self> {
        info.validate()?;
        if buffer.is_null() {
            return Err(AllocatorError::BackupExhausted {
                size: info.buffer_size(),
            });
        }

        Ok(match info {
            CreateBaseAllocatorInfo::Stack { size } => {
                Self::Stack(StackAllocator::with_header(buffer, *size, AllocatorHeader::nested()))
            }
            CreateBaseAllocatorInfo::Multipool { size, pool_count } => Self::Multipool(
                MultipoolAllocator::with_header(buffer, *size, *pool_count, AllocatorHeader::nested()),
            ),
            CreateBaseAllocatorInfo::Arena {
                allocator_count,
                base,
            } => {
                let mut arena = MemoryArena::from_buffer(buffer, *allocator_count, base)?;
                arena.exit_crash_on_allocation_failure();
                Self::Arena(arena)
            }
        })
    }

    /// Type-erased handle to the wrapped allocator.
    ///
    /// The handle points at the variant's payload, so its tag and instance
    /// agree whatever the enum layout.
    ///
    /// # Safety
    ///
    /// Same as [`AllocatorBase::polymorphic`].
    pub unsafe fn polymorphic(&mut self, mode: ConcurrencyMode) -> AllocatorPolymorphic {
        delegate!(self, allocator => allocator.polymorphic(mode))
    }
}

impl AllocatorBase for BaseAllocator {
    fn kind(&self) -> AllocatorKind {
        delegate!(self, allocator => allocator.kind())
    }

    fn header(&self) -> &AllocatorHeader {
        delegate!(self, allocator => allocator.header())
    }

    fn header_mut(&mut self) -> &mut AllocatorHeader {
        delegate!(self, allocator => allocator.header_mut())
    }

    #[inline]
    fn allocate(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        delegate!(self, allocator => allocator.allocate(size, alignment, info))
    }

    #[inline]
    fn allocate_ts(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        delegate!(self, allocator => allocator.allocate_ts(size, alignment, info))
    }

    #[inline]
    unsafe fn deallocate_no_assert(&mut self, ptr: *mut u8, info: DebugInfo) -> bool {
        delegate!(self, allocator => allocator.deallocate_no_assert(ptr, info))
    }

    #[inline]
    unsafe fn deallocate_no_assert_ts(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        delegate!(self, allocator => allocator.deallocate_no_assert_ts(ptr, info))
    }

    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        delegate!(self, allocator => allocator.reallocate(ptr, new_size, alignment, info))
    }

    unsafe fn reallocate_ts(
        &self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        delegate!(self, allocator => allocator.reallocate_ts(ptr, new_size, alignment, info))
    }

    fn clear(&mut self, info: DebugInfo) {
        delegate!(self, allocator => allocator.clear(info))
    }

    fn free(&mut self, info: DebugInfo) {
        delegate!(self, allocator => allocator.free(info))
    }

    fn belongs(&self, ptr: *const u8) -> bool {
        delegate!(self, allocator => allocator.belongs(ptr))
    }

    fn current_usage(&self) -> usize {
        delegate!(self, allocator => allocator.current_usage())
    }

    fn is_empty(&self) -> bool {
        delegate!(self, allocator => allocator.is_empty())
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        delegate!(self, allocator => allocator.regions())
    }

    fn buffer(&self) -> *mut u8 {
        delegate!(self, allocator => allocator.buffer())
    }

    fn set_debug_mode(&mut self, enabled: bool, resizable: bool) {
        delegate!(self, allocator => allocator.set_debug_mode(enabled, resizable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_sizes() {
        let info = CreateBaseAllocatorInfo::arena(4, CreateBaseAllocatorInfo::stack(kb(4)));
        assert_eq!(info.buffer_size(), kb(16));
        assert_eq!(info.max_allocation_size(), kb(4));
        assert_eq!(info.kind(), AllocatorKind::Arena);

        let nested = CreateBaseAllocatorInfo::arena(2, info.clone());
        assert_eq!(nested.buffer_size(), kb(32));
    }

    #[test]
    fn test_validate() {
        assert!(CreateBaseAllocatorInfo::stack(0).validate().is_err());
        assert!(CreateBaseAllocatorInfo::multipool(kb(1), 0).validate().is_err());
        assert!(CreateBaseAllocatorInfo::arena(0, CreateBaseAllocatorInfo::minimal())
            .validate()
            .is_err());
        assert!(CreateBaseAllocatorInfo::default().validate().is_ok());
    }

    #[test]
    fn test_create_in_never_crashes() {
        let info = CreateBaseAllocatorInfo::multipool(kb(1), 8);
        let mut buffer = vec![0u8; info.buffer_size()];
        let mut base = unsafe { BaseAllocator::create_in(buffer.as_mut_ptr(), &info) }.unwrap();

        assert_eq!(base.kind(), AllocatorKind::Multipool);
        assert!(!base.header().crash_on_allocation_failure());
        assert!(base.allocate(kb(2), 8, DebugInfo::none()).is_null());
    }

    #[test]
    fn test_handle_points_at_wrapped_allocator() {
        use crate::api::polymorphic::{allocate, allocator_buffer, allocator_current_usage};

        let infos = [
            CreateBaseAllocatorInfo::stack(kb(4)),
            CreateBaseAllocatorInfo::multipool(kb(4), 16),
            CreateBaseAllocatorInfo::arena(2, CreateBaseAllocatorInfo::stack(kb(2))),
        ];
        for info in &infos {
            let mut buffer = vec![0u8; info.buffer_size()];
            let mut base = unsafe { BaseAllocator::create_in(buffer.as_mut_ptr(), info) }.unwrap();
            let handle = unsafe { base.polymorphic(ConcurrencyMode::SingleThreaded) };

            let inner: *mut () = match &mut base {
                BaseAllocator::Stack(allocator) => (allocator as *mut StackAllocator).cast(),
                BaseAllocator::Multipool(allocator) => (allocator as *mut MultipoolAllocator).cast(),
                BaseAllocator::Arena(allocator) => (allocator as *mut MemoryArena).cast(),
            };
            assert_eq!(handle.instance(), inner);
            assert_eq!(handle.kind(), info.kind());
            assert_eq!(allocator_buffer(handle), buffer.as_mut_ptr());

            let ptr = allocate(handle, 64, 8);
            assert!(!ptr.is_null());
            assert!(base.belongs(ptr));
            assert!(allocator_current_usage(handle) >= 64);
        }
    }

    #[test]
    fn test_create_in_null_buffer() {
        let info = CreateBaseAllocatorInfo::stack(kb(1));
        let result = unsafe { BaseAllocator::create_in(std::ptr::null_mut(), &info) };
        assert!(matches!(result, Err(AllocatorError::BackupExhausted { .. })));
    }
}
