//! Bump allocator that grows in chunks taken from a backup allocator.

use crate::api::base::{instance_key, unsupported, AllocatorBase, AllocatorHeader, MemoryRegion};
use crate::api::config::ResizableLinearConfig;
use crate::api::debug_info::DebugInfo;
use crate::api::kind::AllocatorKind;
use crate::api::polymorphic::{allocate_ex, deallocate_ex, AllocatorPolymorphic};
use crate::debug::TrackedOperation;
use crate::diagnostics::emit::emit_with_context;
use crate::diagnostics::kind::PA103;
use crate::error::{AllocatorError, Result};
use crate::sync::SpinMutex;
use crate::util::layout::{align_up, in_range, DEFAULT_ALIGNMENT};
use crate::util::size::format_bytes;

/// Maximum number of backup chunks live at once.
pub const MAX_RESIZABLE_LINEAR_CHUNKS: usize = 16;

/// A saved bump position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinearMarker {
    chunk_count: usize,
    top: usize,
    usage: usize,
}

impl LinearMarker {
    /// Usage at the time the marker was taken.
    pub fn usage(&self) -> usize {
        self.usage
    }

    /// Number of backup chunks live at the time the marker was taken.
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    fn min_position(self, other: LinearMarker) -> LinearMarker {
        if (other.chunk_count, other.top) < (self.chunk_count, self.top) {
            other
        } else {
            self
        }
    }
}

/// A buffer taken from the backup allocator.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    /// Start of the chunk.
    ptr: *mut u8,
    /// Chunk size in bytes.
    size: usize,
}

struct LinearState {
    /// First buffer, caller-provided or taken from `backup`; may be null.
    initial: *mut u8,
    /// Size of `initial` in bytes.
    initial_size: usize,
    /// Live backup chunks, oldest first.
    chunks: Vec<Chunk>,
    /// Offset inside the newest chunk, or inside `initial` when there is none.
    top: usize,
    /// Bytes handed out across all buffers, alignment slack included.
    usage: usize,
    /// Position saved by `set_marker`.
    marker: LinearMarker,
    /// Position in `initial` when the first chunk was taken.
    initial_top: usize,
    /// Usage when the first chunk was taken.
    initial_usage: usize,
    /// Source of chunks.
    backup: AllocatorPolymorphic,
    /// Minimum chunk size.
    backup_chunk_size: usize,
}

// SAFETY: the buffers are only touched through the state.
unsafe impl Send for LinearState {}

impl LinearState {
    fn current(&self) -> (*mut u8, usize) {
        self.chunks
            .last()
            .map_or((self.initial, self.initial_size), |chunk| (chunk.ptr, chunk.size))
    }

    fn position(&self) -> LinearMarker {
        LinearMarker {
            chunk_count: self.chunks.len(),
            top: self.top,
            usage: self.usage,
        }
    }

    fn allocate(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        if !alignment.is_power_of_two() {
            return std::ptr::null_mut();
        }
        let (base, capacity) = self.current();
        if !base.is_null() {
            let offset = align_up(base as usize + self.top, alignment) - base as usize;
            if let Some(end) = offset.checked_add(size) {
                if end <= capacity {
                    self.usage += end - self.top;
                    self.top = end;
                    return base.wrapping_add(offset);
                }
            }
        }
        self.allocate_chunk(size, alignment, info)
    }

    fn allocate_chunk(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        if self.chunks.len() >= MAX_RESIZABLE_LINEAR_CHUNKS {
            emit_with_context(&PA103, &format!("{} bytes at {}", size, info));
            return std::ptr::null_mut();
        }
        let Some(needed) = size.checked_add(alignment) else {
            return std::ptr::null_mut();
        };

        let chunk_size = self.backup_chunk_size.max(needed);
        let ptr = allocate_ex(self.backup, chunk_size, DEFAULT_ALIGNMENT, info);
        if ptr.is_null() {
            return ptr;
        }
        if self.chunks.is_empty() {
            self.initial_top = self.top;
            self.initial_usage = self.usage;
        }
        self.chunks.push(Chunk {
            ptr,
            size: chunk_size,
        });
        log::debug!(
            "resizable linear allocator: acquired chunk {} ({})",
            self.chunks.len(),
            format_bytes(chunk_size)
        );

        let offset = align_up(ptr as usize, alignment) - ptr as usize;
        self.top = offset + size;
        self.usage += self.top;
        ptr.wrapping_add(offset)
    }

    fn release_chunks(&mut self, keep: usize) {
        while self.chunks.len() > keep {
            if let Some(chunk) = self.chunks.pop() {
                // SAFETY: every chunk came from `backup` in `allocate_chunk`.
                unsafe { deallocate_ex(self.backup, chunk.ptr, DebugInfo::none()) };
                log::debug!(
                    "resizable linear allocator: released chunk {} ({})",
                    self.chunks.len() + 1,
                    format_bytes(chunk.size)
                );
            }
        }
    }

    fn is_valid_marker(&self, marker: &LinearMarker) -> bool {
        marker.chunk_count < self.chunks.len()
            || (marker.chunk_count == self.chunks.len() && marker.top <= self.top)
    }

    fn return_to(&mut self, marker: LinearMarker) {
        self.release_chunks(marker.chunk_count);
        self.top = marker.top;
        self.usage = marker.usage;
    }

    fn clear(&mut self) {
        self.release_chunks(0);
        self.top = 0;
        self.usage = 0;
        self.marker = LinearMarker::default();
    }

    fn clear_backup(&mut self) {
        if self.chunks.is_empty() {
            return;
        }
        self.release_chunks(0);
        self.top = self.initial_top;
        self.usage = self.initial_usage;
        if self.marker.chunk_count > 0 {
            self.marker = self.position();
        }
    }

    fn belongs(&self, ptr: *const u8) -> bool {
        in_range(ptr, self.initial, self.initial_size)
            || self.chunks.iter().any(|chunk| in_range(ptr, chunk.ptr, chunk.size))
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        let mut regions = Vec::with_capacity(self.chunks.len() + 1);
        if !self.initial.is_null() {
            regions.push(MemoryRegion::new(self.initial, self.initial_size));
        }
        regions.extend(self.chunks.iter().map(|chunk| MemoryRegion::new(chunk.ptr, chunk.size)));
        regions
    }
}

/// Linear allocator with marker rewind across backup chunks.
///
/// Individual deallocations are no-ops. Memory comes back through
/// [`return_to_marker`](Self::return_to_marker), [`clear`](AllocatorBase::clear),
/// [`clear_backup`](Self::clear_backup) or [`free`](AllocatorBase::free).
/// When the current buffer is full, a chunk of
/// `max(backup_chunk_size, size + alignment)` bytes is taken from the
/// backup allocator; at most [`MAX_RESIZABLE_LINEAR_CHUNKS`] are live.
pub struct ResizableLinearAllocator {
    header: AllocatorHeader,
    state: SpinMutex<LinearState>,
    owns_initial: bool,
}

impl ResizableLinearAllocator {
    /// Create an allocator whose initial buffer also comes from `backup`.
    ///
    /// `backup` must outlive the allocator.
    pub fn new(backup: AllocatorPolymorphic, config: ResizableLinearConfig) -> Result<Self> {
        config.validate()?;
        let initial = if config.initial_size > 0 {
            let ptr = allocate_ex(backup, config.initial_size, DEFAULT_ALIGNMENT, DebugInfo::none());
            if ptr.is_null() {
                return Err(AllocatorError::BackupExhausted {
                    size: config.initial_size,
                });
            }
            ptr
        } else {
            std::ptr::null_mut()
        };

        // SAFETY: the buffer was just allocated with the configured size.
        let mut allocator = unsafe {
            Self::with_buffer(initial, config.initial_size, backup, config.backup_chunk_size)
        };
        allocator.owns_initial = !initial.is_null();
        Ok(allocator)
    }

    /// Create an allocator over a caller-provided initial buffer.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `size` bytes for the allocator's whole
    /// lifetime and not be used by anything else. `backup` must outlive
    /// the allocator.
    pub unsafe fn with_buffer(
        buffer: *mut u8,
        size: usize,
        backup: AllocatorPolymorphic,
        backup_chunk_size: usize,
    ) -> Self {
        Self {
            header: AllocatorHeader::new(),
            state: SpinMutex::new(LinearState {
                initial: buffer,
                initial_size: if buffer.is_null() { 0 } else { size },
                chunks: Vec::with_capacity(MAX_RESIZABLE_LINEAR_CHUNKS),
                top: 0,
                usage: 0,
                marker: LinearMarker::default(),
                initial_top: 0,
                initial_usage: 0,
                backup,
                backup_chunk_size,
            }),
            owns_initial: false,
        }
    }

    /// Number of live backup chunks.
    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Remember the current position.
    pub fn set_marker(&mut self) {
        let state = self.state.get_mut();
        state.marker = state.position();
    }

    /// The current position, usable with [`return_to`](Self::return_to).
    pub fn get_marker(&self) -> LinearMarker {
        self.state.lock().position()
    }

    /// Rewind to the last [`set_marker`](Self::set_marker), releasing
    /// chunks taken since.
    pub fn return_to_marker(&mut self, info: DebugInfo) {
        let state = self.state.get_mut();
        let marker = state.marker;
        state.return_to(marker);
        self.after_rewind(info);
    }

    /// Rewind to `marker`, releasing chunks taken since.
    ///
    /// A marker ahead of the current position (for example one taken from
    /// a different allocator) is a programming error and crashes.
    #[track_caller]
    pub fn return_to(&mut self, marker: LinearMarker, info: DebugInfo) {
        let state = self.state.get_mut();
        if !state.is_valid_marker(&marker) {
            unsupported(AllocatorKind::ResizableLinear, "returning to a foreign marker", info);
        }
        state.return_to(marker);
        state.marker = state.marker.min_position(marker);
        self.after_rewind(info);
    }

    /// Thread-safe [`return_to`](Self::return_to).
    #[track_caller]
    pub fn return_to_ts(&self, marker: LinearMarker, info: DebugInfo) {
        {
            let mut state = self.state.lock();
            if !state.is_valid_marker(&marker) {
                unsupported(AllocatorKind::ResizableLinear, "returning to a foreign marker", info);
            }
            state.return_to(marker);
            state.marker = state.marker.min_position(marker);
        }
        self.after_rewind(info);
    }

    /// Release every backup chunk, keeping what lives in the initial buffer.
    pub fn clear_backup(&mut self, info: DebugInfo) {
        self.state.get_mut().clear_backup();
        self.after_rewind(info);
    }

    fn after_rewind(&self, info: DebugInfo) {
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::ResizableLinear,
            TrackedOperation::ReturnToMarker,
            info,
            || self.current_usage(),
        );
    }

    fn finish_allocate(&self, ptr: *mut u8, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        self.header.on_allocate(
            instance_key(self),
            AllocatorKind::ResizableLinear,
            ptr,
            size,
            alignment,
            info,
            || self.current_usage(),
        )
    }

    fn release_initial(&mut self) {
        let state = self.state.get_mut();
        state.clear();
        if self.owns_initial && !state.initial.is_null() {
            // SAFETY: the initial buffer came from `backup` in `new`.
            unsafe { deallocate_ex(state.backup, state.initial, DebugInfo::none()) };
        }
        state.initial = std::ptr::null_mut();
        state.initial_size = 0;
        self.owns_initial = false;
    }
}

impl AllocatorBase for ResizableLinearAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::ResizableLinear
    }

    fn header(&self) -> &AllocatorHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut AllocatorHeader {
        &mut self.header
    }

    fn allocate(&mut self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.state.get_mut().allocate(size, alignment, info);
        self.finish_allocate(ptr, size, alignment, info)
    }

    fn allocate_ts(&self, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        let ptr = self.state.lock().allocate(size, alignment, info);
        self.finish_allocate(ptr, size, alignment, info)
    }

    /// No-op; memory is reclaimed by rewinding.
    unsafe fn deallocate_no_assert(&mut self, ptr: *mut u8, info: DebugInfo) -> bool {
        self.header.on_deallocate(
            instance_key(self),
            AllocatorKind::ResizableLinear,
            ptr,
            true,
            info,
            || self.current_usage(),
        )
    }

    unsafe fn deallocate_no_assert_ts(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        self.header.on_deallocate(
            instance_key(self),
            AllocatorKind::ResizableLinear,
            ptr,
            true,
            info,
            || self.current_usage(),
        )
    }

    /// Always bumps a new block; the payload is not copied.
    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let new = self.state.get_mut().allocate(new_size, alignment, info);
        self.header.on_reallocate(
            instance_key(self),
            AllocatorKind::ResizableLinear,
            ptr,
            new,
            new_size,
            alignment,
            info,
            || self.current_usage(),
        )
    }

    unsafe fn reallocate_ts(
        &self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let new = self.state.lock().allocate(new_size, alignment, info);
        self.header.on_reallocate(
            instance_key(self),
            AllocatorKind::ResizableLinear,
            ptr,
            new,
            new_size,
            alignment,
            info,
            || self.current_usage(),
        )
    }

    fn clear(&mut self, info: DebugInfo) {
        self.state.get_mut().clear();
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::ResizableLinear,
            TrackedOperation::Clear,
            info,
            || 0,
        );
    }

    /// Releases every chunk and, if it came from the backup allocator, the
    /// initial buffer.
    fn free(&mut self, info: DebugInfo) {
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::ResizableLinear,
            TrackedOperation::Free,
            info,
            || 0,
        );
        self.release_initial();
    }

    fn belongs(&self, ptr: *const u8) -> bool {
        self.state.lock().belongs(ptr)
    }

    fn current_usage(&self) -> usize {
        self.state.lock().usage
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        self.state.lock().regions()
    }

    fn buffer(&self) -> *mut u8 {
        self.state.lock().initial
    }
}

impl Drop for ResizableLinearAllocator {
    fn drop(&mut self) {
        self.release_initial();
    }
}

impl std::fmt::Debug for ResizableLinearAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResizableLinearAllocator")
            .field("initial_size", &state.initial_size)
            .field("chunks", &state.chunks.len())
            .field("usage", &state.usage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::MallocAllocator;
    use crate::api::kind::ConcurrencyMode;
    use crate::api::polymorphic::allocator_current_usage;
    use crate::util::layout::is_aligned;
    use crate::util::size::kb;

    fn config() -> ResizableLinearConfig {
        ResizableLinearConfig::default()
            .with_initial_size(kb(1))
            .with_backup_chunk_size(kb(1))
    }

    #[test]
    fn test_grows_into_chunks() {
        let mut allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();

        for _ in 0..8 {
            let ptr = allocator.allocate(300, 16, DebugInfo::none());
            assert!(is_aligned(ptr as usize, 16));
            assert!(allocator.belongs(ptr));
        }
        assert!(allocator.chunk_count() >= 2);
    }

    #[test]
    fn test_oversized_request_gets_own_chunk() {
        let mut allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();
        let ptr = allocator.allocate(kb(8), 64, DebugInfo::none());
        assert!(!ptr.is_null());
        assert!(is_aligned(ptr as usize, 64));
        assert_eq!(allocator.chunk_count(), 1);
        assert!(allocator.regions()[1].size >= kb(8) + 64);
    }

    #[test]
    fn test_marker_round_trip_across_chunks() {
        let mut allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();

        allocator.allocate(100, 8, DebugInfo::none());
        for _ in 0..4 {
            let before = allocator.current_usage();
            let chunks = allocator.chunk_count();
            allocator.set_marker();

            for _ in 0..5 {
                allocator.allocate(700, 8, DebugInfo::none());
            }
            assert!(allocator.chunk_count() > chunks);

            allocator.return_to_marker(DebugInfo::none());
            assert_eq!(allocator.current_usage(), before);
            assert_eq!(allocator.chunk_count(), chunks);
        }
    }

    #[test]
    fn test_deallocate_is_noop() {
        let mut allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();
        let ptr = allocator.allocate(64, 8, DebugInfo::none());
        let usage = allocator.current_usage();
        assert!(unsafe { allocator.deallocate_no_assert(ptr, DebugInfo::none()) });
        assert_eq!(allocator.current_usage(), usage);
    }

    #[test]
    fn test_clear_backup_keeps_initial() {
        let mut allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();
        allocator.allocate(512, 8, DebugInfo::none());
        let initial_usage = allocator.current_usage();
        allocator.allocate(900, 8, DebugInfo::none());
        allocator.allocate(900, 8, DebugInfo::none());
        assert_eq!(allocator.chunk_count(), 2);

        allocator.clear_backup(DebugInfo::none());
        assert_eq!(allocator.chunk_count(), 0);
        assert_eq!(allocator.current_usage(), initial_usage);

        allocator.clear(DebugInfo::none());
        assert_eq!(allocator.current_usage(), 0);
    }

    #[test]
    fn test_free_returns_everything_to_backup() {
        let mut backup = MallocAllocator::new();
        let backup = unsafe { backup.polymorphic(ConcurrencyMode::ThreadSafe) };

        let mut allocator = ResizableLinearAllocator::new(backup, config()).unwrap();
        allocator.allocate(kb(2), 8, DebugInfo::none());
        assert!(allocator_current_usage(backup) > kb(1));

        allocator.free(DebugInfo::none());
        assert_eq!(allocator_current_usage(backup), 0);
        assert!(allocator.buffer().is_null());
    }

    #[test]
    fn test_chunk_limit() {
        let mut allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();
        allocator.exit_crash_on_allocation_failure();
        crate::diagnostics::suppress_diagnostics(true);

        // The first request fills the initial buffer, each later one needs
        // its own chunk.
        for _ in 0..=MAX_RESIZABLE_LINEAR_CHUNKS {
            assert!(!allocator.allocate(kb(1), 8, DebugInfo::none()).is_null());
        }
        assert_eq!(allocator.chunk_count(), MAX_RESIZABLE_LINEAR_CHUNKS);
        assert!(allocator.allocate(kb(1), 8, DebugInfo::none()).is_null());
    }

    #[test]
    fn test_invalid_alignment_returns_null() {
        let mut allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();
        allocator.exit_crash_on_allocation_failure();

        assert!(allocator.allocate(8, 24, DebugInfo::none()).is_null());
        assert!(allocator.allocate(8, 0, DebugInfo::none()).is_null());
        assert_eq!(allocator.current_usage(), 0);
        assert_eq!(allocator.chunk_count(), 0);
    }

    #[test]
    fn test_reallocate_ts_bumps_new_block() {
        let allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();

        let a = allocator.allocate_ts(64, 8, DebugInfo::none());
        let usage = allocator.current_usage();
        let b = unsafe { allocator.reallocate_ts(a, 128, 8, DebugInfo::none()) };
        assert_ne!(a, b);
        assert!(allocator.belongs(b));
        assert_eq!(b as usize, a as usize + 64);
        assert_eq!(allocator.current_usage(), usage + 128);
    }

    #[test]
    fn test_concurrent_allocate_then_return_to_ts() {
        let config = ResizableLinearConfig::default()
            .with_initial_size(kb(1))
            .with_backup_chunk_size(kb(4));
        let allocator = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config).unwrap();

        allocator.allocate_ts(100, 8, DebugInfo::none());
        let before = allocator.current_usage();
        let marker = allocator.get_marker();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let ptr = allocator.allocate_ts(64, 16, DebugInfo::none());
                        assert!(is_aligned(ptr as usize, 16));
                        assert!(allocator.belongs(ptr));
                    }
                });
            }
        });
        assert!(allocator.current_usage() >= before + 4 * 50 * 64);
        assert!(allocator.chunk_count() > 0);

        allocator.return_to_ts(marker, DebugInfo::none());
        assert_eq!(allocator.current_usage(), before);
        assert_eq!(allocator.chunk_count(), 0);
    }

    #[test]
    #[should_panic(expected = "PA003")]
    fn test_foreign_marker_crashes() {
        crate::diagnostics::suppress_diagnostics(true);
        let mut a = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();
        let mut b = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config()).unwrap();

        for _ in 0..4 {
            a.allocate(900, 8, DebugInfo::none());
        }
        let marker = a.get_marker();
        b.return_to(marker, DebugInfo::none());
    }
}
