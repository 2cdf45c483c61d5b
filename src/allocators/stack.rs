//! LIFO bump allocator over a caller-provided buffer.

use crate::api::base::{instance_key, AllocatorBase, AllocatorHeader, MemoryRegion};
use crate::api::debug_info::DebugInfo;
use crate::api::kind::AllocatorKind;
use crate::debug::TrackedOperation;
use crate::sync::SpinMutex;
use crate::util::layout::{align_up, in_range};

struct StackState {
    /// Start of the caller-provided memory.
    buffer: *mut u8,
    /// Buffer size in bytes.
    capacity: usize,
    /// Offset of the first free byte.
    top: usize,
    /// Offset saved by `set_marker`.
    marker: usize,
    /// `top` before the most recent allocation, for `undo_last`.
    last_top: usize,
}

// SAFETY: the buffer is only touched through the state, which the
// surrounding SpinMutex (or `&mut`) serializes.
unsafe impl Send for StackState {}

impl StackState {
    fn allocate(&mut self, size: usize, alignment: usize) -> *mut u8 {
        if !alignment.is_power_of_two() {
            return std::ptr::null_mut();
        }
        let base = self.buffer as usize;
        // One byte below the returned pointer holds the distance back to
        // the block start.
        let aligned = align_up(base + self.top + 1, alignment);
        let offset = aligned - base;
        let Some(end) = offset.checked_add(size) else {
            return std::ptr::null_mut();
        };
        if end > self.capacity {
            return std::ptr::null_mut();
        }

        let back_offset = offset - 1 - self.top;
        if back_offset > u8::MAX as usize {
            return std::ptr::null_mut();
        }

        // SAFETY: `offset - 1 >= top` lies inside the buffer.
        unsafe {
            let ptr = self.buffer.add(offset);
            ptr.sub(1).write(back_offset as u8);
            self.last_top = self.top;
            self.top = end;
            ptr
        }
    }

    /// # Safety
    ///
    /// If `ptr` is inside the buffer, the byte before it must be readable.
    unsafe fn deallocate(&mut self, ptr: *mut u8) -> bool {
        let base = self.buffer as usize;
        let address = ptr as usize;
        if address <= base || address >= base + self.capacity {
            return false;
        }

        let back_offset = ptr.sub(1).read() as usize;
        let header = address - base - 1;
        if back_offset > header {
            return false;
        }
        let block_start = header - back_offset;
        if block_start > self.top {
            return false;
        }

        // Everything allocated after this block is released with it.
        self.top = block_start;
        self.last_top = self.last_top.min(block_start);
        self.marker = self.marker.min(block_start);
        true
    }

    fn clear(&mut self) {
        self.top = 0;
        self.marker = 0;
        self.last_top = 0;
    }
}

/// Stack allocator with back-offset headers and marker rewind.
///
/// Only the most recent allocation can be released safely: deallocating an
/// older block moves the top back to it and truncates everything after.
/// [`set_marker`](Self::set_marker) / [`return_to_marker`](Self::return_to_marker)
/// rewind a whole scope.
pub struct StackAllocator {
    header: AllocatorHeader,
    state: SpinMutex<StackState>,
}

impl StackAllocator {
    /// Create a stack allocator over `capacity` bytes at `buffer`.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `capacity` bytes for
    /// the allocator's whole lifetime and not be used by anything else.
    pub unsafe fn new(buffer: *mut u8, capacity: usize) -> Self {
        Self::with_header(buffer, capacity, AllocatorHeader::new())
    }

    pub(crate) unsafe fn with_header(buffer: *mut u8, capacity: usize, header: AllocatorHeader) -> Self {
        Self {
            header,
            state: SpinMutex::new(StackState {
                buffer,
                capacity,
                top: 0,
                marker: 0,
                last_top: 0,
            }),
        }
    }

    /// Size of the buffer.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Remember the current top.
    pub fn set_marker(&mut self) {
        let state = self.state.get_mut();
        state.marker = state.top;
    }

    /// The current top, usable with [`return_to`](Self::return_to).
    pub fn get_marker(&self) -> usize {
        self.state.lock().top
    }

    /// Rewind to the last [`set_marker`](Self::set_marker).
    pub fn return_to_marker(&mut self, info: DebugInfo) {
        let state = self.state.get_mut();
        state.top = state.marker;
        state.last_top = state.last_top.min(state.marker);
        self.after_rewind(info);
    }

    /// Rewind to a top returned by [`get_marker`](Self::get_marker).
    ///
    /// Markers above the current top are ignored.
    pub fn return_to(&mut self, marker: usize, info: DebugInfo) {
        let state = self.state.get_mut();
        if marker > state.top {
            return;
        }
        state.top = marker;
        state.marker = state.marker.min(marker);
        state.last_top = state.last_top.min(marker);
        self.after_rewind(info);
    }

    /// Release the most recent allocation.
    pub fn undo_last(&mut self, info: DebugInfo) {
        let state = self.state.get_mut();
        state.top = state.last_top;
        state.marker = state.marker.min(state.top);
        self.after_rewind(info);
    }

    fn after_rewind(&self, info: DebugInfo) {
        self.header.on_operation(
            instance_key(self),
            AllocatorKind::Stack,
            TrackedOperation::ReturnToMarker,
            info,
            || self.current_usage(),
        );
    }

    fn finish_allocate(&self, ptr: *mut u8, size: usize, alignment: usize, info: DebugInfo) -> *mut u8 {
        self.header.on_allocate(
            instance_key(self),
            AllocatorKind::Stack,
            ptr,
            size,
            alignment,
            info,
            || self.current_usage(),
        )
    }
}

impl AllocatorBase for StackAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Stack
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
        self.header.on_deallocate(instance_key(self), AllocatorKind::Stack, ptr, freed, info, || {
            self.current_usage()
        })
    }

    unsafe fn deallocate_no_assert_ts(&self, ptr: *mut u8, info: DebugInfo) -> bool {
        let freed = self.state.lock().deallocate(ptr);
        self.header.on_deallocate(instance_key(self), AllocatorKind::Stack, ptr, freed, info, || {
            self.current_usage()
        })
    }

    /// Always allocates a new block; the old block stays where it is and
    /// its payload is not copied.
    unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
        info: DebugInfo,
    ) -> *mut u8 {
        let new = self.state.get_mut().allocate(new_size, alignment);
        self.header.on_reallocate(
            instance_key(self),
            AllocatorKind::Stack,
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
        let new = self.state.lock().allocate(new_size, alignment);
        self.header.on_reallocate(
            instance_key(self),
            AllocatorKind::Stack,
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
            AllocatorKind::Stack,
            TrackedOperation::Clear,
            info,
            || 0,
        );
    }

    fn belongs(&self, ptr: *const u8) -> bool {
        let state = self.state.lock();
        in_range(ptr, state.buffer, state.capacity)
    }

    fn current_usage(&self) -> usize {
        self.state.lock().top
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        let state = self.state.lock();
        vec![MemoryRegion::new(state.buffer, state.capacity)]
    }

    fn buffer(&self) -> *mut u8 {
        self.state.lock().buffer
    }
}

impl std::fmt::Debug for StackAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StackAllocator")
            .field("capacity", &state.capacity)
            .field("top", &state.top)
            .field("marker", &state.marker)
            .finish()
    }
}
