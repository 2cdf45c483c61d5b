//! Alignment arithmetic shared by every allocator.

/// Cache line size assumed by the allocators.
///
/// Back-offset headers must stay below this value, and composite
/// allocators align sub-buffers to it.
pub const CACHE_LINE_SIZE: usize = 64;

/// Largest alignment an allocator with a 1-byte back-offset can honour.
pub const MAX_ALIGNMENT: usize = CACHE_LINE_SIZE;

/// Default alignment used when callers don't care.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Align a size or address up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Whether `value` is a multiple of `align`.
#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Whether an alignment is usable by the allocators.
#[inline]
pub const fn is_valid_alignment(align: usize) -> bool {
    align.is_power_of_two() && align <= MAX_ALIGNMENT
}

/// Whether `ptr` lies in `[start, start + size)`.
#[inline]
pub fn in_range(ptr: *const u8, start: *const u8, size: usize) -> bool {
    let addr = ptr as usize;
    let begin = start as usize;
    addr >= begin && addr < begin + size
}
