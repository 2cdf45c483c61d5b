//! Atomic usage gauge for allocators without an internal lock.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks live bytes and live allocation count, with a high-water mark.
///
/// Used by the malloc-backed allocator, whose thread-safe path has no
/// lock to piggyback statistics on.
#[derive(Debug, Default)]
pub struct UsageGauge {
    bytes: AtomicUsize,
    peak: AtomicUsize,
    count: AtomicUsize,
}

impl UsageGauge {
    /// Create an empty gauge.
    pub const fn new() -> Self {
        Self {
            bytes: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    /// Record a new allocation of `size` bytes. Returns the new total.
    pub fn record_alloc(&self, size: usize) -> usize {
        self.count.fetch_add(1, Ordering::Relaxed);
        let total = self.bytes.fetch_add(size, Ordering::Relaxed) + size;

        let mut peak = self.peak.load(Ordering::Relaxed);
        while total > peak {
            match self
                .peak
                .compare_exchange_weak(peak, total, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
        total
    }

    /// Record the release of `size` bytes. Returns the new total.
    pub fn record_dealloc(&self, size: usize) -> usize {
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(size, Ordering::Relaxed) - size
    }

    /// Live bytes.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Live allocations.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Highest value `bytes` has reached.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}
