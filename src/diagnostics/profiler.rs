//! Usage profiling for allocators with profiling mode enabled.
//!
//! The hot path pushes a small sample onto a bounded lock-free queue.
//! Samples are folded into per-allocator profiles when someone asks for
//! them, or inline when the queue is full.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::api::config::ProfilerConfig;
use crate::api::kind::AllocatorKind;
use crate::error::Result;
use crate::sync::{Mutex, ReadWriteLock};

/// What happened to produce a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileEvent {
    /// A block was handed out.
    Allocate,
    /// A block was released.
    Deallocate,
    /// A block was moved or resized.
    Reallocate,
    /// The allocator rewound to a marker.
    Rewind,
    /// The allocator was cleared or freed.
    Clear,
}

/// Aggregated usage of one allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorProfile {
    /// Allocator kind.
    pub kind: AllocatorKind,
    /// Usage at the latest sample.
    pub current_usage: usize,
    /// Highest usage seen.
    pub peak_usage: usize,
    /// Successful allocations.
    pub allocations: u64,
    /// Successful deallocations.
    pub deallocations: u64,
    /// Successful reallocations.
    pub reallocations: u64,
    /// Blocks allocated and not yet released, as far as samples show.
    pub live_blocks: u64,
}

impl AllocatorProfile {
    fn new(kind: AllocatorKind) -> Self {
        Self {
            kind,
            current_usage: 0,
            peak_usage: 0,
            allocations: 0,
            deallocations: 0,
            reallocations: 0,
            live_blocks: 0,
        }
    }

    fn apply(&mut self, event: ProfileEvent, usage: usize) {
        match event {
            ProfileEvent::Allocate => {
                self.allocations += 1;
                self.live_blocks += 1;
            }
            ProfileEvent::Deallocate => {
                self.deallocations += 1;
                self.live_blocks = self.live_blocks.saturating_sub(1);
            }
            ProfileEvent::Reallocate => self.reallocations += 1,
            ProfileEvent::Rewind if usage > 0 => {}
            ProfileEvent::Rewind | ProfileEvent::Clear => self.live_blocks = 0,
        }
        self.current_usage = usage;
        self.peak_usage = self.peak_usage.max(usage);
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    key: usize,
    kind: AllocatorKind,
    event: ProfileEvent,
    usage: usize,
}

struct ProfilerState {
    queue: ArrayQueue<Sample>,
    profiles: Mutex<HashMap<usize, AllocatorProfile>>,
}

impl ProfilerState {
    fn fold(&self, profiles: &mut HashMap<usize, AllocatorProfile>, sample: Sample) {
        let profile = profiles
            .entry(sample.key)
            .or_insert_with(|| AllocatorProfile::new(sample.kind));
        if profile.kind != sample.kind {
            *profile = AllocatorProfile::new(sample.kind);
        }
        profile.apply(sample.event, sample.usage);
    }

    fn drain_into(&self, profiles: &mut HashMap<usize, AllocatorProfile>) {
        while let Some(sample) = self.queue.pop() {
            self.fold(profiles, sample);
        }
    }
}

/// Collects usage samples from allocators.
///
/// Normally used through [`global`](Self::global). Samples sent before
/// [`initialize`](Self::initialize) are dropped.
pub struct AllocatorProfiler {
    lock: ReadWriteLock,
    initialized: AtomicBool,
    state: UnsafeCell<Option<ProfilerState>>,
}

// SAFETY: `state` is only replaced under the write side of `lock`; the
// queue and the profile map are themselves thread-safe.
unsafe impl Sync for AllocatorProfiler {}

static GLOBAL_PROFILER: AllocatorProfiler = AllocatorProfiler::new();

impl AllocatorProfiler {
    /// An uninitialized profiler.
    pub const fn new() -> Self {
        Self {
            lock: ReadWriteLock::new(),
            initialized: AtomicBool::new(false),
            state: UnsafeCell::new(None),
        }
    }

    /// The profiler allocators report to.
    pub fn global() -> &'static Self {
        &GLOBAL_PROFILER
    }

    /// Start accepting samples. A second call keeps the existing profiles.
    pub fn initialize(&self, config: ProfilerConfig) -> Result<()> {
        config.validate()?;

        let _write = self.lock.write();
        // SAFETY: write side held.
        let state = unsafe { &mut *self.state.get() };
        if state.is_none() {
            *state = Some(ProfilerState {
                queue: ArrayQueue::new(config.queue_capacity),
                profiles: Mutex::new(HashMap::new()),
            });
            log::debug!("allocator profiler initialized (queue capacity {})", config.queue_capacity);
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Drop every profile and stop accepting samples.
    pub fn shutdown(&self) {
        let _write = self.lock.write();
        self.initialized.store(false, Ordering::Release);
        // SAFETY: write side held.
        if unsafe { (*self.state.get()).take() }.is_some() {
            log::debug!("allocator profiler shut down");
        }
    }

    /// Whether samples are being collected.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Send a sample.
    pub fn record(&self, key: usize, kind: AllocatorKind, event: ProfileEvent, usage: usize) {
        if !self.is_initialized() {
            return;
        }

        let _read = self.lock.read();
        // SAFETY: read side held.
        let Some(state) = (unsafe { &*self.state.get() }) else {
            return;
        };
        let sample = Sample {
            key,
            kind,
            event,
            usage,
        };
        if let Err(sample) = state.queue.push(sample) {
            let mut profiles = state.profiles.lock();
            state.drain_into(&mut profiles);
            state.fold(&mut profiles, sample);
        }
    }

    /// Fold every queued sample into the profiles.
    pub fn drain(&self) {
        let _read = self.lock.read();
        // SAFETY: read side held.
        if let Some(state) = unsafe { &*self.state.get() } {
            let mut profiles = state.profiles.lock();
            state.drain_into(&mut profiles);
        }
    }

    /// Current profile of the allocator at `key`.
    pub fn profile(&self, key: usize) -> Option<AllocatorProfile> {
        let _read = self.lock.read();
        // SAFETY: read side held.
        let state = unsafe { &*self.state.get() }.as_ref()?;
        let mut profiles = state.profiles.lock();
        state.drain_into(&mut profiles);
        profiles.get(&key).cloned()
    }

    /// Every profile, ordered by allocator address.
    pub fn profiles(&self) -> Vec<(usize, AllocatorProfile)> {
        let _read = self.lock.read();
        // SAFETY: read side held.
        let Some(state) = (unsafe { &*self.state.get() }) else {
            return Vec::new();
        };
        let mut profiles = state.profiles.lock();
        state.drain_into(&mut profiles);

        let mut all: Vec<_> = profiles
            .iter()
            .map(|(key, profile)| (*key, profile.clone()))
            .collect();
        all.sort_unstable_by_key(|(key, _)| *key);
        all
    }

    /// Forget the profile of an allocator.
    pub fn remove(&self, key: usize) -> Option<AllocatorProfile> {
        let _read = self.lock.read();
        // SAFETY: read side held.
        let state = unsafe { &*self.state.get() }.as_ref()?;
        let mut profiles = state.profiles.lock();
        state.drain_into(&mut profiles);
        profiles.remove(&key)
    }
}

impl Default for AllocatorProfiler {
    fn default() -> Self {
        Self::new()
    }
}
