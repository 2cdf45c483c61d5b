//! Process-wide record of allocator calls.
//!
//! Allocators with debug mode on report every call here. Each allocator
//! gets its own log, a fixed-size ring by default or a growable list when
//! registered as resizable. The allocator map sits behind a
//! [`ReadWriteLock`]; recording into a known allocator only takes the read
//! side, and the first call of an unknown allocator upgrades to the write
//! side to register it.

use std::cell::UnsafeCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::api::config::DebugManagerConfig;
use crate::api::debug_info::DebugInfo;
use crate::api::kind::AllocatorKind;
use crate::diagnostics::emit::emit_with_context;
use crate::diagnostics::kind::PA201;
use crate::error::{AllocatorError, Result};
use crate::sync::{ReadWriteLock, SpinMutex};

/// What a tracked call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedOperation {
    /// A block was handed out.
    Allocate,
    /// A block was released.
    Deallocate,
    /// A block was moved or resized.
    Reallocate,
    /// Every allocation was dropped.
    Clear,
    /// The backing memory was released.
    Free,
    /// The allocator rewound to a marker.
    ReturnToMarker,
}

impl TrackedOperation {
    /// Name used in the text dump.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Allocate => "Allocate",
            Self::Deallocate => "Deallocate",
            Self::Reallocate => "Reallocate",
            Self::Clear => "Clear",
            Self::Free => "Free",
            Self::ReturnToMarker => "ReturnToMarker",
        }
    }
}

impl fmt::Display for TrackedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded allocator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedCall {
    /// The operation.
    pub operation: TrackedOperation,
    /// Call site.
    pub info: DebugInfo,
    /// Address of the block involved, 0 for whole-allocator operations.
    pub pointer: usize,
    /// Address after a reallocation, 0 otherwise.
    pub new_pointer: usize,
    /// Requested size.
    pub size: usize,
    /// Requested alignment.
    pub alignment: usize,
    /// Stack at the time of the call, with the `debug` feature.
    pub backtrace: Option<String>,
}

impl TrackedCall {
    /// A call with no pointer or size attached.
    pub fn new(operation: TrackedOperation, info: DebugInfo) -> Self {
        Self {
            operation,
            info,
            pointer: 0,
            new_pointer: 0,
            size: 0,
            alignment: 0,
            backtrace: None,
        }
    }

    /// Attach the block address.
    pub fn with_pointer(mut self, ptr: *mut u8) -> Self {
        self.pointer = ptr as usize;
        self
    }

    /// Attach the address a reallocation moved to.
    pub fn with_new_pointer(mut self, ptr: *mut u8) -> Self {
        self.new_pointer = ptr as usize;
        self
    }

    /// Attach the requested size and alignment.
    pub fn with_size(mut self, size: usize, alignment: usize) -> Self {
        self.size = size;
        self.alignment = alignment;
        self
    }
}

struct CallLog {
    calls: VecDeque<TrackedCall>,
    capacity: usize,
    resizable: bool,
}

impl CallLog {
    fn new(capacity: usize, resizable: bool) -> Self {
        Self {
            calls: VecDeque::with_capacity(if resizable { 0 } else { capacity }),
            capacity,
            resizable,
        }
    }

    fn push(&mut self, call: TrackedCall) {
        if !self.resizable && self.calls.len() >= self.capacity {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }

    fn set_resizable(&mut self, resizable: bool) {
        self.resizable = resizable;
        if !resizable {
            let excess = self.calls.len().saturating_sub(self.capacity);
            self.calls.drain(..excess);
        }
    }
}

struct TrackedAllocator {
    kind: AllocatorKind,
    log: SpinMutex<CallLog>,
}

impl TrackedAllocator {
    fn new(kind: AllocatorKind, config: &DebugManagerConfig, resizable: bool) -> Self {
        Self {
            kind,
            log: SpinMutex::new(CallLog::new(config.ring_capacity, resizable)),
        }
    }
}

struct DebugState {
    config: DebugManagerConfig,
    allocators: HashMap<usize, TrackedAllocator>,
}

/// Registry of per-allocator call logs.
///
/// Normally used through [`global`](Self::global). Calls made before
/// [`initialize`](Self::initialize) or after [`shutdown`](Self::shutdown)
/// are dropped.
pub struct DebugAllocatorManager {
    lock: ReadWriteLock,
    initialized: AtomicBool,
    state: UnsafeCell<Option<DebugState>>,
}

// SAFETY: `state` is only read under the read side of `lock` and only
// written under the write side.
unsafe impl Sync for DebugAllocatorManager {}

static GLOBAL_DEBUG_MANAGER: DebugAllocatorManager = DebugAllocatorManager::new();

impl DebugAllocatorManager {
    /// An uninitialized manager.
    pub const fn new() -> Self {
        Self {
            lock: ReadWriteLock::new(),
            initialized: AtomicBool::new(false),
            state: UnsafeCell::new(None),
        }
    }

    /// The manager allocators report to.
    pub fn global() -> &'static Self {
        &GLOBAL_DEBUG_MANAGER
    }

    /// Start accepting calls. Re-initializing keeps existing logs and
    /// replaces the config used for new ones.
    pub fn initialize(&self, config: DebugManagerConfig) -> Result<()> {
        config.validate()?;

        let _write = self.lock.write();
        // SAFETY: write side held.
        let state = unsafe { &mut *self.state.get() };
        match state {
            Some(state) => state.config = config,
            None => {
                *state = Some(DebugState {
                    config,
                    allocators: HashMap::new(),
                })
            }
        }
        self.initialized.store(true, Ordering::Release);
        log::debug!(
            "debug allocator manager initialized (ring capacity {})",
            config.ring_capacity
        );
        Ok(())
    }

    /// Drop every log and stop accepting calls.
    pub fn shutdown(&self) {
        let _write = self.lock.write();
        self.initialized.store(false, Ordering::Release);
        // SAFETY: write side held.
        let previous = unsafe { (*self.state.get()).take() };
        if let Some(state) = previous {
            log::debug!(
                "debug allocator manager shut down ({} allocators tracked)",
                state.allocators.len()
            );
        }
    }

    /// Whether calls are being recorded.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Record a call of the allocator at `key`, registering it on first use.
    pub fn record(&self, key: usize, kind: AllocatorKind, mut call: TrackedCall) {
        if !self.is_initialized() {
            return;
        }

        let read = self.lock.read();
        // SAFETY: read side held.
        let Some(state) = (unsafe { &*self.state.get() }) else {
            return;
        };
        if state.config.capture_backtraces {
            call.backtrace = super::backtrace::capture();
        }
        if let Some(entry) = state.allocators.get(&key) {
            if entry.kind == kind {
                entry.log.lock().push(call);
                return;
            }
        }

        // The entry is missing or belongs to a dead allocator that lived at
        // the same address. Another writer may have run while upgrading, so
        // look the key up again.
        let (_write, _) = read.upgrade();
        // SAFETY: write side held.
        let Some(state) = (unsafe { &mut *self.state.get() }) else {
            return;
        };
        let config = state.config;
        let entry = state
            .allocators
            .entry(key)
            .or_insert_with(|| TrackedAllocator::new(kind, &config, config.default_resizable));
        if entry.kind != kind {
            *entry = TrackedAllocator::new(kind, &config, config.default_resizable);
        }
        entry.log.get_mut().push(call);
    }

    /// Register an allocator explicitly.
    ///
    /// With `resizable` the allocator keeps every call; an existing ring is
    /// promoted and keeps what it holds.
    pub fn register(&self, key: usize, kind: AllocatorKind, resizable: bool) {
        if !self.is_initialized() {
            emit_with_context(&PA201, &format!("{} allocator {:#x}", kind, key));
            return;
        }

        let _write = self.lock.write();
        // SAFETY: write side held.
        let Some(state) = (unsafe { &mut *self.state.get() }) else {
            return;
        };
        let config = state.config;
        let entry = state
            .allocators
            .entry(key)
            .or_insert_with(|| TrackedAllocator::new(kind, &config, resizable));
        if entry.kind != kind {
            *entry = TrackedAllocator::new(kind, &config, resizable);
        } else if resizable {
            entry.log.get_mut().set_resizable(true);
        }
        log::debug!("tracking {} allocator {:#x} (resizable: {})", kind, key, resizable);
    }

    /// Switch an allocator between ring and growable log.
    ///
    /// Turning resizability off keeps the newest `ring_capacity` calls.
    /// Returns `false` if the allocator is not tracked.
    pub fn change_resizability(&self, key: usize, resizable: bool) -> bool {
        let _read = self.lock.read();
        // SAFETY: read side held.
        let Some(state) = (unsafe { &*self.state.get() }) else {
            return false;
        };
        match state.allocators.get(&key) {
            Some(entry) => {
                entry.log.lock().set_resizable(resizable);
                true
            }
            None => false,
        }
    }

    /// Stop tracking an allocator and drop its log.
    pub fn remove_allocator(&self, key: usize) -> bool {
        let _write = self.lock.write();
        // SAFETY: write side held.
        match unsafe { &mut *self.state.get() } {
            Some(state) => state.allocators.remove(&key).is_some(),
            None => false,
        }
    }

    /// Calls recorded for an allocator, oldest first.
    pub fn calls(&self, key: usize) -> Vec<TrackedCall> {
        let _read = self.lock.read();
        // SAFETY: read side held.
        let Some(state) = (unsafe { &*self.state.get() }) else {
            return Vec::new();
        };
        state
            .allocators
            .get(&key)
            .map(|entry| entry.log.lock().calls.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tracked allocators, ordered by address.
    pub fn tracked_allocators(&self) -> Vec<(usize, AllocatorKind)> {
        let _read = self.lock.read();
        // SAFETY: read side held.
        let Some(state) = (unsafe { &*self.state.get() }) else {
            return Vec::new();
        };
        let mut allocators: Vec<_> = state
            .allocators
            .iter()
            .map(|(key, entry)| (*key, entry.kind))
            .collect();
        allocators.sort_unstable_by_key(|(key, _)| *key);
        allocators
    }

    /// Write every log to a file.
    pub fn write_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_state_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Write every log as text. Fails with
    /// [`AllocatorError::NotInitialized`] before [`initialize`](Self::initialize).
    ///
    /// Each allocator starts with an `Allocator` line, followed by one
    /// block per call:
    ///
    /// ```text
    /// Allocator 0x55d0c0a0 Stack (2 calls)
    /// Type: Allocate
    /// Pointer: 0x55d0c0b0
    /// File: src/main.rs
    /// Function: app::update
    /// Line: 42
    /// ```
    pub fn write_state_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let _read = self.lock.read();
        // SAFETY: read side held.
        let Some(state) = (unsafe { &*self.state.get() }) else {
            return Err(AllocatorError::NotInitialized);
        };

        let mut keys: Vec<_> = state.allocators.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            let entry = &state.allocators[&key];
            let log = entry.log.lock();
            writeln!(writer, "Allocator {:#x} {} ({} calls)", key, entry.kind, log.calls.len())?;
            for call in &log.calls {
                writeln!(writer, "Type: {}", call.operation)?;
                writeln!(writer, "Pointer: {:#x}", call.pointer)?;
                if call.operation == TrackedOperation::Reallocate {
                    writeln!(writer, "New Pointer: {:#x}", call.new_pointer)?;
                }
                writeln!(writer, "File: {}", call.info.file)?;
                writeln!(writer, "Function: {}", call.info.function)?;
                writeln!(writer, "Line: {}", call.info.line)?;
                if let Some(backtrace) = &call.backtrace {
                    writeln!(writer, "Backtrace:\n{}", backtrace)?;
                }
            }
            writeln!(writer)?;
        }
        Ok(())
    }
}

impl Default for DebugAllocatorManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(line: u32) -> TrackedCall {
        TrackedCall::new(TrackedOperation::Allocate, DebugInfo::new("lib.rs", "test", line))
            .with_pointer(0x1000 as *mut u8)
            .with_size(16, 8)
    }

    fn lines(calls: &[TrackedCall]) -> Vec<u32> {
        calls.iter().map(|c| c.info.line).collect()
    }

    #[test]
    fn test_uninitialized_drops_calls() {
        let manager = DebugAllocatorManager::new();
        manager.record(1, AllocatorKind::Stack, call(1));
        assert!(manager.calls(1).is_empty());
        assert!(manager.tracked_allocators().is_empty());
    }

    #[test]
    fn test_lazy_registration() {
        let manager = DebugAllocatorManager::new();
        manager.initialize(DebugManagerConfig::default()).unwrap();

        manager.record(1, AllocatorKind::Stack, call(1));
        manager.record(1, AllocatorKind::Stack, call(2));
        manager.record(2, AllocatorKind::Multipool, call(3));

        assert_eq!(lines(&manager.calls(1)), vec![1, 2]);
        assert_eq!(
            manager.tracked_allocators(),
            vec![(1, AllocatorKind::Stack), (2, AllocatorKind::Multipool)]
        );

        manager.shutdown();
        assert!(manager.calls(1).is_empty());
    }

    #[test]
    fn test_ring_wraps_and_promotes() {
        let manager = DebugAllocatorManager::new();
        manager
            .initialize(DebugManagerConfig::default().with_ring_capacity(4))
            .unwrap();

        for line in 0..10 {
            manager.record(7, AllocatorKind::Arena, call(line));
        }
        assert_eq!(lines(&manager.calls(7)), vec![6, 7, 8, 9]);

        manager.register(7, AllocatorKind::Arena, true);
        for line in 10..20 {
            manager.record(7, AllocatorKind::Arena, call(line));
        }
        assert_eq!(manager.calls(7).len(), 14);

        assert!(manager.change_resizability(7, false));
        assert_eq!(lines(&manager.calls(7)), vec![16, 17, 18, 19]);
        assert!(!manager.change_resizability(8, true));
    }

    #[test]
    fn test_reused_address_is_reregistered() {
        let manager = DebugAllocatorManager::new();
        manager.initialize(DebugManagerConfig::default()).unwrap();

        manager.record(1, AllocatorKind::Stack, call(1));
        manager.record(1, AllocatorKind::Manager, call(2));
        assert_eq!(lines(&manager.calls(1)), vec![2]);
        assert_eq!(manager.tracked_allocators(), vec![(1, AllocatorKind::Manager)]);

        assert!(manager.remove_allocator(1));
        assert!(!manager.remove_allocator(1));
    }

    #[test]
    fn test_text_dump_format() {
        let manager = DebugAllocatorManager::new();
        manager.initialize(DebugManagerConfig::default()).unwrap();
        manager.record(0x20, AllocatorKind::Stack, call(42));
        manager.record(
            0x20,
            AllocatorKind::Stack,
            TrackedCall::new(TrackedOperation::Clear, DebugInfo::new("lib.rs", "reset", 50)),
        );

        let mut out = Vec::new();
        assert!(matches!(
            DebugAllocatorManager::new().write_state_to(&mut out),
            Err(AllocatorError::NotInitialized)
        ));
        manager.write_state_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let expected = "Allocator 0x20 Stack (2 calls)\n\
                        Type: Allocate\n\
                        Pointer: 0x1000\n\
                        File: lib.rs\n\
                        Function: test\n\
                        Line: 42\n\
                        Type: Clear\n\
                        Pointer: 0x0\n\
                        File: lib.rs\n\
                        Function: reset\n\
                        Line: 50\n\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_concurrent_recording() {
        use std::sync::Arc;
        use std::thread;

        let manager = Arc::new(DebugAllocatorManager::new());
        manager
            .initialize(DebugManagerConfig::default().with_default_resizable(true))
            .unwrap();

        let threads: Vec<_> = (0..4usize)
            .map(|id| {
                let manager = manager.clone();
                thread::spawn(move || {
                    for line in 0..250 {
                        manager.record(id % 2, AllocatorKind::Multipool, call(line));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("Thread panicked");
        }

        assert_eq!(manager.calls(0).len(), 500);
        assert_eq!(manager.calls(1).len(), 500);
    }
}
