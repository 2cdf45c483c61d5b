//! Spinlock with a parked slow path.
//!
//! The lock spins for a bounded number of iterations with `spin_loop`
//! hints, then parks the thread on the lock's address until the holder
//! releases it. This keeps uncontended paths at a single CAS while not
//! burning a core when an allocator is held for a long time.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Number of busy iterations before a waiter parks.
pub const SPIN_COUNT: u32 = 128;

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
/// Locked and at least one thread may be parked on the address.
const CONTENDED: u8 = 2;

/// A one-byte spinlock.
///
/// Unlike a plain test-and-set lock, waiters fall back to parking after
/// [`SPIN_COUNT`] iterations. [`SpinLock::wait_locked`] waits for a release
/// without acquiring, which composite allocators use to wait for a
/// concurrent pool creation to finish.
pub struct SpinLock {
    state: AtomicU8,
}

impl SpinLock {
    /// Create an unlocked spinlock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
        }
    }

    /// Acquire the lock, spinning then parking.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_> {
        if !self.acquire_fast() {
            self.lock_slow();
        }
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Try to acquire the lock without waiting.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        if self.acquire_fast() {
            Some(SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Whether the lock is currently held by someone.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Block until the lock is released, without acquiring it.
    ///
    /// Unbounded: a lock that is never released is a deadlock.
    pub fn wait_locked(&self) {
        for _ in 0..SPIN_COUNT {
            if self.state.load(Ordering::Acquire) == UNLOCKED {
                return;
            }
            std::hint::spin_loop();
        }

        loop {
            match self.state.load(Ordering::Acquire) {
                UNLOCKED => return,
                LOCKED => {
                    // Make sure the holder wakes us on release.
                    if self
                        .state
                        .compare_exchange(LOCKED, CONTENDED, Ordering::Relaxed, Ordering::Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                }
                _ => {}
            }
            self.park(CONTENDED);
        }
    }

    /// Release a lock whose guard was forgotten.
    ///
    /// # Safety
    ///
    /// The caller must logically own the lock, i.e. it acquired it and
    /// leaked the guard with `mem::forget`.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    #[inline]
    fn acquire_fast(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[cold]
    fn lock_slow(&self) {
        for _ in 0..SPIN_COUNT {
            std::hint::spin_loop();
            if self.state.load(Ordering::Relaxed) == UNLOCKED && self.acquire_fast() {
                return;
            }
        }

        // Once we went through the park path we hold the lock in the
        // contended state, so the release wakes any other sleepers.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            self.park(CONTENDED);
        }
    }

    #[inline]
    fn release(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            // SAFETY: the key is this lock's address, which stays valid
            // for as long as anyone can be parked on it.
            unsafe {
                parking_lot_core::unpark_all(self.key(), DEFAULT_UNPARK_TOKEN);
            }
        }
    }

    fn park(&self, expected: u8) {
        // SAFETY: the key is unique to this lock and the validate closure
        // only reads our own state, it does not call into parking_lot.
        unsafe {
            let _ = parking_lot_core::park(
                self.key(),
                || self.state.load(Ordering::Relaxed) == expected,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                None,
            );
        }
    }

    #[inline]
    fn key(&self) -> usize {
        &self.state as *const AtomicU8 as usize
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// RAII guard for [`SpinLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
    // Parked waiters are keyed by address, not thread, but keep the guard
    // on its thread like std's guards.
    _not_send: PhantomData<*const ()>,
}

impl Drop for SpinLockGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A value protected by a [`SpinLock`].
///
/// Allocators keep their mutable state in one of these: the
/// single-threaded path reaches the state through `get_mut` with no
/// locking at all, the thread-safe path goes through `lock`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `lock` (or by `&mut self`).
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// Wrap a value.
    pub const fn new(value: T) -> Self {
        Self {
            lock: SpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Lock and access the value.
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let guard = self.lock.lock();
        SpinMutexGuard {
            _guard: guard,
            value: self.value.get(),
            _marker: PhantomData,
        }
    }

    /// Try to lock without waiting.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.lock.try_lock().map(|guard| SpinMutexGuard {
            _guard: guard,
            value: self.value.get(),
            _marker: PhantomData,
        })
    }

    /// Unsynchronized access through exclusive ownership.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// The underlying lock.
    pub fn raw(&self) -> &SpinLock {
        &self.lock
    }

    /// Consume the mutex, returning the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Guard for [`SpinMutex`].
pub struct SpinMutexGuard<'a, T> {
    _guard: SpinLockGuard<'a>,
    value: *mut T,
    _marker: PhantomData<&'a mut T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &*self.value }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &mut *self.value }
    }
}

/// Exponential spin backoff that degrades to yielding.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    /// Create a fresh backoff.
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Wait a little longer than last time.
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// Spin (then yield) until `condition` holds.
///
/// Unbounded: there is no timeout or cancellation.
pub fn spin_wait(mut condition: impl FnMut() -> bool) {
    let mut backoff = Backoff::new();
    while !condition() {
        backoff.snooze();
    }
}
