//! Writer-preferring read-write lock built on [`SpinLock`].
//!
//! Writers take the inner spinlock, then wait for the reader count to
//! drain. Readers wait while a writer holds (or is acquiring) the
//! spinlock. A reader that discovers it must mutate shared structure can
//! call [`ReadWriteLock::transition_read_to_write`] instead of exiting and
//! re-entering, which would let another writer slip in unnoticed.

use std::sync::atomic::{AtomicU32, Ordering};

use super::spin::{spin_wait, SpinLock};

/// Read-write lock with an explicit read-to-write transition.
pub struct ReadWriteLock {
    writer: SpinLock,
    readers: AtomicU32,
}

impl ReadWriteLock {
    /// Create an unlocked lock.
    pub const fn new() -> Self {
        Self {
            writer: SpinLock::new(),
            readers: AtomicU32::new(0),
        }
    }

    /// Enter the read side. Must be paired with [`exit_read`](Self::exit_read).
    pub fn enter_read(&self) {
        loop {
            self.writer.wait_locked();
            self.readers.fetch_add(1, Ordering::SeqCst);
            if !self.writer.is_locked() {
                return;
            }
            // A writer got in between; back off so it can drain readers.
            self.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Leave the read side.
    pub fn exit_read(&self) {
        let previous = self.readers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "exit_read without matching enter_read");
    }

    /// Enter the write side. Must be paired with [`exit_write`](Self::exit_write).
    pub fn enter_write(&self) {
        std::mem::forget(self.writer.lock());
        spin_wait(|| self.readers.load(Ordering::SeqCst) == 0);
    }

    /// Try to enter the write side without waiting for another writer.
    ///
    /// Still waits for current readers to drain on success.
    pub fn try_enter_write(&self) -> bool {
        match self.writer.try_lock() {
            Some(guard) => {
                std::mem::forget(guard);
                spin_wait(|| self.readers.load(Ordering::SeqCst) == 0);
                true
            }
            None => false,
        }
    }

    /// Leave the write side.
    pub fn exit_write(&self) {
        // SAFETY: enter_write leaked the guard of the lock we release here.
        unsafe { self.writer.force_unlock() };
    }

    /// Turn a held read lock into a write lock.
    ///
    /// Returns `true` when no other writer ran between the read and the
    /// write section, so anything observed under the read lock is still
    /// valid. On `false` another writer went first and the caller must
    /// re-check what it read.
    pub fn transition_read_to_write(&self) -> bool {
        match self.writer.try_lock() {
            Some(guard) => {
                std::mem::forget(guard);
                self.readers.fetch_sub(1, Ordering::SeqCst);
                spin_wait(|| self.readers.load(Ordering::SeqCst) == 0);
                true
            }
            None => {
                // A pending writer is waiting for us to leave; staying in
                // the read side would deadlock it.
                self.readers.fetch_sub(1, Ordering::SeqCst);
                self.enter_write();
                false
            }
        }
    }

    /// Whether a writer holds or is acquiring the lock.
    pub fn is_write_locked(&self) -> bool {
        self.writer.is_locked()
    }

    /// Current number of readers.
    pub fn reader_count(&self) -> u32 {
        self.readers.load(Ordering::SeqCst)
    }

    /// Acquire the read side with a guard.
    pub fn read(&self) -> ReadGuard<'_> {
        self.enter_read();
        ReadGuard { lock: self }
    }

    /// Acquire the write side with a guard.
    pub fn write(&self) -> WriteGuard<'_> {
        self.enter_write();
        WriteGuard { lock: self }
    }
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Read guard for [`ReadWriteLock`].
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a ReadWriteLock,
}

impl<'a> ReadGuard<'a> {
    /// Upgrade to a write guard, see [`ReadWriteLock::transition_read_to_write`].
    pub fn upgrade(self) -> (WriteGuard<'a>, bool) {
        let lock = self.lock;
        std::mem::forget(self);
        let uninterrupted = lock.transition_read_to_write();
        (WriteGuard { lock }, uninterrupted)
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit_read();
    }
}

/// Write guard for [`ReadWriteLock`].
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a ReadWriteLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    struct Shared {
        lock: ReadWriteLock,
        value: UnsafeCell<Vec<u32>>,
    }

    unsafe impl Sync for Shared {}

    #[test]
    fn test_readers_share() {
        let lock = ReadWriteLock::new();
        let a = lock.read();
        let b = lock.read();
        assert_eq!(lock.reader_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_writer_excludes() {
        let lock = ReadWriteLock::new();
        let guard = lock.write();
        assert!(lock.is_write_locked());
        assert!(!lock.try_enter_write());
        drop(guard);
        assert!(!lock.is_write_locked());
        assert!(lock.try_enter_write());
        lock.exit_write();
    }

    #[test]
    fn test_uncontended_transition() {
        let lock = ReadWriteLock::new();
        let read = lock.read();
        let (write, uninterrupted) = read.upgrade();
        assert!(uninterrupted);
        assert_eq!(lock.reader_count(), 0);
        assert!(lock.is_write_locked());
        drop(write);
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_concurrent_transitions_keep_writes_exclusive() {
        let shared = Arc::new(Shared {
            lock: ReadWriteLock::new(),
            value: UnsafeCell::new(Vec::new()),
        });

        let threads: Vec<_> = (0..8u32)
            .map(|id| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..200u32 {
                        let read = shared.lock.read();
                        let seen = unsafe { (*shared.value.get()).len() };
                        let _ = seen;
                        let (write, _) = read.upgrade();
                        unsafe { (*shared.value.get()).push(id * 1000 + i) };
                        drop(write);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().expect("Thread panicked");
        }

        let _read = shared.lock.read();
        assert_eq!(unsafe { (*shared.value.get()).len() }, 1600);
    }
}
