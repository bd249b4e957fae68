//! Bounded test-and-set spinlock for records in shared memory.
//!
//! The holder of a cross-process lock may be another process, and that process
//! may die inside its critical section. Acquisition therefore gives up after a
//! bounded number of attempts and reports [`Deadlock`] instead of spinning
//! forever. After a `Deadlock` the guarded record must be treated as suspect;
//! nothing here tries to repair it.

use core::fmt;
use core::ptr;

use crate::sync::{AtomicU32, Ordering, relax};

/// Default number of acquisition attempts before reporting [`Deadlock`].
pub const DEFAULT_SPIN_LIMIT: u32 = 1 << 22;

/// Attempts spent busy-spinning before falling back to yielding the thread.
const YIELD_AFTER: u32 = 128;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A spinlock occupying a single `u32` word, safe to place in shared memory.
///
/// The all-zero bit pattern is a valid unlocked lock.
#[repr(C)]
pub struct SpinLock {
    word: AtomicU32,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<SpinLock>() == 4);

/// The retry budget ran out: the holder is presumed dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlock;

impl fmt::Display for Deadlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spinlock retry limit exhausted, holder presumed dead")
    }
}

impl core::error::Error for Deadlock {}

impl SpinLock {
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    /// Reset the lock in place to the unlocked state.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes and no other party may be using the lock.
    pub unsafe fn init(this: *mut SpinLock) {
        unsafe { ptr::write(this, SpinLock::new()) };
    }

    /// Try to take the lock once.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self.word.load(Ordering::Relaxed) != UNLOCKED {
            return None;
        }
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }

    /// Take the lock, retrying up to [`DEFAULT_SPIN_LIMIT`] times.
    #[inline]
    pub fn lock(&self) -> Result<SpinGuard<'_>, Deadlock> {
        self.lock_bounded(DEFAULT_SPIN_LIMIT)
    }

    /// Take the lock, retrying up to `limit` times.
    pub fn lock_bounded(&self, limit: u32) -> Result<SpinGuard<'_>, Deadlock> {
        for attempt in 0..limit.max(1) {
            if let Some(guard) = self.try_lock() {
                return Ok(guard);
            }
            relax(attempt, YIELD_AFTER);
        }
        #[cfg(feature = "std")]
        tracing::warn!(limit, "spinlock acquisition gave up");
        Err(Deadlock)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Release the lock regardless of who holds it.
    ///
    /// # Safety
    ///
    /// Only for tooling that has established the holder is gone; the guarded
    /// data may be half-updated.
    pub unsafe fn force_unlock(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard; the lock is released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.word.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn lock_and_release() {
        let lock = SpinLock::new();
        {
            let _guard = lock.lock().unwrap();
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn held_lock_reports_deadlock() {
        let lock = SpinLock::new();
        let _held = lock.lock().unwrap();
        assert_eq!(lock.lock_bounded(1000).err(), Some(Deadlock));
    }

    #[test]
    fn zeroed_memory_is_unlocked() {
        let lock: SpinLock = unsafe { core::mem::zeroed() };
        assert!(!lock.is_locked());
    }

    #[test]
    fn force_unlock_recovers_abandoned_lock() {
        let lock = SpinLock::new();
        core::mem::forget(lock.lock().unwrap());
        assert!(lock.try_lock().is_none());
        unsafe { lock.force_unlock() };
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn mutual_exclusion_across_threads() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock.lock().unwrap();
                        // Non-atomic read-modify-write: only correct under the lock.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
