//! A reader/writer spinlock around a single 32-bit atomic.
//!
//! The atomic holds the reader count; the sentinel `0xffff_ffff` marks an
//! exclusive holder. Locking spins for a bounded number of iterations and
//! fails instead of deadlocking. Intended for very short critical sections
//! where realtime threads only ever take the shared side.

use std::sync::atomic::{AtomicU32, Ordering};

const HAS_WRITER: u32 = u32::MAX;

/// Upper bound on spin iterations before a lock attempt gives up.
pub const LOOP_UPPER_BOUND: usize = 300_000;

/// Number of attempts before the spin starts yielding the thread.
const YIELD_THRESHOLD: usize = 10;

#[derive(Debug, Default)]
pub struct RwSpinlock {
    readers: AtomicU32,
}

impl RwSpinlock {
    pub const fn new() -> Self {
        Self {
            readers: AtomicU32::new(0),
        }
    }

    /// Acquires an exclusive lock, spinning until it succeeds or the loop
    /// upper bound is reached. Returns `None` if the bound was reached.
    pub fn lock_exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        for i in 0..LOOP_UPPER_BOUND {
            let readers = self.readers.load(Ordering::Acquire);
            if readers == 0
                && self
                    .readers
                    .compare_exchange_weak(0, HAS_WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(ExclusiveGuard { lock: self });
            }
            if i >= YIELD_THRESHOLD {
                std::thread::yield_now();
            }
        }
        log::error!("rw spinlock: exclusive lock loop upper bound reached");
        None
    }

    /// Attempts to acquire an exclusive lock without spinning.
    pub fn try_lock_exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        if self
            .readers
            .compare_exchange(0, HAS_WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(ExclusiveGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquires a shared lock, spinning until it succeeds or the loop upper
    /// bound is reached. Returns `None` if the bound was reached.
    pub fn lock_shared(&self) -> Option<SharedGuard<'_>> {
        for i in 0..LOOP_UPPER_BOUND {
            let readers = self.readers.load(Ordering::Acquire);
            if readers + 2 == HAS_WRITER {
                log::error!("rw spinlock: max number of readers reached");
                return None;
            }
            if readers != HAS_WRITER
                && self
                    .readers
                    .compare_exchange_weak(readers, readers + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(SharedGuard { lock: self });
            }
            if i >= YIELD_THRESHOLD {
                std::thread::yield_now();
            }
        }
        log::error!("rw spinlock: shared lock loop upper bound reached");
        None
    }

    /// Attempts to acquire a shared lock without spinning.
    pub fn try_lock_shared(&self) -> Option<SharedGuard<'_>> {
        let readers = self.readers.load(Ordering::Acquire);
        if readers != HAS_WRITER
            && self
                .readers
                .compare_exchange(readers, readers + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            Some(SharedGuard { lock: self })
        } else {
            None
        }
    }

    /// True if an exclusive guard is currently held.
    pub fn is_locked_exclusively(&self) -> bool {
        self.readers.load(Ordering::Acquire) == HAS_WRITER
    }

    /// True if at least one shared guard is currently held.
    pub fn is_locked_shared(&self) -> bool {
        let readers = self.readers.load(Ordering::Acquire);
        readers != 0 && readers != HAS_WRITER
    }
}

/// Releases the exclusive lock on drop.
#[must_use]
pub struct ExclusiveGuard<'a> {
    lock: &'a RwSpinlock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        debug_assert!(self.lock.is_locked_exclusively());
        self.lock.readers.store(0, Ordering::Release);
    }
}

/// Releases the shared lock on drop.
#[must_use]
pub struct SharedGuard<'a> {
    lock: &'a RwSpinlock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        debug_assert!(self.lock.is_locked_shared());
        self.lock.readers.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn shared_locks_stack() {
        let lock = RwSpinlock::new();
        let a = lock.lock_shared().unwrap();
        let b = lock.lock_shared().unwrap();
        assert!(lock.is_locked_shared());
        assert!(lock.try_lock_exclusive().is_none());
        drop(a);
        assert!(lock.try_lock_exclusive().is_none());
        drop(b);
        assert!(lock.try_lock_exclusive().is_some());
    }

    #[test]
    fn exclusive_excludes_shared() {
        let lock = RwSpinlock::new();
        let guard = lock.lock_exclusive().unwrap();
        assert!(lock.is_locked_exclusively());
        assert!(lock.try_lock_shared().is_none());
        assert!(lock.try_lock_exclusive().is_none());
        drop(guard);
        assert!(lock.try_lock_shared().is_some());
    }

    // No shared-mode holder may observe the protected counter mid-update.
    #[test]
    fn exclusive_updates_are_atomic_to_readers() {
        const ITERATIONS: usize = 10_000;

        let lock = Arc::new(RwSpinlock::new());
        let even_counter = Arc::new(AtomicUsize::new(0));

        let writer = {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&even_counter);
            std::thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let guard = lock.lock_exclusive().unwrap();
                    // Temporarily odd inside the critical section.
                    counter.fetch_add(1, Ordering::Relaxed);
                    counter.fetch_add(1, Ordering::Relaxed);
                    drop(guard);
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&even_counter);
                std::thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let guard = lock.lock_shared().unwrap();
                        assert_eq!(counter.load(Ordering::Relaxed) % 2, 0);
                        drop(guard);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
