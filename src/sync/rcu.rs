//! Read-copy-update cell.
//!
//! Shares a value of type `T` with any number of reader threads which access
//! the most recent published value in a wait-free manner. The writer side is
//! serialized by a mutex. Old values accumulate until [`Rcu::reclaim`] is
//! called; as long as any reader lock references a value, that value and all
//! newer values survive reclamation.
//!
//! Each reading thread owns a [`Reader`]. Acquiring a [`ReadLock`] is a
//! bounded sequence of atomic operations: load the global epoch, publish it
//! (only for the outermost lock; nested locks reuse the published epoch), and
//! load the most-recent-value pointer. The published epoch is cleared when the
//! last lock of the reader is released.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct EpochValue<T> {
    epoch: u64,
    // None encodes a cleared value; the slot still occupies an epoch.
    value: Option<Box<T>>,
}

/// Per-reader registration. Epoch 0 means "no lock held".
#[derive(Debug, Default)]
struct ReaderSlot {
    epoch: AtomicU64,
}

/// The shared cell. Create one per shared value, wrap it in an [`Arc`] and
/// hand [`Reader`]s to the threads that need wait-free access.
pub struct Rcu<T> {
    values: Mutex<Vec<EpochValue<T>>>,
    readers: Mutex<Vec<Arc<ReaderSlot>>>,
    most_recent: AtomicPtr<T>,
    epoch: AtomicU64,
}

unsafe impl<T: Send + Sync> Send for Rcu<T> {}
unsafe impl<T: Send + Sync> Sync for Rcu<T> {}

impl<T> Default for Rcu<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Rcu<T> {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
            most_recent: AtomicPtr::new(ptr::null_mut()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn with_value(value: T) -> Self {
        let rcu = Self::new();
        rcu.update(value);
        rcu
    }

    /// Publishes a new value. Readers pick it up on their next outermost lock.
    pub fn update(&self, value: T) {
        self.push_value(Some(Box::new(value)));
    }

    /// Publishes "no value". Readers observe `None` from then on.
    pub fn clear(&self) {
        self.push_value(None);
    }

    fn push_value(&self, value: Option<Box<T>>) {
        let mut values = self.values.lock();
        let ptr = value
            .as_deref()
            .map_or(ptr::null_mut(), |v| v as *const T as *mut T);
        self.most_recent.store(ptr, Ordering::SeqCst);
        // A reader may take the new pointer while still publishing the prior
        // epoch; reclamation keeps one epoch of slack for exactly this case.
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        values.push(EpochValue { epoch, value });
    }

    /// Deletes values no reader can still observe and returns how many were
    /// deleted. The most recent value is never deleted. A reader that
    /// published epoch `E` may hold the value of epoch `E - 1`, so everything
    /// from `min(published epochs) - 1` onwards is kept.
    pub fn reclaim(&self) -> usize {
        let mut values = self.values.lock();

        let min_epoch = {
            let readers = self.readers.lock();
            readers
                .iter()
                .map(|slot| slot.epoch.load(Ordering::SeqCst))
                .filter(|&epoch| epoch != 0)
                .min()
        };

        let mut removed = 0;
        while values.len() > 1 {
            let epoch = values[0].epoch;
            if let Some(min) = min_epoch {
                if epoch + 1 >= min {
                    break;
                }
            }
            values.remove(0);
            removed += 1;
        }
        removed
    }

    fn unregister(&self, slot: &Arc<ReaderSlot>) {
        self.readers.lock().retain(|other| !Arc::ptr_eq(other, slot));
    }
}

/// Gives one thread wait-free access to the most recent value. Not `Sync`;
/// keep one reader per thread.
pub struct Reader<T> {
    owner: Arc<Rcu<T>>,
    slot: Arc<ReaderSlot>,
    num_locks: Cell<i64>,
}

impl<T> Reader<T> {
    /// Registers a reader with the cell. The reader must stay on the thread
    /// that uses it.
    pub fn new(owner: &Arc<Rcu<T>>) -> Self {
        let slot = Arc::new(ReaderSlot::default());
        owner.readers.lock().push(Arc::clone(&slot));
        Self {
            owner: Arc::clone(owner),
            slot,
            num_locks: Cell::new(0),
        }
    }

    /// Acquires a wait-free lock on the current value. While any lock of this
    /// reader is alive, further locks reuse the published epoch, so the
    /// observed value stays reclaim-protected for the whole scope.
    pub fn lock(&self) -> ReadLock<'_, T> {
        if self.num_locks.get() == 0 {
            let global_epoch = self.owner.epoch.load(Ordering::SeqCst);
            self.slot.epoch.store(global_epoch + 1, Ordering::SeqCst);
        }
        let value = self.owner.most_recent.load(Ordering::SeqCst);
        self.num_locks.set(self.num_locks.get() + 1);
        ReadLock { reader: self, value }
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        debug_assert_eq!(self.num_locks.get(), 0, "reader dropped with live locks");
        self.owner.unregister(&self.slot);
    }
}

/// Wait-free access to the value observed at lock time. The value cannot be
/// reclaimed while the lock is alive.
pub struct ReadLock<'a, T> {
    reader: &'a Reader<T>,
    value: *const T,
}

impl<T> ReadLock<'_, T> {
    /// The observed value, or `None` if the cell is empty or cleared.
    pub fn get(&self) -> Option<&T> {
        // Values are only deleted by reclaim, which spares everything the
        // published epoch can reference, and boxed values have stable
        // addresses.
        unsafe { self.value.as_ref() }
    }
}

impl<T> Drop for ReadLock<'_, T> {
    fn drop(&mut self) {
        let num_locks = self.reader.num_locks.get();
        debug_assert!(num_locks > 0);
        if num_locks == 1 {
            self.reader.slot.epoch.store(0, Ordering::SeqCst);
        }
        self.reader.num_locks.set(num_locks - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn default_state_is_empty() {
        let rcu = Arc::new(Rcu::<i32>::new());
        let reader = Reader::new(&rcu);
        assert!(reader.lock().get().is_none());
    }

    #[test]
    fn nested_locks_keep_the_first_value() {
        let rcu = Arc::new(Rcu::<String>::new());
        let reader = Reader::new(&rcu);

        {
            let lock = reader.lock();
            assert!(lock.get().is_none());

            rcu.update("Hello, World!".to_string());

            // The outer lock keeps observing its original value.
            let _lock2 = reader.lock();
            assert!(lock.get().is_none());
        }

        let lock3 = reader.lock();
        assert_eq!(lock3.get().map(String::as_str), Some("Hello, World!"));
    }

    #[test]
    fn clear_publishes_no_value() {
        let rcu = Arc::new(Rcu::with_value(7u32));
        let reader = Reader::new(&rcu);
        assert_eq!(reader.lock().get(), Some(&7));

        rcu.clear();
        assert_eq!(reader.lock().get(), None);
        assert_eq!(rcu.reclaim(), 1);
        assert_eq!(reader.lock().get(), None);
    }

    #[test]
    fn reclaim_never_deletes_the_most_recent_value() {
        let rcu = Arc::new(Rcu::with_value(1u32));
        assert_eq!(rcu.reclaim(), 0);
        rcu.update(2);
        assert_eq!(rcu.reclaim(), 1);
        let reader = Reader::new(&rcu);
        assert_eq!(reader.lock().get(), Some(&2));
    }

    #[test]
    fn values_survive_while_referenced() {
        let rcu = Arc::new(Rcu::with_value(0usize));
        let reader1 = Reader::new(&rcu);
        let reader2 = Reader::new(&rcu);

        let lock1 = reader1.lock();
        assert_eq!(lock1.get(), Some(&0));

        rcu.update(1);
        rcu.update(2);

        let lock2 = reader2.lock();
        assert_eq!(lock2.get(), Some(&2));

        // lock1 still references the oldest value; nothing may be reclaimed.
        assert_eq!(rcu.reclaim(), 0);
        assert_eq!(lock1.get(), Some(&0));

        drop(lock1);
        assert_eq!(rcu.reclaim(), 2);
        assert_eq!(lock2.get(), Some(&2));
    }

    // Property: while a lock is alive the referenced value is never freed, and
    // tags only move forward.
    #[test]
    fn concurrent_readers_writers_and_reclaims() {
        const VALUES_PER_WRITER: usize = 10_000;
        const NUM_WRITERS: usize = 2;
        const NUM_READERS: usize = 3;

        let rcu = Arc::new(Rcu::<(usize, String)>::new());
        let readers_done = Arc::new(AtomicUsize::new(0));

        let writers: Vec<_> = (0..NUM_WRITERS)
            .map(|_| {
                let rcu = Arc::clone(&rcu);
                let readers_done = Arc::clone(&readers_done);
                std::thread::spawn(move || {
                    while readers_done.load(Ordering::Relaxed) < NUM_READERS {
                        for i in 0..VALUES_PER_WRITER {
                            rcu.update((i, (i + 1).to_string()));
                            rcu.reclaim();
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let reclaimer = {
            let rcu = Arc::clone(&rcu);
            let readers_done = Arc::clone(&readers_done);
            std::thread::spawn(move || {
                while readers_done.load(Ordering::Relaxed) < NUM_READERS {
                    rcu.reclaim();
                    std::thread::yield_now();
                }
            })
        };

        let reader_threads: Vec<_> = (0..NUM_READERS)
            .map(|_| {
                let rcu = Arc::clone(&rcu);
                let readers_done = Arc::clone(&readers_done);
                std::thread::spawn(move || {
                    let reader = Reader::new(&rcu);
                    let mut seen = 0usize;
                    while seen < VALUES_PER_WRITER {
                        let lock = reader.lock();
                        if let Some((tag, text)) = lock.get() {
                            // The value must be intact: tag and text agree.
                            assert_eq!(*text, (tag + 1).to_string());
                            seen = seen.max(tag + 1);
                        }
                    }
                    readers_done.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        for thread in reader_threads {
            thread.join().unwrap();
        }
        for thread in writers {
            thread.join().unwrap();
        }
        reclaimer.join().unwrap();
    }
}
