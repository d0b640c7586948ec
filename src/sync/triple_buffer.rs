//! A single-producer, single-consumer triple buffer.
//!
//! A latest-value mailbox for trivially copyable values: the producer always
//! finds a free slot to write, the consumer always reads the most recently
//! published value. Both sides are wait-free; intermediate values may be
//! skipped (last writer wins).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

/// Marks the slot stored in `next` as holding no unread value.
const EMPTY_BIT: u8 = 0b100;

/// Three-slot mailbox for `Copy` values.
///
/// `update` must only be called from a single producer thread and `get` from
/// a single consumer thread; the two may differ.
#[derive(Debug)]
pub struct TripleBuffer<T: Copy> {
    storage: [UnsafeCell<T>; 3],
    write_index: UnsafeCell<u8>,
    read_index: UnsafeCell<u8>,
    next: AtomicU8,
}

// One slot is owned by the producer, one by the consumer, and ownership of
// the third is transferred through the `next` atomic exchange.
unsafe impl<T: Copy + Send> Sync for TripleBuffer<T> {}

impl<T: Copy + Default> Default for TripleBuffer<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy> TripleBuffer<T> {
    pub fn new(initial: T) -> Self {
        Self {
            storage: [
                UnsafeCell::new(initial),
                UnsafeCell::new(initial),
                UnsafeCell::new(initial),
            ],
            write_index: UnsafeCell::new(0),
            read_index: UnsafeCell::new(1),
            next: AtomicU8::new(2 | EMPTY_BIT),
        }
    }

    /// Publishes a new value. Producer side only.
    pub fn update(&self, value: T) {
        unsafe {
            let write_index = &mut *self.write_index.get();
            *self.storage[*write_index as usize].get() = value;
            let exchanged = self.next.swap(*write_index, Ordering::AcqRel);
            *write_index = exchanged & !EMPTY_BIT;
        }
    }

    /// Takes the most recently published value, or `None` if nothing has been
    /// published since the last `get`. Consumer side only.
    pub fn get(&self) -> Option<T> {
        unsafe {
            let read_index = &mut *self.read_index.get();
            *read_index = self.next.swap(*read_index | EMPTY_BIT, Ordering::AcqRel);
            if *read_index & EMPTY_BIT != 0 {
                return None;
            }
            Some(*self.storage[*read_index as usize].get())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_until_updated() {
        let buffer = TripleBuffer::new(0);
        assert_eq!(buffer.get(), None);
        buffer.update(42);
        assert_eq!(buffer.get(), Some(42));
        assert_eq!(buffer.get(), None);
        buffer.update(43);
        buffer.update(44);
        assert_eq!(buffer.get(), Some(44), "last writer wins");
        assert_eq!(buffer.get(), None);
    }

    // Non-empty reads must come from non-decreasing update positions.
    #[test]
    fn values_never_go_backwards() {
        const ITERATIONS: i64 = 100_000;

        let buffer = std::sync::Arc::new(TripleBuffer::new(-1i64));

        let producer = {
            let buffer = std::sync::Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..ITERATIONS {
                    buffer.update(i);
                }
            })
        };

        let consumer = {
            let buffer = std::sync::Arc::clone(&buffer);
            std::thread::spawn(move || {
                let mut previous = -1i64;
                for _ in 0..ITERATIONS {
                    if let Some(value) = buffer.get() {
                        assert!(value > previous, "value {value} after {previous}");
                        previous = value;
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
