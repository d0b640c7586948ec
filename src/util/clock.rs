//! Monotonic nanosecond clock with an arbitrary starting point.

use std::time::Instant;

use lazy_static::lazy_static;

lazy_static! {
    static ref CLOCK_BASE: Instant = Instant::now();
}

/// Monotonically increasing time in nanoseconds. The epoch is arbitrary but
/// fixed for the lifetime of the process, so differences are meaningful.
pub fn monotonic_ns() -> u64 {
    CLOCK_BASE.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
