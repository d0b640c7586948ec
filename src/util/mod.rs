//! Small shared utilities: wrapping counters, ids, the monotonic clock and
//! the interval estimator.

pub mod clock;
pub mod id;
pub mod sliding_stats;
pub mod wrapping;

pub use clock::monotonic_ns;
pub use id::Id;
pub use sliding_stats::SlidingStats;
pub use wrapping::{Wrapping16, Wrapping32, Wrapping64};
