//! Concurrency primitives shared by the realtime, network and control
//! threads: the prepare/commit fifo, the RCU cell, the triple buffer and the
//! reader/writer spinlock. Only the fifo (single/spsc), the triple buffer and
//! RCU read locks are allowed on realtime paths.

pub mod cell;
pub mod fifo;
pub mod fifo_buffer;
pub mod rcu;
pub mod rw_lock;
pub mod triple_buffer;

pub use cell::RoleCell;
pub use fifo::{Fifo, Lock, Position};
pub use fifo_buffer::FifoBuffer;
pub use rcu::{Rcu, ReadLock, Reader};
pub use rw_lock::{ExclusiveGuard, RwSpinlock, SharedGuard};
pub use triple_buffer::TripleBuffer;
