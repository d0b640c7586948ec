//! Socket plumbing and the network thread.

pub mod runtime;
pub mod socket;

pub use runtime::{NetworkRuntime, NetworkTask, DEFAULT_TICK_INTERVAL};
pub use socket::{RecvInfo, UdpSocketExt};
