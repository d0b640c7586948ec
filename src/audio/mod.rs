//! Audio formats and sample conversion.

pub mod convert;
pub mod format;

pub use convert::{planar_f32_to_wire, wire_to_planar_f32};
pub use format::{AudioEncoding, AudioFormat, ByteOrder, ChannelOrdering, PacketTime};
