//! RTP transport: packet codec, statistics, the receive and transmit slot
//! tables and their supporting pieces.

pub mod filter;
pub mod packet;
pub mod packet_view;
pub mod receiver;
pub mod ring_buffer;
pub mod rtcp;
pub mod sender;
pub mod session;
pub mod stats;

/// The AES67 packet budget (AES67-2023 6.3). Connections with an MTU below
/// Ethernet's 1500 bytes may need a smaller payload than this.
pub const MAX_PAYLOAD: usize = 1440;

pub use filter::{Filter, FilterMode};
pub use packet::Packet;
pub use packet_view::PacketView;
pub use receiver::{AudioReceiver, ReaderParameters, SenderReportInfo, StreamInfo, StreamState};
pub use ring_buffer::RingBuffer;
pub use rtcp::{NtpTimestamp, RtcpPacketType, RtcpPacketView};
pub use sender::{AudioSender, WriterParameters, WriterStats};
pub use session::Session;
pub use stats::{Counters, PacketStats};
