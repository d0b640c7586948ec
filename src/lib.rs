//! RAVENNA/AES67 RTP audio endpoint library.
//!
//! Receives and transmits uncompressed PCM audio carried in RTP, with
//! optional redundant primary/secondary network paths (SMPTE ST 2022-7) and
//! a PTP-gated sender. Receivers reconstruct a gap-free, time-indexed audio
//! buffer from out-of-order, duplicated or lost packets arriving on up to two
//! interfaces; senders paketize a sample timeline at a fixed packet cadence.
//!
//! Three thread roles share the slot tables: the audio thread calls the
//! `*_realtime` operations and never blocks, a single network thread polls
//! sockets and drains outgoing queues (see [`net::NetworkRuntime`]), and
//! control threads add and remove readers and writers. Discovery, RTSP/SDP,
//! the PTP stack and file I/O live outside this crate; the types in
//! [`ptp`] and the parameter structs are the seams they plug into.
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//! use ravenna_rtp::audio::{AudioEncoding, AudioFormat, ByteOrder, ChannelOrdering};
//! use ravenna_rtp::net::NetworkRuntime;
//! use ravenna_rtp::rtp::{AudioReceiver, Filter, ReaderParameters, Session, StreamInfo};
//! use ravenna_rtp::util::Id;
//!
//! let receiver = Arc::new(AudioReceiver::new());
//! let runtime = NetworkRuntime::new();
//! runtime.add_task(receiver.clone());
//!
//! let group = Ipv4Addr::new(239, 1, 15, 52);
//! let params = ReaderParameters {
//!     audio_format: AudioFormat {
//!         byte_order: ByteOrder::Be,
//!         encoding: AudioEncoding::PcmS24,
//!         ordering: ChannelOrdering::Interleaved,
//!         sample_rate: 48_000,
//!         num_channels: 2,
//!     },
//!     streams: [
//!         StreamInfo {
//!             session: Session::new(group, 5004),
//!             filter: Filter::new(group),
//!             packet_time_frames: 48,
//!         },
//!         StreamInfo::default(),
//!     ],
//! };
//!
//! let id = Id::generate();
//! receiver.add_reader(id, &params, [Ipv4Addr::UNSPECIFIED; 2]).unwrap();
//!
//! // Audio thread: read 48 frames at a time, raw wire format.
//! let mut buf = [0u8; 48 * 6];
//! let _timestamp = receiver.read_data_realtime(id, &mut buf, None, Some(480));
//! ```

pub mod audio;
pub mod error;
pub mod net;
pub mod ptp;
pub mod rtp;
pub mod sync;
pub mod util;

pub use error::{Result, RtpError};
pub use rtp::{AudioReceiver, AudioSender};
pub use util::Id;
