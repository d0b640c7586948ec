//! The RTP audio sender.
//!
//! A bounded table of writer slots. The audio thread accumulates sample data
//! in a timestamp-indexed ring buffer; whenever a full packet time is
//! available, an RTP packet is serialized onto the writer's outgoing queue.
//! The network thread drains that queue and transmits each packet to every
//! enabled destination, one socket per redundant interface.
//!
//! Transmission is gated on PTP stability: without a locked media clock the
//! realtime send calls report failure and nothing accumulates.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::audio::{self, AudioEncoding, AudioFormat};
use crate::error::{Result, RtpError};
use crate::net::{NetworkTask, UdpSocketExt};
use crate::ptp::PtpEvent;
use crate::rtp::packet::Packet;
use crate::rtp::ring_buffer::RingBuffer;
use crate::rtp::MAX_PAYLOAD;
use crate::sync::fifo::Spsc;
use crate::sync::{FifoBuffer, RoleCell, RwSpinlock};
use crate::util::Id;

/// Capacity of the writer slot table.
pub const MAX_NUM_WRITERS: usize = 16;

/// Redundant transmit paths per writer.
pub const MAX_NUM_REDUNDANT_SESSIONS: usize = 2;

/// Depth of each writer's outgoing packet queue.
pub const BUFFER_NUM_PACKETS: usize = 20;

/// Upper bound on the frames fed per realtime call; usually an audio device
/// buffer size.
pub const MAX_NUM_FRAMES: u32 = 4096;

/// Default multicast/unicast TTL.
pub const DEFAULT_TTL: u8 = 15;

/// Encodings the audio-side converter can serialize.
pub const SUPPORTED_ENCODINGS: [AudioEncoding; 3] =
    [AudioEncoding::PcmS16, AudioEncoding::PcmS24, AudioEncoding::PcmF32];

/// Everything needed to set up a writer. A destination with an unspecified
/// address or a zero port disables that path.
#[derive(Debug, Clone)]
pub struct WriterParameters {
    pub audio_format: AudioFormat,
    pub destinations: [SocketAddrV4; MAX_NUM_REDUNDANT_SESSIONS],
    pub packet_time_frames: u32,
    pub ttl: u8,
    pub payload_type: u8,
}

impl Default for WriterParameters {
    fn default() -> Self {
        Self {
            audio_format: AudioFormat::default(),
            destinations: [SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0); MAX_NUM_REDUNDANT_SESSIONS],
            packet_time_frames: 0,
            ttl: DEFAULT_TTL,
            payload_type: 0,
        }
    }
}

fn destination_enabled(destination: &SocketAddrV4) -> bool {
    !destination.ip().is_unspecified() && destination.port() != 0
}

impl WriterParameters {
    fn validate(&self) -> Result<()> {
        if !self.audio_format.is_valid() {
            return Err(RtpError::InvalidParameters("invalid audio format"));
        }
        if self.packet_time_frames == 0 {
            return Err(RtpError::InvalidParameters("packet time must be non-zero"));
        }
        if self.ttl == 0 {
            return Err(RtpError::InvalidParameters("ttl must be non-zero"));
        }
        if !self.destinations.iter().any(destination_enabled) {
            return Err(RtpError::InvalidParameters("at least one destination must be enabled"));
        }
        let packet_bytes = 12 + self.packet_time_frames as usize * self.audio_format.bytes_per_frame() as usize;
        if packet_bytes > MAX_PAYLOAD {
            return Err(RtpError::InvalidParameters("packet time exceeds the payload budget"));
        }
        Ok(())
    }
}

/// Scheduling and transmission failure counters of one writer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub failed_to_schedule: usize,
    pub failed_to_send: usize,
}

/// A fully formed RTP packet waiting for transmission.
#[derive(Clone, Copy)]
struct FifoPacket {
    rtp_timestamp: u32,
    size_bytes: u32,
    data: [u8; MAX_PAYLOAD],
}

impl Default for FifoPacket {
    fn default() -> Self {
        Self {
            rtp_timestamp: 0,
            size_bytes: 0,
            data: [0; MAX_PAYLOAD],
        }
    }
}

/// Audio-thread-owned paketization state.
#[derive(Debug, Default)]
struct WriterAudioState {
    rtp_packet: Packet,
    /// Accumulates input samples indexed by RTP timestamp.
    ring: RingBuffer,
    /// One packet's worth of payload bytes read back from the ring.
    send_scratch: Vec<u8>,
    /// The serialized packet (header + payload).
    encode_buffer: Vec<u8>,
    /// Wire-format staging for the float input path.
    audio_scratch: Vec<u8>,
}

struct WriterState {
    // Written by control threads under the slot's exclusive lock.
    id: Option<Id>,
    audio_format: AudioFormat,
    packet_time_frames: u32,
    destinations: [SocketAddrV4; MAX_NUM_REDUNDANT_SESSIONS],
    sockets: [Option<UdpSocketExt>; MAX_NUM_REDUNDANT_SESSIONS],
    failed_to_schedule: AtomicUsize,
    failed_to_send: AtomicUsize,
    audio: RoleCell<WriterAudioState>,
    // Audio thread pushes, network thread pops.
    outgoing: FifoBuffer<FifoPacket, Spsc>,
}

impl Default for WriterState {
    fn default() -> Self {
        Self {
            id: None,
            audio_format: AudioFormat::default(),
            packet_time_frames: 0,
            destinations: [SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0); MAX_NUM_REDUNDANT_SESSIONS],
            sockets: [None, None],
            failed_to_schedule: AtomicUsize::new(0),
            failed_to_send: AtomicUsize::new(0),
            audio: RoleCell::new(WriterAudioState::default()),
            outgoing: FifoBuffer::new(),
        }
    }
}

struct WriterSlot {
    lock: RwSpinlock,
    inner: std::cell::UnsafeCell<WriterState>,
}

// Same discipline as the receiver slots: control mutates under the exclusive
// lock, the audio thread owns the RoleCell, the fifo splits its two sides.
unsafe impl Sync for WriterSlot {}

impl Default for WriterSlot {
    fn default() -> Self {
        Self {
            lock: RwSpinlock::new(),
            inner: std::cell::UnsafeCell::new(WriterState::default()),
        }
    }
}

impl WriterSlot {
    unsafe fn writer(&self) -> &WriterState {
        &*self.inner.get()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn writer_mut(&self) -> &mut WriterState {
        &mut *self.inner.get()
    }
}

/// The sender slot table. Control operations are not thread safe; call them
/// from a single control thread. The realtime send operations are thread
/// safe when issued from a single audio thread, and
/// [`AudioSender::send_outgoing_packets`] belongs to the network thread.
pub struct AudioSender {
    writers: Vec<WriterSlot>,
    ptp_stable: AtomicBool,
    last_error: Mutex<Option<io::ErrorKind>>,
}

impl Default for AudioSender {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSender {
    pub fn new() -> Self {
        Self {
            writers: (0..MAX_NUM_WRITERS).map(|_| WriterSlot::default()).collect(),
            ptp_stable: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    // ---------------------------------------------------------------- control

    /// Adds a writer. `interfaces` selects the outbound interface per path;
    /// an unspecified address uses the system default.
    pub fn add_writer(&self, id: Id, parameters: &WriterParameters, interfaces: [Ipv4Addr; MAX_NUM_REDUNDANT_SESSIONS]) -> Result<()> {
        parameters.validate()?;

        for slot in &self.writers {
            let _guard = slot.lock.lock_shared().ok_or(RtpError::LockContended)?;
            if unsafe { slot.writer() }.id == Some(id) {
                log::warn!("a writer for id {id} already exists");
                return Err(RtpError::DuplicateId);
            }
        }

        for slot in &self.writers {
            let _guard = slot.lock.lock_exclusive().ok_or(RtpError::LockContended)?;
            let writer = unsafe { slot.writer_mut() };
            if writer.id.is_some() {
                continue; // In use already.
            }
            log::trace!("adding writer {id}");
            return Self::setup_writer(writer, id, parameters, interfaces);
        }

        log::error!("no free writer slot");
        Err(RtpError::SlotTableFull)
    }

    /// Removes the writer with the given id, closing its sockets.
    pub fn remove_writer(&self, id: Id) -> Result<()> {
        for slot in &self.writers {
            if unsafe { slot.writer() }.id != Some(id) {
                continue;
            }
            let _guard = slot.lock.lock_exclusive().ok_or(RtpError::LockContended)?;
            log::trace!("removing writer {id}");
            let writer = unsafe { slot.writer_mut() };
            *writer = WriterState::default();
            return Ok(());
        }
        Err(RtpError::NotFound)
    }

    /// Re-targets every writer's sockets to new outbound interfaces.
    pub fn set_interfaces(&self, interfaces: [Ipv4Addr; MAX_NUM_REDUNDANT_SESSIONS]) -> Result<()> {
        for slot in &self.writers {
            let _guard = slot.lock.lock_exclusive().ok_or(RtpError::LockContended)?;
            let writer = unsafe { slot.writer() };
            if writer.id.is_none() {
                continue;
            }
            for (socket, interface) in writer.sockets.iter().zip(interfaces) {
                let Some(socket) = socket.as_ref() else { continue };
                if interface.is_unspecified() {
                    continue;
                }
                if let Err(e) = socket.set_multicast_outbound_interface(interface) {
                    log::error!("failed to set outbound interface: {e}");
                }
            }
        }
        Ok(())
    }

    /// Updates the TTL on both of a writer's sockets.
    pub fn set_ttl(&self, id: Id, ttl: u8) -> Result<()> {
        if ttl == 0 {
            return Err(RtpError::InvalidParameters("ttl must be non-zero"));
        }
        for slot in &self.writers {
            if unsafe { slot.writer() }.id != Some(id) {
                continue;
            }
            let _guard = slot.lock.lock_exclusive().ok_or(RtpError::LockContended)?;
            let writer = unsafe { slot.writer() };
            for socket in writer.sockets.iter().flatten() {
                socket.set_ttl_all(ttl)?;
            }
            return Ok(());
        }
        Err(RtpError::NotFound)
    }

    fn setup_writer(
        writer: &mut WriterState,
        id: Id,
        parameters: &WriterParameters,
        interfaces: [Ipv4Addr; MAX_NUM_REDUNDANT_SESSIONS],
    ) -> Result<()> {
        for i in 0..MAX_NUM_REDUNDANT_SESSIONS {
            let socket = UdpSocketExt::open_sender(None).map_err(|e| {
                log::error!("failed to open socket for sending: {e}");
                RtpError::Socket(e)
            })?;
            if !interfaces[i].is_unspecified() {
                socket.set_multicast_outbound_interface(interfaces[i]).map_err(|e| {
                    log::error!("failed to set outbound interface: {e}");
                    RtpError::Socket(e)
                })?;
            }
            socket.set_ttl_all(parameters.ttl)?;
            writer.sockets[i] = Some(socket);
        }

        let format = parameters.audio_format;
        let bytes_per_frame = format.bytes_per_frame();
        let packet_payload_bytes = parameters.packet_time_frames as usize * bytes_per_frame as usize;

        let audio = writer.audio.get_plain_mut();
        audio.rtp_packet = Packet::new(parameters.payload_type, rand::random());
        audio.ring.set_ground_value(format.ground_value());
        audio.ring.resize(MAX_NUM_FRAMES, bytes_per_frame);
        audio.ring.clear();
        audio.send_scratch.resize(packet_payload_bytes, 0);
        audio.encode_buffer = Vec::with_capacity(MAX_PAYLOAD);
        audio.audio_scratch.resize(MAX_NUM_FRAMES as usize * bytes_per_frame as usize, 0);

        writer.outgoing.resize(BUFFER_NUM_PACKETS);
        writer.audio_format = format;
        writer.packet_time_frames = parameters.packet_time_frames;
        writer.destinations = parameters.destinations;
        writer.failed_to_schedule.store(0, Ordering::Relaxed);
        writer.failed_to_send.store(0, Ordering::Relaxed);
        writer.id = Some(id);

        Ok(())
    }

    // ------------------------------------------------------------------- ptp

    /// Manually overrides the PTP gate (e.g. in setups without a PTP stack).
    pub fn set_ptp_stable(&self, stable: bool) {
        self.ptp_stable.store(stable, Ordering::Release);
    }

    pub fn ptp_stable(&self) -> bool {
        self.ptp_stable.load(Ordering::Acquire)
    }

    /// Feeds an event from the external PTP stack. Transmission is allowed
    /// only in the slave and master port states.
    pub fn handle_ptp_event(&self, event: PtpEvent) {
        match event {
            PtpEvent::PortStateChanged(state) => {
                let stable = state.is_stable();
                if stable != self.ptp_stable() {
                    log::info!("ptp gate: port state {state:?}, transmission {}", if stable { "enabled" } else { "disabled" });
                }
                self.set_ptp_stable(stable);
            }
            PtpEvent::ParentChanged(grandmaster) => {
                log::info!("ptp gate: grandmaster changed to {grandmaster}");
            }
        }
    }

    // -------------------------------------------------------- network thread

    /// Drains every writer's outgoing queue and transmits each packet to all
    /// enabled destinations. Call from the network thread.
    pub fn send_outgoing_packets(&self) {
        for slot in &self.writers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue; // Appearing or going away.
            };
            let writer = unsafe { slot.writer() };
            if writer.id.is_none() {
                continue;
            }

            let pending = writer.outgoing.size();
            for _ in 0..pending {
                let Some(packet) = writer.outgoing.pop() else {
                    break;
                };
                debug_assert!(packet.size_bytes as usize <= MAX_PAYLOAD);
                debug_assert!(packet.size_bytes > 0);

                for (socket, destination) in writer.sockets.iter().zip(writer.destinations) {
                    if !destination_enabled(&destination) {
                        continue;
                    }
                    let Some(socket) = socket.as_ref() else { continue };
                    if let Err(e) = socket.send_to(&packet.data[..packet.size_bytes as usize], destination) {
                        writer.failed_to_send.fetch_add(1, Ordering::Relaxed);
                        self.note_send_error(e);
                    }
                }
            }
        }
    }

    /// Logs a transmit error unless it repeats the previous one.
    fn note_send_error(&self, error: io::Error) {
        let Some(mut last) = self.last_error.try_lock() else {
            return;
        };
        if *last != Some(error.kind()) {
            log::error!("failed to send packet: {error}");
            *last = Some(error.kind());
        }
    }

    // ---------------------------------------------------------- audio thread

    /// Accumulates raw wire-format bytes at `timestamp` and schedules every
    /// completed packet. A timestamp that does not continue the accumulated
    /// timeline resets it (the sequence number keeps counting).
    ///
    /// Returns false when the writer is unknown, the PTP gate is closed, or
    /// the buffer does not fit the writer's framing. Realtime safe; call from
    /// a single audio thread.
    pub fn send_data_realtime(&self, id: Id, buf: &[u8], timestamp: u32) -> bool {
        if !self.ptp_stable() {
            return false;
        }

        for slot in &self.writers {
            let Some(_guard) = slot.lock.lock_shared() else {
                continue;
            };
            let writer = unsafe { slot.writer() };
            if writer.id != Some(id) {
                continue;
            }
            let audio = unsafe { writer.audio.get_mut() };
            return Self::schedule_packets(writer, audio, buf, timestamp);
        }

        false
    }

    /// Converts non-interleaved float channels to the writer's wire format,
    /// then accumulates and schedules like [`AudioSender::send_data_realtime`].
    pub fn send_audio_data_realtime(&self, id: Id, channels: &[&[f32]], timestamp: u32) -> bool {
        if !self.ptp_stable() {
            return false;
        }

        for slot in &self.writers {
            let Some(_guard) = slot.lock.lock_shared() else {
                continue;
            };
            let writer = unsafe { slot.writer() };
            if writer.id != Some(id) {
                continue;
            }

            let format = writer.audio_format;
            if format.num_channels as usize != channels.len() {
                return false;
            }
            if !SUPPORTED_ENCODINGS.contains(&format.encoding) {
                return false;
            }
            let Some(frames) = channels.iter().map(|channel| channel.len()).min() else {
                return false;
            };
            if frames == 0 || frames as u32 > MAX_NUM_FRAMES {
                return false;
            }
            let bytes = frames * format.bytes_per_frame() as usize;

            let audio = unsafe { writer.audio.get_mut() };
            if audio.audio_scratch.len() < bytes {
                return false;
            }

            let mut scratch = std::mem::take(&mut audio.audio_scratch);
            let ok = audio::planar_f32_to_wire(&format, channels, &mut scratch[..bytes])
                && Self::schedule_packets(writer, audio, &scratch[..bytes], timestamp);
            audio.audio_scratch = scratch;
            return ok;
        }

        false
    }

    /// The paketizer: writes the block into the ring, then serializes every
    /// full packet time between the packet cursor and the accumulated end.
    fn schedule_packets(writer: &WriterState, audio: &mut WriterAudioState, buf: &[u8], timestamp: u32) -> bool {
        let bytes_per_frame = writer.audio_format.bytes_per_frame();
        let packet_time_frames = writer.packet_time_frames;
        if bytes_per_frame == 0 || packet_time_frames == 0 {
            return false;
        }
        if buf.is_empty() || buf.len() % bytes_per_frame as usize != 0 {
            return false;
        }
        if (buf.len() / bytes_per_frame as usize) as u32 > MAX_NUM_FRAMES {
            return false;
        }
        let payload_bytes_per_packet = packet_time_frames as usize * bytes_per_frame as usize;

        let WriterAudioState {
            rtp_packet,
            ring,
            send_scratch,
            encode_buffer,
            ..
        } = audio;

        if ring.next_ts().value() != timestamp {
            // Discontinuity: restart the packet timeline here. Whether the
            // sequence number should also restart is an open question; it
            // keeps counting so receivers can still deduplicate.
            rtp_packet.set_timestamp(timestamp);
            ring.set_next_ts(timestamp);
        }

        ring.clear_until(timestamp);
        if !ring.write(timestamp, buf) {
            return false;
        }

        let accumulated_end = ring.next_ts();
        while rtp_packet.timestamp() + packet_time_frames <= accumulated_end {
            let packet_start = rtp_packet.timestamp().value();
            if !ring.read(packet_start, &mut send_scratch[..payload_bytes_per_packet], false) {
                return false;
            }

            encode_buffer.clear();
            rtp_packet.encode(&send_scratch[..payload_bytes_per_packet], encode_buffer);
            if encode_buffer.len() > MAX_PAYLOAD {
                return false;
            }

            let mut packet = FifoPacket {
                rtp_timestamp: packet_start,
                size_bytes: encode_buffer.len() as u32,
                ..Default::default()
            };
            packet.data[..encode_buffer.len()].copy_from_slice(encode_buffer);

            if !writer.outgoing.push(packet) {
                writer.failed_to_schedule.fetch_add(1, Ordering::Relaxed);
            }

            rtp_packet.inc_sequence_number(1);
            rtp_packet.inc_timestamp(packet_time_frames);
        }

        true
    }

    // ------------------------------------------------------------- observers

    /// Failure counters of one writer.
    pub fn writer_stats(&self, id: Id) -> Option<WriterStats> {
        for slot in &self.writers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue;
            };
            let writer = unsafe { slot.writer() };
            if writer.id != Some(id) {
                continue;
            }
            return Some(WriterStats {
                failed_to_schedule: writer.failed_to_schedule.load(Ordering::Relaxed),
                failed_to_send: writer.failed_to_send.load(Ordering::Relaxed),
            });
        }
        None
    }
}

impl NetworkTask for AudioSender {
    fn process(&self) {
        self.send_outgoing_packets();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ByteOrder, ChannelOrdering};
    use crate::ptp::PortState;
    use crate::rtp::packet_view::PacketView;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn stereo_s16() -> AudioFormat {
        AudioFormat {
            byte_order: ByteOrder::Be,
            encoding: AudioEncoding::PcmS16,
            ordering: ChannelOrdering::Interleaved,
            sample_rate: 48_000,
            num_channels: 2,
        }
    }

    fn listener() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn writer_params(destination: SocketAddrV4) -> WriterParameters {
        WriterParameters {
            audio_format: stereo_s16(),
            destinations: [destination, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)],
            packet_time_frames: 48,
            ttl: DEFAULT_TTL,
            payload_type: 98,
        }
    }

    fn recv_packet(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (len, _) = socket.recv_from(&mut buf).expect("expected a packet");
        buf[..len].to_vec()
    }

    // 24-frame blocks against a 48-frame packet time: every second block
    // completes a packet.
    #[test]
    fn accumulation_emits_full_packets() {
        let (socket, destination) = listener();
        let sender = AudioSender::new();
        sender.set_ptp_stable(true);

        let id = Id::generate();
        sender.add_writer(id, &writer_params(destination), [Ipv4Addr::UNSPECIFIED; 2]).unwrap();

        // 96 bytes = 24 frames of s16 stereo.
        let block = |seed: u8| -> Vec<u8> { (0..96).map(|i| seed.wrapping_add(i as u8)).collect() };

        assert!(sender.send_data_realtime(id, &block(0), 5000));
        assert!(sender.send_data_realtime(id, &block(1), 5024));
        assert!(sender.send_data_realtime(id, &block(2), 5048));
        assert!(sender.send_data_realtime(id, &block(3), 5072));

        sender.send_outgoing_packets();

        let first = recv_packet(&socket);
        let view = PacketView::new(&first);
        assert!(view.validate());
        assert_eq!(view.payload_type(), 98);
        assert_eq!(view.timestamp(), 5000);
        assert!(!view.marker_bit());
        let first_seq = view.sequence_number();
        let ssrc = view.ssrc();
        assert_eq!(view.payload_data().len(), 192);
        assert_eq!(&view.payload_data()[..96], &block(0)[..]);
        assert_eq!(&view.payload_data()[96..], &block(1)[..]);

        let second = recv_packet(&socket);
        let view = PacketView::new(&second);
        assert!(view.validate());
        assert_eq!(view.timestamp(), 5048);
        assert_eq!(view.sequence_number(), first_seq.wrapping_add(1));
        assert_eq!(view.ssrc(), ssrc);
        assert_eq!(&view.payload_data()[..96], &block(2)[..]);
        assert_eq!(&view.payload_data()[96..], &block(3)[..]);

        sender.remove_writer(id).unwrap();
    }

    // A timestamp jump restarts the packet timeline but not the sequence.
    #[test]
    fn timestamp_discontinuity_keeps_the_sequence() {
        let (socket, destination) = listener();
        let sender = AudioSender::new();
        sender.set_ptp_stable(true);

        let id = Id::generate();
        sender.add_writer(id, &writer_params(destination), [Ipv4Addr::UNSPECIFIED; 2]).unwrap();

        let block = vec![0u8; 192]; // one full packet per call
        assert!(sender.send_data_realtime(id, &block, 5000));
        sender.send_outgoing_packets();
        let first = recv_packet(&socket);
        let first_view = PacketView::new(&first);
        let first_seq = first_view.sequence_number();
        assert_eq!(first_view.timestamp(), 5000);

        // Jump far ahead.
        assert!(sender.send_data_realtime(id, &block, 90_000));
        sender.send_outgoing_packets();
        let second = recv_packet(&socket);
        let second_view = PacketView::new(&second);
        assert_eq!(second_view.timestamp(), 90_000);
        assert_eq!(second_view.sequence_number(), first_seq.wrapping_add(1));

        sender.remove_writer(id).unwrap();
    }

    #[test]
    fn float_input_is_converted_to_wire_format() {
        let (socket, destination) = listener();
        let sender = AudioSender::new();
        sender.set_ptp_stable(true);

        let id = Id::generate();
        sender.add_writer(id, &writer_params(destination), [Ipv4Addr::UNSPECIFIED; 2]).unwrap();

        let left = [0.5f32; 48];
        let right = [-0.5f32; 48];
        assert!(sender.send_audio_data_realtime(id, &[&left, &right], 1000));

        sender.send_outgoing_packets();
        let data = recv_packet(&socket);
        let view = PacketView::new(&data);
        assert!(view.validate());
        assert_eq!(view.timestamp(), 1000);
        let payload = view.payload_data();
        assert_eq!(payload.len(), 192);
        // First frame: L ~ 0.5, R ~ -0.5 as s16be.
        let l = i16::from_be_bytes([payload[0], payload[1]]);
        let r = i16::from_be_bytes([payload[2], payload[3]]);
        assert!((l - 16383).abs() <= 1);
        assert!((r + 16383).abs() <= 1);

        sender.remove_writer(id).unwrap();
    }

    #[test]
    fn ptp_gate_blocks_transmission() {
        let (_socket, destination) = listener();
        let sender = AudioSender::new();

        let id = Id::generate();
        sender.add_writer(id, &writer_params(destination), [Ipv4Addr::UNSPECIFIED; 2]).unwrap();

        let block = vec![0u8; 192];
        assert!(!sender.send_data_realtime(id, &block, 0), "gate starts closed");

        sender.handle_ptp_event(PtpEvent::PortStateChanged(PortState::Slave));
        assert!(sender.send_data_realtime(id, &block, 0));

        sender.handle_ptp_event(PtpEvent::PortStateChanged(PortState::Listening));
        assert!(!sender.send_data_realtime(id, &block, 48));

        sender.remove_writer(id).unwrap();
    }

    #[test]
    fn queue_overflow_counts_scheduling_failures() {
        let (_socket, destination) = listener();
        let sender = AudioSender::new();
        sender.set_ptp_stable(true);

        let id = Id::generate();
        sender.add_writer(id, &writer_params(destination), [Ipv4Addr::UNSPECIFIED; 2]).unwrap();

        // Never drained: the queue holds BUFFER_NUM_PACKETS, the rest fail.
        let block = vec![0u8; 192];
        let mut timestamp = 0u32;
        for _ in 0..BUFFER_NUM_PACKETS + 3 {
            assert!(sender.send_data_realtime(id, &block, timestamp));
            timestamp += 48;
        }

        let stats = sender.writer_stats(id).unwrap();
        assert_eq!(stats.failed_to_schedule, 3);
        assert_eq!(stats.failed_to_send, 0);

        sender.remove_writer(id).unwrap();
    }

    #[test]
    fn parameter_validation() {
        let sender = AudioSender::new();
        let id = Id::generate();

        let unreachable = WriterParameters::default();
        assert!(matches!(
            sender.add_writer(id, &unreachable, [Ipv4Addr::UNSPECIFIED; 2]),
            Err(RtpError::InvalidParameters(_))
        ));

        let mut zero_ttl = writer_params(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9));
        zero_ttl.ttl = 0;
        assert!(matches!(
            sender.add_writer(id, &zero_ttl, [Ipv4Addr::UNSPECIFIED; 2]),
            Err(RtpError::InvalidParameters(_))
        ));

        let mut oversized = writer_params(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9));
        oversized.packet_time_frames = 480; // 1920 bytes + header > 1440
        assert!(matches!(
            sender.add_writer(id, &oversized, [Ipv4Addr::UNSPECIFIED; 2]),
            Err(RtpError::InvalidParameters(_))
        ));

        assert!(matches!(sender.remove_writer(id), Err(RtpError::NotFound)));
        assert_eq!(sender.writer_stats(id), None);
    }
}
