//! The RTP audio receiver.
//!
//! A bounded table of reader slots, each merging up to two redundant RTP
//! streams into one time-indexed ring buffer. The network thread classifies
//! incoming datagrams to (reader, stream) by destination address and source
//! filter and enqueues them on the stream's packet queue; the audio thread
//! drains those queues inside its read call, reconciles redundant paths by
//! RTP timestamp and copies out the requested frame range.
//!
//! Locking: control threads hold a slot's spinlock exclusively while they
//! mutate it; the audio and network threads only ever take the shared side,
//! so they never wait on each other. Within a shared-locked slot, the
//! network thread owns the per-stream statistics state and the audio thread
//! owns the ring buffer and read cursors.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::audio::{self, AudioFormat, ByteOrder, ChannelOrdering};
use crate::error::{Result, RtpError};
use crate::net::{NetworkTask, UdpSocketExt};
use crate::rtp::filter::Filter;
use crate::rtp::packet_view::PacketView;
use crate::rtp::ring_buffer::RingBuffer;
use crate::rtp::rtcp::{NtpTimestamp, RtcpPacketType, RtcpPacketView};
use crate::rtp::session::Session;
use crate::rtp::stats::{Counters, PacketStats};
use crate::rtp::MAX_PAYLOAD;
use crate::sync::fifo::Spsc;
use crate::sync::{FifoBuffer, RoleCell, RwSpinlock, TripleBuffer};
use crate::util::{monotonic_ns, Id, SlidingStats, Wrapping32, Wrapping64};

/// Capacity of the reader slot table.
pub const MAX_NUM_READERS: usize = 16;

/// Redundant paths per reader (ST 2022-7 primary/secondary).
pub const MAX_NUM_REDUNDANT_SESSIONS: usize = 2;

/// One socket slot per port; each session uses an RTP and an RTCP port.
pub const MAX_NUM_SOCKETS: usize = MAX_NUM_READERS * MAX_NUM_REDUNDANT_SESSIONS * 2;

/// A stream with no packet for this long is reported inactive.
pub const RECEIVE_TIMEOUT_MS: u64 = 1000;

/// Receiver ring buffer length. AES67 suggests min(20 ms, 20 packet times);
/// desktop systems get considerably more headroom. This is capacity, not
/// added latency.
pub const BUFFER_SIZE_MS: u32 = 200;

/// Depth of each stream's network-to-audio packet queue.
pub const BUFFER_NUM_PACKETS: usize = 20;

/// Sliding window length for per-stream packet statistics.
pub const STATS_WINDOW_SIZE: usize = 1000;

const RECEIVE_TIMEOUT_NS: u64 = RECEIVE_TIMEOUT_MS * 1_000_000;

/// Per-stream receive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// No packet has arrived for at least the receive timeout.
    Inactive = 0,
    /// Packets are being received and consumed.
    Receiving = 1,
    /// Packets are being received but not consumed; latched by the network
    /// thread when the packet queue overflows, cleared by the audio thread.
    NoConsumer = 2,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Receiving,
            2 => Self::NoConsumer,
            _ => Self::Inactive,
        }
    }
}

/// Description of one redundant stream of a reader.
#[derive(Debug, Default, Clone)]
pub struct StreamInfo {
    pub session: Session,
    pub filter: Filter,
    pub packet_time_frames: u16,
}

impl StreamInfo {
    pub fn is_valid(&self) -> bool {
        self.session.is_valid() && self.packet_time_frames > 0
    }
}

/// Everything needed to set up a reader. Either stream may be left empty; at
/// least one must be valid.
#[derive(Debug, Default, Clone)]
pub struct ReaderParameters {
    pub audio_format: AudioFormat,
    pub streams: [StreamInfo; MAX_NUM_REDUNDANT_SESSIONS],
}

impl ReaderParameters {
    pub fn is_valid(&self) -> bool {
        self.audio_format.is_valid() && self.streams.iter().any(StreamInfo::is_valid)
    }
}

/// The latest sender-report info seen on a stream's RTCP port, for timing
/// cross-checks against the RTP timeline.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SenderReportInfo {
    pub ssrc: u32,
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// One packet copied out of the socket for the realtime side.
#[derive(Clone, Copy)]
struct PacketBuffer {
    timestamp: u32,
    seq: u16,
    data_len: u16,
    payload: [u8; MAX_PAYLOAD],
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self {
            timestamp: 0,
            seq: 0,
            data_len: 0,
            payload: [0; MAX_PAYLOAD],
        }
    }
}

/// Network-thread-owned per-stream state.
#[derive(Debug, Default)]
struct StreamNetState {
    /// RTP timestamp of the first packet seen on this stream.
    rtp_ts: Option<Wrapping32>,
    /// Arrival time of the previous packet, for the interval estimator.
    prev_packet_time_ns: Option<Wrapping64>,
    /// Monotonic time of the last packet, for the inactive watchdog.
    last_packet_monotonic_ns: u64,
    packet_stats: PacketStats,
    interval_stats: SlidingStats,
}

struct StreamContext {
    // Written by control threads under the slot's exclusive lock.
    session: Session,
    filter: Filter,
    packet_time_frames: u16,
    interface: Ipv4Addr,
    // Network thread pushes, audio thread pops.
    packets: FifoBuffer<PacketBuffer, Spsc>,
    // Audio thread pushes sequence numbers it discarded as late.
    packets_too_old: FifoBuffer<u16, Spsc>,
    net: RoleCell<StreamNetState>,
    stats_out: TripleBuffer<Counters>,
    stats_cache: Mutex<Counters>,
    sr_out: TripleBuffer<SenderReportInfo>,
    sr_cache: Mutex<Option<SenderReportInfo>>,
    state: AtomicU8,
}

impl Default for StreamContext {
    fn default() -> Self {
        Self {
            session: Session::default(),
            filter: Filter::default(),
            packet_time_frames: 0,
            interface: Ipv4Addr::UNSPECIFIED,
            packets: FifoBuffer::new(),
            packets_too_old: FifoBuffer::new(),
            net: RoleCell::new(StreamNetState::default()),
            stats_out: TripleBuffer::new(Counters::default()),
            stats_cache: Mutex::new(Counters::default()),
            sr_out: TripleBuffer::new(SenderReportInfo::default()),
            sr_cache: Mutex::new(None),
            state: AtomicU8::new(StreamState::Inactive as u8),
        }
    }
}

impl StreamContext {
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Full reset; caller holds the slot's exclusive lock.
    fn reset(&mut self) {
        self.session.reset();
        self.filter = Filter::default();
        self.packet_time_frames = 0;
        self.interface = Ipv4Addr::UNSPECIFIED;
        self.packets.reset();
        self.packets_too_old.reset();
        *self.net.get_plain_mut() = StreamNetState::default();
        self.stats_out.update(Counters::default());
        *self.stats_cache.get_mut() = Counters::default();
        *self.sr_cache.get_mut() = None;
        self.set_state(StreamState::Inactive);
    }
}

/// Audio-thread-owned per-reader state.
#[derive(Debug, Default)]
struct ReaderAudioState {
    receive_buffer: RingBuffer,
    read_scratch: Vec<u8>,
    /// Timestamp of the newest frame seen on any redundant path.
    most_recent_ts: Option<Wrapping32>,
    /// The consumer cursor.
    next_ts_to_read: Wrapping32,
}

#[derive(Default)]
struct Reader {
    id: Option<Id>,
    audio_format: AudioFormat,
    streams: [StreamContext; MAX_NUM_REDUNDANT_SESSIONS],
    audio: RoleCell<ReaderAudioState>,
}

struct ReaderSlot {
    lock: RwSpinlock,
    inner: std::cell::UnsafeCell<Reader>,
}

// Mutation discipline: control threads mutate only under the exclusive lock,
// which excludes all shared holders; the audio and network threads mutate
// only their RoleCell sections and the fifo/atomic fields.
unsafe impl Sync for ReaderSlot {}

impl Default for ReaderSlot {
    fn default() -> Self {
        Self {
            lock: RwSpinlock::new(),
            inner: std::cell::UnsafeCell::new(Reader::default()),
        }
    }
}

impl ReaderSlot {
    /// Caller holds the slot lock (shared or exclusive), or is the single
    /// control thread reading control-owned fields.
    unsafe fn reader(&self) -> &Reader {
        &*self.inner.get()
    }

    /// Caller holds the slot's exclusive lock. No other reference into the
    /// slot may be alive.
    #[allow(clippy::mut_from_ref)]
    unsafe fn reader_mut(&self) -> &mut Reader {
        &mut *self.inner.get()
    }
}

#[derive(Debug, Default)]
struct SocketState {
    socket: Option<UdpSocketExt>,
    port: u16,
}

struct SocketSlot {
    lock: RwSpinlock,
    inner: std::cell::UnsafeCell<SocketState>,
}

unsafe impl Sync for SocketSlot {}

impl Default for SocketSlot {
    fn default() -> Self {
        Self {
            lock: RwSpinlock::new(),
            inner: std::cell::UnsafeCell::new(SocketState::default()),
        }
    }
}

impl SocketSlot {
    unsafe fn state(&self) -> &SocketState {
        &*self.inner.get()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn state_mut(&self) -> &mut SocketState {
        &mut *self.inner.get()
    }
}

/// Hook for joining or leaving a multicast group. Overridable for tests.
pub type MulticastHook = Box<dyn Fn(&UdpSocketExt, Ipv4Addr, Ipv4Addr) -> bool + Send + Sync>;

/// The receiver slot table. Control operations are not thread safe; call
/// them from a single control thread. The realtime read operations are
/// thread safe when issued from a single audio thread, and
/// [`AudioReceiver::read_incoming_packets`] belongs to the network thread.
pub struct AudioReceiver {
    sockets: Vec<SocketSlot>,
    readers: Vec<ReaderSlot>,
    last_maintenance_ns: AtomicU64,
    /// Joins a multicast group on a socket. Replaceable for unit testing.
    pub join_multicast_group: MulticastHook,
    /// Leaves a multicast group on a socket. Replaceable for unit testing.
    pub leave_multicast_group: MulticastHook,
}

impl Default for AudioReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioReceiver {
    pub fn new() -> Self {
        Self {
            sockets: (0..MAX_NUM_SOCKETS).map(|_| SocketSlot::default()).collect(),
            readers: (0..MAX_NUM_READERS).map(|_| ReaderSlot::default()).collect(),
            last_maintenance_ns: AtomicU64::new(0),
            join_multicast_group: Box::new(|socket, group, interface| {
                match socket.join_multicast(group, interface) {
                    Ok(()) => {
                        log::trace!("joined multicast group {group}:{} on {interface}", socket.local_port());
                        true
                    }
                    Err(e) => {
                        log::error!("failed to join multicast group {group} on {interface}: {e}");
                        false
                    }
                }
            }),
            leave_multicast_group: Box::new(|socket, group, interface| {
                match socket.leave_multicast(group, interface) {
                    Ok(()) => {
                        log::trace!("left multicast group {group}:{} on {interface}", socket.local_port());
                        true
                    }
                    Err(e) => {
                        log::error!("failed to leave multicast group {group} on {interface}: {e}");
                        false
                    }
                }
            }),
        }
    }

    // ---------------------------------------------------------------- control

    /// Adds a reader. `interfaces` selects the interface each stream receives
    /// multicast on; an unspecified address skips the group join.
    pub fn add_reader(&self, id: Id, parameters: &ReaderParameters, interfaces: [Ipv4Addr; MAX_NUM_REDUNDANT_SESSIONS]) -> Result<()> {
        if !parameters.is_valid() {
            return Err(RtpError::InvalidParameters(
                "reader needs a valid audio format and at least one valid stream",
            ));
        }

        for slot in &self.readers {
            let _guard = slot.lock.lock_shared().ok_or(RtpError::LockContended)?;
            if unsafe { slot.reader() }.id == Some(id) {
                log::warn!("a reader for id {id} already exists");
                return Err(RtpError::DuplicateId);
            }
        }

        for slot in &self.readers {
            let guard = slot.lock.lock_exclusive().ok_or(RtpError::LockContended)?;

            if unsafe { slot.reader() }.id.is_some() {
                continue; // In use already.
            }

            let result = self.setup_reader(slot, id, parameters, interfaces);
            drop(guard);
            if result.is_err() {
                // Leave no half-configured slot behind.
                let _ = self.remove_reader(id);
            }
            return result;
        }

        log::error!("no free reader slot");
        Err(RtpError::SlotTableFull)
    }

    /// Removes the reader with the given id, leaving multicast groups and
    /// closing sockets that fall out of use.
    pub fn remove_reader(&self, id: Id) -> Result<()> {
        for slot in &self.readers {
            if unsafe { slot.reader() }.id != Some(id) {
                continue;
            }

            let guard = slot.lock.lock_exclusive().ok_or(RtpError::LockContended)?;

            for i in 0..MAX_NUM_REDUNDANT_SESSIONS {
                let (session, interface) = {
                    let reader = unsafe { slot.reader() };
                    (reader.streams[i].session, reader.streams[i].interface)
                };
                if session.is_valid()
                    && session.connection_address.is_multicast()
                    && !interface.is_unspecified()
                {
                    self.leave_group_if_last(session, interface);
                }
            }

            {
                let reader = unsafe { slot.reader_mut() };
                reader.id = None;
                reader.audio_format = AudioFormat::default();
                for stream in reader.streams.iter_mut() {
                    stream.reset();
                }
                let audio = reader.audio.get_plain_mut();
                audio.receive_buffer.clear();
                audio.read_scratch.clear();
                audio.most_recent_ts = None;
                audio.next_ts_to_read = Wrapping32::default();
            }

            drop(guard);
            self.close_unused_sockets();
            return Ok(());
        }

        Err(RtpError::NotFound)
    }

    /// Re-targets every reader's streams to new interfaces, leaving and
    /// joining multicast groups where membership changes.
    pub fn set_interfaces(&self, interfaces: [Ipv4Addr; MAX_NUM_REDUNDANT_SESSIONS]) -> Result<()> {
        for slot in &self.readers {
            let guard = slot.lock.lock_exclusive().ok_or(RtpError::LockContended)?;

            for i in 0..MAX_NUM_REDUNDANT_SESSIONS {
                let (session, old_interface) = {
                    let reader = unsafe { slot.reader() };
                    (reader.streams[i].session, reader.streams[i].interface)
                };

                if old_interface == interfaces[i] {
                    continue;
                }

                let multicast = session.is_valid() && session.connection_address.is_multicast();

                if multicast && !old_interface.is_unspecified() {
                    self.leave_group_if_last(session, old_interface);
                }

                unsafe { slot.reader_mut() }.streams[i].interface = Ipv4Addr::UNSPECIFIED;

                if multicast && !interfaces[i].is_unspecified() {
                    if self.count_multicast_users(session.connection_address, interfaces[i], session.rtp_port) == 0 {
                        self.join_group_on_session_sockets(session, interfaces[i]);
                    }
                }

                unsafe { slot.reader_mut() }.streams[i].interface = interfaces[i];
            }

            drop(guard);
        }

        self.close_unused_sockets();
        Ok(())
    }

    fn setup_reader(
        &self,
        slot: &ReaderSlot,
        id: Id,
        parameters: &ReaderParameters,
        interfaces: [Ipv4Addr; MAX_NUM_REDUNDANT_SESSIONS],
    ) -> Result<()> {
        let format = parameters.audio_format;
        let bytes_per_frame = format.bytes_per_frame();
        debug_assert!(bytes_per_frame > 0);

        {
            let reader = unsafe { slot.reader_mut() };
            reader.id = Some(id);
            reader.audio_format = format;

            for i in 0..MAX_NUM_REDUNDANT_SESSIONS {
                let stream = &mut reader.streams[i];
                stream.reset();
                stream.session = parameters.streams[i].session;
                stream.filter = parameters.streams[i].filter.clone();
                stream.packet_time_frames = parameters.streams[i].packet_time_frames;
                stream.interface = interfaces[i];
                if parameters.streams[i].is_valid() {
                    stream.packets.resize(BUFFER_NUM_PACKETS);
                    stream.packets_too_old.resize(BUFFER_NUM_PACKETS);
                    let net = stream.net.get_plain_mut();
                    net.packet_stats.reset(Some(STATS_WINDOW_SIZE));
                }
            }

            let buffer_frames = (format.sample_rate * BUFFER_SIZE_MS / 1000).max(1024);
            let audio = reader.audio.get_plain_mut();
            audio.receive_buffer.set_ground_value(format.ground_value());
            audio.receive_buffer.resize(buffer_frames, bytes_per_frame);
            audio.receive_buffer.clear();
            audio
                .read_scratch
                .resize(buffer_frames as usize * bytes_per_frame as usize, 0);
            audio.most_recent_ts = None;
            audio.next_ts_to_read = Wrapping32::default();
        }

        for i in 0..MAX_NUM_REDUNDANT_SESSIONS {
            let (stream_valid, session, interface) = {
                let reader = unsafe { slot.reader() };
                (
                    parameters.streams[i].is_valid(),
                    reader.streams[i].session,
                    reader.streams[i].interface,
                )
            };
            if !stream_valid {
                continue;
            }

            self.find_or_create_socket(session.rtp_port)?;
            self.find_or_create_socket(session.rtcp_port)?;

            if session.connection_address.is_multicast() && !interface.is_unspecified() {
                // 1 because the stream being set up counts itself.
                if self.count_multicast_users(session.connection_address, interface, session.rtp_port) == 1 {
                    self.join_group_on_session_sockets(session, interface);
                }
            }
        }

        log::trace!("added reader {id}");
        Ok(())
    }

    // -------------------------------------------------------------- sockets

    fn find_socket(&self, port: u16) -> Option<&SocketSlot> {
        self.sockets.iter().find(|slot| {
            let state = unsafe { slot.state() };
            state.socket.is_some() && state.port == port
        })
    }

    fn find_or_create_socket(&self, port: u16) -> Result<()> {
        debug_assert!(port > 0);

        if self.find_socket(port).is_some() {
            return Ok(());
        }

        for slot in &self.sockets {
            let _guard = slot.lock.lock_exclusive().ok_or(RtpError::LockContended)?;
            let state = unsafe { slot.state_mut() };
            if state.socket.is_some() {
                continue; // Slot in use, try the next one.
            }
            let socket = UdpSocketExt::bind_receiver(port).map_err(|e| {
                log::error!("failed to open receive socket for port {port}: {e}");
                RtpError::Socket(e)
            })?;
            state.socket = Some(socket);
            state.port = port;
            log::trace!("opened socket for port {port}");
            return Ok(());
        }

        log::error!("out of socket slots");
        Err(RtpError::SlotTableFull)
    }

    fn close_unused_sockets(&self) {
        for slot in &self.sockets {
            let port = {
                let state = unsafe { slot.state() };
                if state.socket.is_none() {
                    continue;
                }
                state.port
            };
            if self.count_port_users(port) == 0 {
                let Some(_guard) = slot.lock.lock_exclusive() else {
                    log::error!("failed to lock socket slot, cannot close");
                    continue;
                };
                let state = unsafe { slot.state_mut() };
                state.socket = None;
                state.port = 0;
                log::trace!("closed socket for port {port}");
            }
        }
    }

    /// Number of configured streams using `port` for RTP or RTCP.
    fn count_port_users(&self, port: u16) -> usize {
        debug_assert!(port > 0);
        let mut count = 0;
        for slot in &self.readers {
            let reader = unsafe { slot.reader() };
            for stream in &reader.streams {
                if stream.session.rtp_port == port || stream.session.rtcp_port == port {
                    count += 1;
                }
            }
        }
        count
    }

    /// Number of configured streams subscribed to (group, interface, port).
    fn count_multicast_users(&self, group: Ipv4Addr, interface: Ipv4Addr, rtp_port: u16) -> usize {
        let mut count = 0;
        for slot in &self.readers {
            let reader = unsafe { slot.reader() };
            for stream in &reader.streams {
                if stream.interface == interface
                    && stream.session.connection_address == group
                    && stream.session.rtp_port == rtp_port
                {
                    count += 1;
                }
            }
        }
        count
    }

    fn join_group_on_session_sockets(&self, session: Session, interface: Ipv4Addr) {
        for port in [session.rtp_port, session.rtcp_port] {
            if let Some(slot) = self.find_socket(port) {
                let state = unsafe { slot.state() };
                if let Some(socket) = state.socket.as_ref() {
                    if !(self.join_multicast_group)(socket, session.connection_address, interface) {
                        log::error!("failed to join multicast group");
                    }
                }
            }
        }
    }

    /// Leaves the group if this session's stream is its last user.
    fn leave_group_if_last(&self, session: Session, interface: Ipv4Addr) {
        if self.count_multicast_users(session.connection_address, interface, session.rtp_port) != 1 {
            return;
        }
        for port in [session.rtp_port, session.rtcp_port] {
            if let Some(slot) = self.find_socket(port) {
                let state = unsafe { slot.state() };
                if let Some(socket) = state.socket.as_ref() {
                    if !(self.leave_multicast_group)(socket, session.connection_address, interface) {
                        log::error!(
                            "failed to leave multicast group {}:{} on {}",
                            session.connection_address,
                            port,
                            interface
                        );
                    }
                }
            }
        }
    }

    // -------------------------------------------------------- network thread

    /// Polls every socket once and classifies what arrived. Call from a
    /// single high-priority thread at intervals well below the packet time.
    pub fn read_incoming_packets(&self) {
        let now = monotonic_ns();
        let mut buf = [0u8; 2048];

        for slot in &self.sockets {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue; // Exclusively locked: appearing or going away.
            };
            let state = unsafe { slot.state() };
            let Some(socket) = state.socket.as_ref() else {
                continue;
            };

            match socket.recv_extended(&mut buf) {
                Ok(info) => {
                    if info.len == 0 {
                        continue;
                    }
                    self.dispatch_datagram(&buf[..info.len], info.src, info.dst, info.recv_time_ns, now);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    log::error!("failed to receive from socket: {e}");
                    continue;
                }
            }
        }

        // Mark streams inactive even when no packet arrives at all.
        if self.last_maintenance_ns.load(Ordering::Relaxed) + RECEIVE_TIMEOUT_NS < now {
            for slot in &self.readers {
                let Some(_guard) = slot.lock.try_lock_shared() else {
                    continue;
                };
                let reader = unsafe { slot.reader() };
                if reader.id.is_none() {
                    continue;
                }
                for stream in &reader.streams {
                    Self::update_stream_watchdog(stream, now);
                }
            }
            self.last_maintenance_ns.store(now, Ordering::Relaxed);
        }
    }

    fn dispatch_datagram(&self, data: &[u8], src: SocketAddrV4, dst: SocketAddrV4, recv_time_ns: u64, now: u64) {
        let rtp = PacketView::new(data);
        if rtp.validate() {
            let payload = rtp.payload_data();
            if payload.is_empty() {
                log::warn!("received packet with empty payload");
            } else if payload.len() > MAX_PAYLOAD {
                log::warn!("payload size exceeds maximum size");
            } else {
                self.dispatch_rtp(&rtp, src, dst, recv_time_ns, now);
            }
        }

        let rtcp = RtcpPacketView::new(data);
        if rtcp.validate() {
            self.dispatch_rtcp(&rtcp, src, dst);
        }
    }

    fn dispatch_rtp(&self, view: &PacketView<'_>, src: SocketAddrV4, dst: SocketAddrV4, recv_time_ns: u64, now: u64) {
        let payload = view.payload_data();

        for slot in &self.readers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue; // Being added or removed.
            };
            let reader = unsafe { slot.reader() };
            if reader.id.is_none() {
                continue;
            }

            for stream in &reader.streams {
                Self::update_stream_watchdog(stream, now);

                if stream.session.connection_address != *dst.ip() {
                    continue;
                }
                if stream.session.rtp_port != dst.port() {
                    continue;
                }
                if !stream.filter.is_valid_source(*dst.ip(), *src.ip()) {
                    continue;
                }

                // Only this (network) thread touches the stream's net state.
                let net = unsafe { stream.net.get_mut() };

                if net.rtp_ts.is_none() {
                    net.rtp_ts = Some(Wrapping32::new(view.timestamp()));
                    net.prev_packet_time_ns = Some(Wrapping64::new(recv_time_ns));
                }
                net.last_packet_monotonic_ns = now;

                if stream.state() != StreamState::NoConsumer {
                    let mut packet = PacketBuffer {
                        timestamp: view.timestamp(),
                        seq: view.sequence_number(),
                        data_len: payload.len() as u16,
                        ..Default::default()
                    };
                    packet.payload[..payload.len()].copy_from_slice(payload);

                    if stream.packets.push(packet) {
                        stream.set_state(StreamState::Receiving);
                    } else {
                        stream.set_state(StreamState::NoConsumer);
                    }
                }

                while let Some(seq) = stream.packets_too_old.pop() {
                    net.packet_stats.mark_packet_too_late(seq);
                }

                if let Some(prev) = net.prev_packet_time_ns.as_mut() {
                    if let Some(interval_ns) = prev.advance_to(recv_time_ns) {
                        if net.interval_stats.initialized || interval_ns != 0 {
                            net.interval_stats.update(interval_ns as f64 / 1e9);
                        }
                    }
                }

                net.packet_stats.update(view.sequence_number());
                let mut counters = net.packet_stats.combined_counts();
                counters.jitter = net.interval_stats.max_deviation;
                stream.stats_out.update(counters);
            }
        }
    }

    fn dispatch_rtcp(&self, first: &RtcpPacketView<'_>, src: SocketAddrV4, dst: SocketAddrV4) {
        for slot in &self.readers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue;
            };
            let reader = unsafe { slot.reader() };
            if reader.id.is_none() {
                continue;
            }

            for stream in &reader.streams {
                if stream.session.connection_address != *dst.ip() {
                    continue;
                }
                if stream.session.rtcp_port != dst.port() {
                    continue;
                }
                if !stream.filter.is_valid_source(*dst.ip(), *src.ip()) {
                    continue;
                }

                // Walk the compound packet; only sender reports are latched.
                let mut packet = *first;
                while packet.validate() {
                    if packet.packet_type() == RtcpPacketType::SenderReport {
                        stream.sr_out.update(SenderReportInfo {
                            ssrc: packet.ssrc(),
                            ntp_timestamp: packet.ntp_timestamp(),
                            rtp_timestamp: packet.rtp_timestamp(),
                            packet_count: packet.packet_count(),
                            octet_count: packet.octet_count(),
                        });
                    }
                    packet = packet.next_packet();
                }
            }
        }
    }

    fn update_stream_watchdog(stream: &StreamContext, now: u64) {
        if stream.state() != StreamState::Receiving {
            return; // Never clobber the no-consumer latch.
        }
        let last = unsafe { stream.net.get_mut() }.last_packet_monotonic_ns;
        if last + RECEIVE_TIMEOUT_NS < now {
            stream.set_state(StreamState::Inactive);
        }
    }

    // ---------------------------------------------------------- audio thread

    /// Reads raw frames (on-wire byte order) at the consumer cursor, or at
    /// `at_timestamp` when given. With `require_delay` the read only succeeds
    /// once the requested range lies `require_delay` frames behind the newest
    /// received data; use this when the RTP timeline is the only clock.
    ///
    /// Returns the timestamp the data was read at, or `None` when no data is
    /// available yet. Realtime safe; call from a single audio thread.
    pub fn read_data_realtime(
        &self,
        id: Id,
        buf: &mut [u8],
        at_timestamp: Option<u32>,
        require_delay: Option<u32>,
    ) -> Option<u32> {
        for slot in &self.readers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue;
            };
            let reader = unsafe { slot.reader() };
            if reader.id != Some(id) {
                continue;
            }
            let audio = unsafe { reader.audio.get_mut() };
            return Self::read_from_reader(reader, audio, buf, at_timestamp, require_delay);
        }
        None
    }

    /// Like [`AudioReceiver::read_data_realtime`] but converts into
    /// non-interleaved float channels. The reader's wire format must be
    /// big-endian interleaved with a matching channel count.
    pub fn read_audio_data_realtime(
        &self,
        id: Id,
        channels: &mut [&mut [f32]],
        at_timestamp: Option<u32>,
        require_delay: Option<u32>,
    ) -> Option<u32> {
        for slot in &self.readers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue;
            };
            let reader = unsafe { slot.reader() };
            if reader.id != Some(id) {
                continue;
            }

            let format = reader.audio_format;
            if format.byte_order != ByteOrder::Be {
                return None;
            }
            if format.ordering != ChannelOrdering::Interleaved {
                return None;
            }
            if format.num_channels as usize != channels.len() {
                // Channel mapping/mixing is not implemented.
                return None;
            }
            let frames = channels.iter().map(|channel| channel.len()).min()?;
            let bytes = frames * format.bytes_per_frame() as usize;
            if frames == 0 {
                return None;
            }

            let audio = unsafe { reader.audio.get_mut() };
            if audio.read_scratch.len() < bytes {
                return None;
            }

            // Move the scratch buffer out so the reader state can be borrowed
            // again by the raw read.
            let mut scratch = std::mem::take(&mut audio.read_scratch);
            let read_at = Self::read_from_reader(reader, audio, &mut scratch[..bytes], at_timestamp, require_delay);
            let converted = match read_at {
                Some(_) => audio::wire_to_planar_f32(&format, &scratch[..bytes], channels),
                None => false,
            };
            audio.read_scratch = scratch;

            return if converted { read_at } else { None };
        }
        None
    }

    fn read_from_reader(
        reader: &Reader,
        audio: &mut ReaderAudioState,
        buf: &mut [u8],
        at_timestamp: Option<u32>,
        require_delay: Option<u32>,
    ) -> Option<u32> {
        // Apply the explicit timestamp first so the drain classifies stale
        // packets against the new baseline.
        if let Some(timestamp) = at_timestamp {
            audio.next_ts_to_read = Wrapping32::new(timestamp);
        }

        Self::drain_streams(reader, audio);

        let most_recent = audio.most_recent_ts?;

        let bytes_per_frame = reader.audio_format.bytes_per_frame();
        if bytes_per_frame == 0 {
            return None;
        }
        let num_frames = (buf.len() / bytes_per_frame as usize) as u32;
        if num_frames == 0 {
            return None;
        }

        if let Some(delay) = require_delay {
            if audio.next_ts_to_read + (num_frames - 1) + delay > most_recent {
                return None;
            }
        }

        let read_at = audio.next_ts_to_read.value();
        // clear=true so a late redundant packet cannot re-surface consumed
        // data.
        if !audio.receive_buffer.read(read_at, buf, true) {
            return None;
        }

        audio.next_ts_to_read += num_frames;
        Some(read_at)
    }

    /// The jitter/redundancy engine: moves packets from the stream queues
    /// into the ring buffer, ordered by RTP timestamp.
    fn drain_streams(reader: &Reader, audio: &mut ReaderAudioState) {
        let bytes_per_frame = reader.audio_format.bytes_per_frame();
        if bytes_per_frame == 0 {
            return;
        }

        for stream in &reader.streams {
            if stream.state() == StreamState::NoConsumer {
                // The queue overflowed while nobody consumed. Drop it all and
                // restart from whatever arrives next.
                stream.packets.pop_all();
                audio.most_recent_ts = None;
                stream.set_state(StreamState::Inactive);
                continue;
            }

            let pending = stream.packets.size();
            for _ in 0..pending {
                let Some(packet) = stream.packets.pop() else {
                    break;
                };

                let num_frames = packet.data_len as u32 / bytes_per_frame;
                if num_frames == 0 {
                    continue;
                }

                let packet_ts = Wrapping32::new(packet.timestamp);
                let packet_last_ts = packet_ts + (num_frames - 1);

                if audio.most_recent_ts.is_none() {
                    // First packet after (re)start: baseline everything here.
                    audio.most_recent_ts = Some(packet_last_ts);
                    audio.receive_buffer.set_next_ts(packet.timestamp);
                    audio.next_ts_to_read = packet_ts;
                }

                if packet_last_ts > audio.most_recent_ts.expect("set above") {
                    audio.most_recent_ts = Some(packet_last_ts);
                }

                // Entirely behind the consumer cursor: report and skip.
                if packet_last_ts < audio.next_ts_to_read {
                    let _ = stream.packets_too_old.push(packet.seq);
                    continue;
                }

                // Partially behind: report, but the tail still matters.
                if packet_ts < audio.next_ts_to_read {
                    let _ = stream.packets_too_old.push(packet.seq);
                }

                // Ground the gap between the newest data and this packet so a
                // redundant path's stale bytes cannot shine through.
                audio.receive_buffer.clear_until(packet.timestamp);
                audio
                    .receive_buffer
                    .write(packet.timestamp, &packet.payload[..packet.data_len as usize]);
            }
        }
    }

    // ------------------------------------------------------------- observers

    /// The published statistics snapshot for one stream of a reader:
    /// cumulative totals plus the live window, with the jitter estimate.
    pub fn packet_stats(&self, id: Id, stream_index: usize) -> Option<Counters> {
        if stream_index >= MAX_NUM_REDUNDANT_SESSIONS {
            return None;
        }
        for slot in &self.readers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue;
            };
            let reader = unsafe { slot.reader() };
            if reader.id != Some(id) {
                continue;
            }
            let stream = &reader.streams[stream_index];
            let mut cache = stream.stats_cache.lock();
            if let Some(snapshot) = stream.stats_out.get() {
                *cache = snapshot;
            }
            return Some(*cache);
        }
        None
    }

    /// The most recent RTCP sender report seen on a stream, if any.
    pub fn sender_report(&self, id: Id, stream_index: usize) -> Option<SenderReportInfo> {
        if stream_index >= MAX_NUM_REDUNDANT_SESSIONS {
            return None;
        }
        for slot in &self.readers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue;
            };
            let reader = unsafe { slot.reader() };
            if reader.id != Some(id) {
                continue;
            }
            let stream = &reader.streams[stream_index];
            let mut cache = stream.sr_cache.lock();
            if let Some(report) = stream.sr_out.get() {
                *cache = Some(report);
            }
            return *cache;
        }
        None
    }

    /// The state machine value for one stream of a reader.
    pub fn stream_state(&self, id: Id, stream_index: usize) -> Option<StreamState> {
        if stream_index >= MAX_NUM_REDUNDANT_SESSIONS {
            return None;
        }
        for slot in &self.readers {
            let Some(_guard) = slot.lock.try_lock_shared() else {
                continue;
            };
            let reader = unsafe { slot.reader() };
            if reader.id != Some(id) {
                continue;
            }
            return Some(reader.streams[stream_index].state());
        }
        None
    }
}

impl NetworkTask for AudioReceiver {
    fn process(&self) {
        self.read_incoming_packets();
    }
}
