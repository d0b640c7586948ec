//! Timestamp-addressed circular byte buffer.
//!
//! Addresses are RTP timestamps modulo the capacity in frames, not read/write
//! cursors: writes and reads may target any 32-bit wrapping timestamp. A
//! separate `next_ts` tracks the end of the most recent data. The buffer has
//! no notion of a start timestamp or delay, so readers with different delay
//! settings can share it; callers order stale writes via [`RingBuffer::clear_until`].

use crate::audio::PacketTime;
use crate::sync::Position;
use crate::util::Wrapping32;

/// AES67-2023 7.5: receivers should buffer at least 20 packet times or 20 ms,
/// whichever is smaller.
pub fn aes67_suggested_buffer_length_ms(packet_time: PacketTime) -> f64 {
    (packet_time.millis() * 20.0).min(20.0)
}

/// The suggested buffer length in frames at the given clock rate.
pub fn aes67_suggested_buffer_length_frames(packet_time: PacketTime, clock_rate: u32) -> u32 {
    (aes67_suggested_buffer_length_ms(packet_time) * clock_rate as f64 / 1000.0).round() as u32
}

#[derive(Debug, Default)]
pub struct RingBuffer {
    bytes_per_frame: u32,
    next_ts: Wrapping32,
    buffer: Vec<u8>,
    ground_value: u8,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizes to `capacity_frames * bytes_per_frame` bytes and grounds the
    /// contents. A resize to the current dimensions is a no-op.
    pub fn resize(&mut self, capacity_frames: u32, bytes_per_frame: u32) {
        let new_capacity = capacity_frames as usize * bytes_per_frame as usize;
        if new_capacity == self.buffer.len() && bytes_per_frame == self.bytes_per_frame {
            return;
        }
        self.bytes_per_frame = bytes_per_frame;
        self.buffer.clear();
        self.buffer.resize(new_capacity, self.ground_value);
    }

    /// Grounds the contents and rewinds `next_ts`.
    pub fn clear(&mut self) {
        self.buffer.fill(self.ground_value);
        self.next_ts = Wrapping32::default();
    }

    pub fn capacity_frames(&self) -> u32 {
        if self.bytes_per_frame == 0 {
            return 0;
        }
        (self.buffer.len() / self.bytes_per_frame as usize) as u32
    }

    /// Writes payload bytes at the frame address derived from `at_timestamp`
    /// and advances `next_ts` if the write extends past it. Stale writes are
    /// not detected here; callers enforce ordering with `clear_until`.
    ///
    /// Returns false if the payload is not a whole number of frames or larger
    /// than the buffer.
    pub fn write(&mut self, at_timestamp: u32, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        if payload.len() % self.bytes_per_frame.max(1) as usize != 0 {
            return false;
        }
        if payload.len() > self.buffer.len() {
            return false;
        }

        let position = Position::new(
            at_timestamp as usize * self.bytes_per_frame as usize % self.buffer.len().max(1),
            self.buffer.len(),
            payload.len(),
        );

        self.buffer[position.index1..position.index1 + position.size1]
            .copy_from_slice(&payload[..position.size1]);
        if position.size2 > 0 {
            self.buffer[..position.size2].copy_from_slice(&payload[position.size1..]);
        }

        let end_ts = Wrapping32::new(at_timestamp) + (payload.len() / self.bytes_per_frame as usize) as u32;
        if end_ts > self.next_ts {
            self.next_ts = end_ts;
        }

        true
    }

    /// Reads `dst.len()` bytes starting at `at_timestamp`. With `clear` set,
    /// the region read is grounded afterwards so a later stale write cannot
    /// re-surface consumed data.
    ///
    /// Returns false if `dst` is not a whole number of frames or larger than
    /// the buffer.
    pub fn read(&mut self, at_timestamp: u32, dst: &mut [u8], clear: bool) -> bool {
        if dst.is_empty() {
            return false;
        }
        if dst.len() % self.bytes_per_frame.max(1) as usize != 0 {
            return false;
        }
        if dst.len() > self.buffer.len() {
            return false;
        }

        let position = Position::new(
            at_timestamp as usize * self.bytes_per_frame as usize % self.buffer.len().max(1),
            self.buffer.len(),
            dst.len(),
        );

        dst[..position.size1].copy_from_slice(&self.buffer[position.index1..position.index1 + position.size1]);
        if clear {
            self.buffer[position.index1..position.index1 + position.size1].fill(self.ground_value);
        }
        if position.size2 > 0 {
            dst[position.size1..].copy_from_slice(&self.buffer[..position.size2]);
            if clear {
                self.buffer[..position.size2].fill(self.ground_value);
            }
        }

        true
    }

    /// Grounds the region from `next_ts` up to (excluding) `at_timestamp`,
    /// then sets `next_ts` to it. A timestamp at or behind `next_ts` is a
    /// no-op, so an older packet never erases newer data.
    pub fn clear_until(&mut self, at_timestamp: u32) -> bool {
        if self.next_ts >= Wrapping32::new(at_timestamp) {
            return false;
        }

        let frames = (Wrapping32::new(at_timestamp) - self.next_ts).value() as usize;
        let bytes = (frames * self.bytes_per_frame as usize).min(self.buffer.len());
        if bytes > 0 && !self.buffer.is_empty() {
            let position = Position::new(
                self.next_ts.value() as usize * self.bytes_per_frame as usize % self.buffer.len(),
                self.buffer.len(),
                bytes,
            );
            self.buffer[position.index1..position.index1 + position.size1].fill(self.ground_value);
            if position.size2 > 0 {
                self.buffer[..position.size2].fill(self.ground_value);
            }
        }

        self.next_ts = Wrapping32::new(at_timestamp);
        true
    }

    /// The timestamp just past the most recent data (packet start plus packet
    /// frames).
    pub fn next_ts(&self) -> Wrapping32 {
        self.next_ts
    }

    pub fn set_next_ts(&mut self, next_ts: u32) {
        self.next_ts = Wrapping32::new(next_ts);
    }

    /// Sets the byte value representing silence (0x00 for signed formats,
    /// 0x80 for unsigned 8-bit).
    pub fn set_ground_value(&mut self, ground_value: u8) {
        self.ground_value = ground_value;
    }

    pub fn ground_value(&self) -> u8 {
        self.ground_value
    }
}
