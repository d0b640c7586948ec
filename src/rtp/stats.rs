//! Sliding-window RTP packet statistics.
//!
//! Tracks the last `window_size` sequence numbers. Slots that leave the
//! window fold their counts into cumulative totals; the live window can be
//! inspected separately so holes that have not yet been evicted are visible.

use std::collections::VecDeque;

use crate::util::Wrapping16;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest permitted window: one full sequence-number period.
pub const MAX_WINDOW_SIZE: usize = u16::MAX as usize;

/// Packet counters. `dropped`, `duplicates`, `out_of_order` and `too_late`
/// follow the definitions of the statistics window; `too_old` counts updates
/// that fell behind the window entirely. `jitter` (seconds) is appended by
/// the publisher from the interarrival estimator and does not participate in
/// equality.
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Counters {
    pub out_of_order: u32,
    pub duplicates: u32,
    pub dropped: u32,
    pub too_late: u32,
    pub too_old: u32,
    pub jitter: f64,
}

impl PartialEq for Counters {
    fn eq(&self, other: &Self) -> bool {
        (self.out_of_order, self.duplicates, self.dropped, self.too_late, self.too_old)
            == (other.out_of_order, other.duplicates, other.dropped, other.too_late, other.too_old)
    }
}

impl std::ops::Add for Counters {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            out_of_order: self.out_of_order + rhs.out_of_order,
            duplicates: self.duplicates + rhs.duplicates,
            dropped: self.dropped + rhs.dropped,
            too_late: self.too_late + rhs.too_late,
            too_old: self.too_old + rhs.too_old,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    times_received: u16,
    times_out_of_order: u16,
    times_too_late: u16,
}

/// Statistics over a sliding window of sequence numbers.
#[derive(Debug)]
pub struct PacketStats {
    window_size: usize,
    window: VecDeque<Slot>,
    most_recent: Option<Wrapping16>,
    totals: Counters,
}

impl Default for PacketStats {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl PacketStats {
    /// Creates statistics with the given window size (capped at
    /// [`MAX_WINDOW_SIZE`], the sequence-number period).
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.min(MAX_WINDOW_SIZE);
        Self {
            window_size,
            window: VecDeque::with_capacity(window_size),
            most_recent: None,
            totals: Counters::default(),
        }
    }

    /// Feeds one received sequence number.
    ///
    /// The first call seeds the window at `seq - 1`. A newer sequence number
    /// advances the window, folding evicted slots into the totals; an older
    /// one that still falls inside the window marks its slot received (and
    /// out of order when it is not the most recent); anything older than the
    /// window counts as `too_old`.
    pub fn update(&mut self, sequence_number: u16) {
        let seq = Wrapping16::new(sequence_number);

        if self.most_recent.is_none() {
            self.most_recent = Some(seq - 1);
        }
        let most_recent = self.most_recent.as_mut().expect("seeded above");

        if seq <= *most_recent - self.window.len() as u16 {
            self.totals.too_old += 1;
            return;
        }

        if self.window_size == 0 {
            return;
        }

        if let Some(distance) = most_recent.advance_to(sequence_number) {
            for _ in 0..distance {
                if self.window.len() == self.window_size {
                    let slot = self.window.pop_front().expect("window is full");
                    Self::fold(&mut self.totals, slot);
                }
                self.window.push_back(Slot::default());
            }
            if let Some(back) = self.window.back_mut() {
                back.times_received += 1;
            }
        } else {
            let behind = (*most_recent - seq).value() as usize;
            let index = self.window.len() - 1 - behind;
            let slot = &mut self.window[index];
            slot.times_received = slot.times_received.saturating_add(1);
            if behind > 0 {
                slot.times_out_of_order += 1;
            }
        }
    }

    /// Marks a packet as having arrived too late for the consumer. Ignored
    /// for sequence numbers that never arrived, are newer than the most
    /// recent packet, or already left the window.
    pub fn mark_packet_too_late(&mut self, sequence_number: u16) {
        let Some(most_recent) = self.most_recent else {
            return;
        };
        let seq = Wrapping16::new(sequence_number);
        if seq > most_recent {
            return;
        }
        if seq <= most_recent - self.window.len() as u16 {
            return;
        }
        let behind = (most_recent - seq).value() as usize;
        let index = self.window.len() - 1 - behind;
        self.window[index].times_too_late += 1;
    }

    /// Counters over the slots still inside the window.
    pub fn window_counts(&self) -> Counters {
        let mut counters = Counters::default();
        if self.most_recent.is_none() {
            return counters;
        }
        for slot in &self.window {
            Self::fold(&mut counters, *slot);
        }
        counters
    }

    /// Cumulative counters of everything that left the window since the last
    /// reset. Monotonically non-decreasing.
    pub fn total_counts(&self) -> Counters {
        self.totals
    }

    /// Totals plus the live window: the externally published view, in which
    /// holes that have not yet been evicted already show up as dropped.
    pub fn combined_counts(&self) -> Counters {
        self.totals + self.window_counts()
    }

    /// The number of slots currently in the window.
    pub fn count(&self) -> usize {
        self.window.len()
    }

    /// Returns to the initial state, optionally with a new window size.
    pub fn reset(&mut self, window_size: Option<usize>) {
        if let Some(size) = window_size {
            self.window_size = size.min(MAX_WINDOW_SIZE);
            self.window = VecDeque::with_capacity(self.window_size);
        } else {
            self.window.clear();
        }
        self.most_recent = None;
        self.totals = Counters::default();
    }

    fn fold(counters: &mut Counters, slot: Slot) {
        if slot.times_received == 0 {
            counters.dropped += 1;
        } else if slot.times_received > 1 {
            counters.duplicates += (slot.times_received - 1) as u32;
        }
        counters.out_of_order += slot.times_out_of_order as u32;
        counters.too_late += slot.times_too_late as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_sequence_counts_nothing() {
        let mut stats = PacketStats::default();
        for seq in 10..=14 {
            stats.update(seq);
        }
        assert_eq!(stats.combined_counts(), Counters::default());
    }

    #[test]
    fn late_arrival_moves_dropped_to_out_of_order() {
        let mut stats = PacketStats::default();
        stats.update(10);
        stats.update(12);
        let counts = stats.combined_counts();
        assert_eq!(counts.dropped, 1);
        assert_eq!(counts.out_of_order, 0);

        // The hole is filled late: not dropped after all, but out of order.
        stats.update(11);
        let counts = stats.combined_counts();
        assert_eq!(counts.dropped, 0);
        assert_eq!(counts.out_of_order, 1);
        assert_eq!(counts.duplicates, 0);
    }

    #[test]
    fn duplicate_of_newest_counts_only_duplicates() {
        let mut stats = PacketStats::default();
        stats.update(100);
        stats.update(100);
        let counts = stats.combined_counts();
        assert_eq!(counts.duplicates, 1);
        assert_eq!(counts.out_of_order, 0);
        assert_eq!(counts.dropped, 0);
        assert_eq!(counts.too_late, 0);
    }

    #[test]
    fn every_case_is_counted_once() {
        let mut stats = PacketStats::new(4);
        stats.update(1);
        stats.update(4);
        stats.update(3); // out of order
        stats.update(5);
        stats.update(5); // duplicate
        stats.mark_packet_too_late(3);

        // Slide the window so all slots are collected into the totals.
        for seq in 6..=9 {
            stats.update(seq);
        }

        let totals = stats.total_counts();
        assert_eq!(totals.dropped, 1); // seq 2
        assert_eq!(totals.duplicates, 1);
        assert_eq!(totals.out_of_order, 1);
        assert_eq!(totals.too_late, 1);
    }

    #[test]
    fn wraparound_sequence_is_seamless() {
        let mut stats = PacketStats::new(32_768);
        let mut seq = 0xfff0u16;
        for _ in 0..0x20 {
            stats.update(seq);
            seq = seq.wrapping_add(1);
        }
        assert_eq!(stats.combined_counts(), Counters::default());

        // A repeat inside the window is a duplicate.
        stats.update(0xfff8);
        let counts = stats.combined_counts();
        assert_eq!(counts.duplicates, 1);
        assert_eq!(counts.out_of_order, 1);
        assert_eq!(counts.dropped, 0);
    }

    #[test]
    fn older_than_window_counts_too_old() {
        let mut stats = PacketStats::new(4);
        for seq in 10..=15 {
            stats.update(seq);
        }
        stats.update(10); // window now covers 12..=15
        let counts = stats.combined_counts();
        assert_eq!(counts.too_old, 1);
        assert_eq!(counts.duplicates, 0);
        assert_eq!(counts.dropped, 0);
    }

    #[test]
    fn too_late_marks_only_packets_in_window() {
        let mut stats = PacketStats::default();
        stats.mark_packet_too_late(50); // before any arrival: ignored
        stats.update(1);
        stats.update(3);
        stats.mark_packet_too_late(2);
        stats.mark_packet_too_late(4); // newer than most recent: ignored
        stats.mark_packet_too_late(0); // left of the window: ignored
        let counts = stats.combined_counts();
        assert_eq!(counts.too_late, 1);
        assert_eq!(counts.dropped, 1); // seq 2 was marked late but never arrived
    }

    #[test]
    fn totals_are_monotone() {
        let mut stats = PacketStats::new(8);
        let mut previous = stats.total_counts();
        let sequence = [1u16, 5, 3, 3, 2, 20, 21, 22, 40, 41, 39, 60];
        for seq in sequence {
            stats.update(seq);
            let totals = stats.total_counts();
            assert!(totals.dropped >= previous.dropped);
            assert!(totals.duplicates >= previous.duplicates);
            assert!(totals.out_of_order >= previous.out_of_order);
            assert!(totals.too_late >= previous.too_late);
            previous = totals;
        }
    }

    #[test]
    fn long_run_counts_a_single_drop() {
        let mut stats = PacketStats::default();
        let mut dropped = 0u32;
        for i in 0..(3 * 0x10000usize) {
            let seq = i as u16;
            if seq == 1 {
                dropped += 1;
                continue;
            }
            stats.update(seq);
        }
        assert_eq!(stats.combined_counts().dropped, dropped);
    }

    #[test]
    fn reset_clears_everything() {
        let mut stats = PacketStats::default();
        stats.update(10);
        stats.update(12);
        stats.mark_packet_too_late(12);
        stats.reset(None);
        assert_eq!(stats.combined_counts(), Counters::default());
        assert_eq!(stats.count(), 0);

        stats.reset(Some(16));
        stats.update(1);
        assert_eq!(stats.count(), 1);
    }

    #[test]
    fn counters_add() {
        let a = Counters { out_of_order: 1, duplicates: 2, dropped: 3, too_late: 4, too_old: 5, jitter: 0.0 };
        let sum = a + a;
        assert_eq!(sum.out_of_order, 2);
        assert_eq!(sum.duplicates, 4);
        assert_eq!(sum.dropped, 6);
        assert_eq!(sum.too_late, 8);
        assert_eq!(sum.too_old, 10);
    }
}
