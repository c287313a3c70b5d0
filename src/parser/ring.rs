//! Sorting ring buffer
//!
//! Parser workers finish decoding out of order; the ring restores strict
//! capture order before packets reach the flow pools. Slot `i mod size`
//! belongs to packet index `i`, so each slot has exactly one writer per
//! cycle. A single flusher walks the cursor forward and is the only reader
//! and the only task clearing used flags.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::flow::PacketInformation;

pub struct SortRing {
    slots: Vec<Mutex<PacketInformation>>,
    used: Vec<AtomicBool>,
    /// Next packet index the flusher expects. Packet indices are 1-based.
    start: AtomicU64,
    size: u64,
}

impl SortRing {
    pub fn new(size: u64) -> Self {
        assert!(size > 0, "ring buffer size must be non-zero");
        let mut slots = Vec::with_capacity(size as usize);
        let mut used = Vec::with_capacity(size as usize);
        for _ in 0..size {
            slots.push(Mutex::new(PacketInformation::default()));
            used.push(AtomicBool::new(false));
        }
        Self {
            slots,
            used,
            start: AtomicU64::new(1),
            size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current cursor position (next expected packet index).
    pub fn start(&self) -> u64 {
        self.start.load(Ordering::Relaxed)
    }

    /// Whether a packet with this index fits without lapping the cursor.
    /// Strictly less than one full lap, so no slot ever has two writers.
    pub fn has_room(&self, packet_idx: u64) -> bool {
        packet_idx - self.start() < self.size
    }

    /// Deposit a decoded packet at its slot. The caller must have checked
    /// [`has_room`](Self::has_room); writers never contend on a slot
    /// because indices are dense and at most one lap ahead of the cursor.
    pub fn write(&self, info: PacketInformation) {
        let slot = (info.packet_idx % self.size) as usize;
        *self.slots[slot].lock() = info;
        self.used[slot].store(true, Ordering::Release);
    }

    /// Walk forward from the cursor, handing every populated slot to
    /// `dispatch` in strict index order, and stop at the first gap.
    /// Must only be called from the single flusher task.
    pub fn drain(&self, mut dispatch: impl FnMut(&PacketInformation)) {
        let mut idx = self.start.load(Ordering::Relaxed);
        loop {
            let slot = (idx % self.size) as usize;
            if !self.used[slot].load(Ordering::Acquire) {
                self.start.store(idx, Ordering::Release);
                return;
            }
            let info = *self.slots[slot].lock();
            dispatch(&info);
            self.used[slot].store(false, Ordering::Release);
            idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(idx: u64) -> PacketInformation {
        PacketInformation {
            packet_idx: idx,
            timestamp: idx as i64,
            ..Default::default()
        }
    }

    #[test]
    fn drains_in_index_order() {
        let ring = SortRing::new(16);
        // Deposit out of order.
        for idx in [3u64, 1, 2, 5, 4] {
            ring.write(packet(idx));
        }

        let mut seen = Vec::new();
        ring.drain(|info| seen.push(info.packet_idx));
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(ring.start(), 6);
    }

    #[test]
    fn stops_at_gap_and_resumes() {
        let ring = SortRing::new(8);
        ring.write(packet(1));
        ring.write(packet(3));

        let mut seen = Vec::new();
        ring.drain(|info| seen.push(info.packet_idx));
        assert_eq!(seen, vec![1]);
        assert_eq!(ring.start(), 2);

        ring.write(packet(2));
        ring.drain(|info| seen.push(info.packet_idx));
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(ring.start(), 4);
    }

    #[test]
    fn wraps_around() {
        let ring = SortRing::new(4);
        let mut seen = Vec::new();
        for idx in 1..=11u64 {
            ring.write(packet(idx));
            if idx % 3 == 0 {
                ring.drain(|info| seen.push(info.packet_idx));
            }
        }
        ring.drain(|info| seen.push(info.packet_idx));
        assert_eq!(seen, (1..=11).collect::<Vec<_>>());
    }

    #[test]
    fn room_check_tracks_cursor() {
        let ring = SortRing::new(4);
        assert!(ring.has_room(4));
        assert!(!ring.has_room(5));
        ring.write(packet(1));
        ring.drain(|_| {});
        assert!(ring.has_room(5));
        assert!(!ring.has_room(6));
    }
}
