//! Packet classification support: reassembly state and drop accounting.
//!
//! The receive path classifies every packet as expected (a response for an
//! outstanding slot, or a continuation of an in-progress reassembly) or
//! unexpected (the first packet of a new multi-packet request). Unexpected
//! packets are admitted against a per-runtime window; everything that is
//! dropped is dropped silently and counted here.

use std::collections::HashMap;

use crate::buffer::MsgBuffer;

/// Bitmap of received packet numbers for one message.
#[derive(Debug, Default)]
pub(crate) struct PktBitmap {
    words: Vec<u64>,
    set_count: usize,
}

impl PktBitmap {
    pub fn new(num_pkts: usize) -> Self {
        Self {
            words: vec![0; num_pkts.div_ceil(64)],
            set_count: 0,
        }
    }

    /// Mark `pkt_num` received. Returns false if it was already set.
    pub fn set(&mut self, pkt_num: usize) -> bool {
        let (word, bit) = (pkt_num / 64, pkt_num % 64);
        debug_assert!(word < self.words.len());
        if self.words[word] & (1 << bit) != 0 {
            return false;
        }
        self.words[word] |= 1 << bit;
        self.set_count += 1;
        true
    }

    #[inline]
    pub fn is_set(&self, pkt_num: usize) -> bool {
        let (word, bit) = (pkt_num / 64, pkt_num % 64);
        self.words
            .get(word)
            .is_some_and(|w| w & (1 << bit) != 0)
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.set_count
    }

    /// Packet numbers in `0..expected` still missing.
    pub fn missing(&self, expected: usize) -> Vec<usize> {
        (0..expected).filter(|&i| !self.is_set(i)).collect()
    }
}

/// An in-progress multi-packet request reassembly.
#[derive(Debug)]
pub(crate) struct ReasmEntry {
    /// Dynamic accumulator sized for the whole message (runtime-owned).
    pub msgbuf: MsgBuffer,
    pub bitmap: PktBitmap,
    pub expected_pkts: usize,
    /// Event-loop time of the last accepted packet; stalled entries are
    /// discarded on timeout.
    pub last_progress_us: u64,
}

impl ReasmEntry {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.bitmap.count() == self.expected_pkts
    }
}

/// Counters for silently handled traffic. Only ever incremented; useful in
/// tests and when debugging a lossy fabric.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    /// Packets rejected for a bad magic or a malformed header.
    pub bad_pkts: u64,
    /// Packets for a missing or non-connected session.
    pub no_session_drops: u64,
    /// Duplicate packets discarded by a reassembly bitmap.
    pub dup_pkt_drops: u64,
    /// Response packets whose request slot moved on.
    pub stale_resp_drops: u64,
    /// First packets refused because the unexpected window was full.
    pub unexp_window_drops: u64,
    /// First packets refused because the target slot was mid-request.
    pub slot_busy_drops: u64,
    /// Reassemblies abandoned on a progress timeout.
    pub reasm_timeouts: u64,
    /// Duplicate requests answered by replaying the retained response.
    pub resp_replays: u64,
}

/// Per-runtime receive-side state: the reassembly table and the
/// unexpected-packet window.
pub(crate) struct Dispatcher {
    reasm: HashMap<(u16, u64), ReasmEntry>,
    unexp_in_flight: usize,
    unexp_pkt_window: usize,
    pub stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(unexp_pkt_window: usize) -> Self {
        Self {
            reasm: HashMap::new(),
            unexp_in_flight: 0,
            unexp_pkt_window,
            stats: DispatchStats::default(),
        }
    }

    /// Whether a new multi-packet request may be admitted.
    #[inline]
    pub fn window_has_room(&self) -> bool {
        self.unexp_in_flight < self.unexp_pkt_window
    }

    pub fn reasm_get_mut(&mut self, key: (u16, u64)) -> Option<&mut ReasmEntry> {
        self.reasm.get_mut(&key)
    }

    /// Admit a new reassembly against the unexpected window.
    pub fn reasm_insert(&mut self, key: (u16, u64), entry: ReasmEntry) {
        debug_assert!(self.window_has_room());
        debug_assert!(!self.reasm.contains_key(&key));
        self.unexp_in_flight += 1;
        self.reasm.insert(key, entry);
    }

    /// Remove a reassembly (complete or expired), releasing its window slot.
    pub fn reasm_remove(&mut self, key: (u16, u64)) -> Option<ReasmEntry> {
        let entry = self.reasm.remove(&key)?;
        self.unexp_in_flight -= 1;
        Some(entry)
    }

    /// Remove every reassembly belonging to `session_num`; used at session
    /// teardown. Returns the entries so their buffers can be reclaimed.
    pub fn reasm_remove_session(&mut self, session_num: u16) -> Vec<ReasmEntry> {
        let keys: Vec<_> = self
            .reasm
            .keys()
            .filter(|(s, _)| *s == session_num)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.reasm_remove(k))
            .collect()
    }

    #[inline]
    pub fn unexp_in_flight(&self) -> usize {
        self.unexp_in_flight
    }

    /// Debug-build self check: no bitmap may exceed its expected count.
    #[cfg(debug_assertions)]
    pub fn check_invariants(&self) {
        for entry in self.reasm.values() {
            debug_assert!(entry.bitmap.count() <= entry.expected_pkts);
        }
        debug_assert!(self.unexp_in_flight == self.reasm.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap() {
        let mut bm = PktBitmap::new(70);
        assert!(bm.set(0));
        assert!(bm.set(69));
        assert!(!bm.set(0));
        assert!(bm.is_set(69));
        assert!(!bm.is_set(1));
        assert_eq!(bm.count(), 2);
        assert_eq!(bm.missing(3), vec![1, 2]);
    }

    #[test]
    fn test_window_accounting() {
        let mut d = Dispatcher::new(2);

        assert!(d.window_has_room());
        d.reasm_insert(
            (1, 10),
            ReasmEntry {
                msgbuf: MsgBuffer::invalid(),
                bitmap: PktBitmap::new(2),
                expected_pkts: 2,
                last_progress_us: 0,
            },
        );
        d.reasm_insert(
            (1, 11),
            ReasmEntry {
                msgbuf: MsgBuffer::invalid(),
                bitmap: PktBitmap::new(2),
                expected_pkts: 2,
                last_progress_us: 0,
            },
        );
        assert!(!d.window_has_room());
        assert_eq!(d.unexp_in_flight(), 2);

        assert!(d.reasm_remove((1, 10)).is_some());
        assert!(d.window_has_room());
        assert!(d.reasm_remove((1, 10)).is_none());

        let drained = d.reasm_remove_session(1);
        assert_eq!(drained.len(), 1);
        assert_eq!(d.unexp_in_flight(), 0);
    }

    #[test]
    fn test_reasm_completion() {
        let mut entry = ReasmEntry {
            msgbuf: MsgBuffer::invalid(),
            bitmap: PktBitmap::new(3),
            expected_pkts: 3,
            last_progress_us: 0,
        };
        entry.bitmap.set(0);
        entry.bitmap.set(2);
        assert!(!entry.is_complete());
        entry.bitmap.set(1);
        assert!(entry.is_complete());
    }
}
