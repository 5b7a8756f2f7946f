//! Timing wheel for retransmission and reassembly timeouts.
//!
//! The wheel gives O(1) insertion and expiry checking. Entries are never
//! cancelled: when a timer fires, the runtime re-validates it against the
//! current session/slot state and ignores stale ones.

use std::collections::VecDeque;

/// What a timer is armed for.
#[derive(Debug, Clone, Copy)]
pub enum TimerKind {
    /// A request slot's retransmission deadline.
    RequestRto {
        session_num: u16,
        slot_idx: usize,
        req_num: u64,
    },
    /// A pending session-management request's retransmission deadline.
    SmRetx { session_num: u16, attempt: u32 },
    /// A multi-packet reassembly's progress deadline.
    ReasmExpire { session_num: u16, req_num: u64 },
}

/// Entry in the timing wheel.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub kind: TimerKind,
    /// Expiration timestamp in event-loop microseconds.
    pub expires_at: u64,
}

/// Timing wheel: time is divided into fixed-duration slots and each timer
/// lands in the slot covering its deadline.
pub struct TimingWheel {
    slots: Vec<VecDeque<TimerEntry>>,
    num_slots: usize,
    slot_duration_us: u64,
    current_slot: usize,
    current_ts: u64,
    wheel_duration_us: u64,
}

impl TimingWheel {
    pub fn new(num_slots: usize, slot_duration_us: u64) -> Self {
        let slots = (0..num_slots).map(|_| VecDeque::new()).collect();
        Self {
            slots,
            num_slots,
            slot_duration_us,
            current_slot: 0,
            current_ts: 0,
            wheel_duration_us: num_slots as u64 * slot_duration_us,
        }
    }

    /// Default wheel for RTO tracking: 256 slots of 200 us, ~51 ms coverage.
    /// Deadlines past the horizon are parked in the last slot and
    /// re-bucketed as the wheel advances.
    pub fn default_for_rpc() -> Self {
        Self::new(256, 200)
    }

    pub fn init(&mut self, ts: u64) {
        self.current_ts = ts;
        self.current_slot = 0;
    }

    /// Insert a timer entry. Entries already expired are queued in the
    /// current slot and fire on the next advance.
    pub fn insert(&mut self, entry: TimerEntry) {
        let delta = entry.expires_at.saturating_sub(self.current_ts);
        let slots_ahead = if delta >= self.wheel_duration_us {
            self.num_slots - 1
        } else {
            (delta / self.slot_duration_us) as usize
        };
        let slot = (self.current_slot + slots_ahead) % self.num_slots;
        self.slots[slot].push_back(entry);
    }

    /// Advance the wheel to `ts`, pushing expired entries into `out`.
    /// `out` is not cleared.
    pub fn advance_into(&mut self, ts: u64, out: &mut Vec<TimerEntry>) {
        if ts <= self.current_ts {
            return;
        }

        let elapsed = ts - self.current_ts;
        let slots_to_advance =
            ((elapsed / self.slot_duration_us) as usize).min(self.num_slots - 1);
        let final_slot = (self.current_slot + slots_to_advance) % self.num_slots;

        for i in 0..=slots_to_advance {
            let slot = (self.current_slot + i) % self.num_slots;
            let mut remaining = self.slots[slot].len();
            while remaining > 0 {
                remaining -= 1;
                let entry = self.slots[slot].pop_front().unwrap();
                if entry.expires_at <= ts {
                    out.push(entry);
                } else {
                    // Parked long deadline; re-bucket past the final cursor
                    // position so it is not revisited this advance.
                    let delta = entry.expires_at - ts;
                    let slots_ahead = ((delta / self.slot_duration_us) as usize)
                        .clamp(1, self.num_slots - 1);
                    let new_slot = (final_slot + slots_ahead) % self.num_slots;
                    self.slots[new_slot].push_back(entry);
                }
            }
        }

        self.current_slot = final_slot;
        self.current_ts = ts;
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_empty())
    }
}

/// Exponential backoff: `base << attempt`, saturating, capped at `cap`.
#[inline]
pub fn backoff_us(base: u64, attempt: u32, cap: u64) -> u64 {
    base.saturating_mul(1u64 << attempt.min(32)).min(cap)
}

/// Steady microsecond clock for the event loop.
pub struct EventClock {
    t0: minstant::Instant,
}

impl EventClock {
    pub fn new() -> Self {
        Self {
            t0: minstant::Instant::now(),
        }
    }

    /// Microseconds since the clock was created.
    #[inline]
    pub fn now_us(&self) -> u64 {
        self.t0.elapsed().as_micros() as u64
    }
}

impl Default for EventClock {
    fn default() -> Self {
        Self::new()
    }
}
