//! Monotonic clock and the fixed-capacity timeout wheel.
//!
//! The wheel intentionally stays O(N) over a small fixed capacity rather than
//! a binary heap: with at most a few dozen live timers (one per device that
//! cares about time), a linear scan is both simpler and, at this size, faster
//! than a heap's pointer chasing.

use std::time::Instant;

/// Number of timer slots the wheel can hold at once.
pub const WHEEL_CAPACITY: usize = 32;

/// Opaque timer handle. `0` is reserved and never returned by `alloc`.
pub type TimeoutHandle = u32;

/// Monotonic clock used to timestamp and schedule events.
///
/// Wraps [`std::time::Instant`] so the rest of the crate works in plain
/// integer ticks instead of threading `Instant` math through every module.
pub struct Clock {
    epoch: Instant,
    freq: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            freq: 1_000_000_000,
        }
    }

    /// Ticks elapsed since the clock was created, at `freq()` ticks/second.
    pub fn time(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Ticks per second.
    pub fn freq(&self) -> u64 {
        self.freq
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
struct Slot {
    used: bool,
    armed: bool,
    deadline: u64,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            used: false,
            armed: false,
            deadline: 0,
        }
    }
}

/// Fixed-capacity set of named absolute-time deadlines.
///
/// `alloc` reserves a handle; `request` arms (or re-arms) it with an
/// absolute deadline; `trigger` pops the earliest expired handle, if any,
/// breaking ties on handle id; `cancel` disarms without freeing the slot.
pub struct TimeoutWheel {
    slots: [Slot; WHEEL_CAPACITY],
}

impl TimeoutWheel {
    pub fn new() -> Self {
        Self {
            slots: [Slot::empty(); WHEEL_CAPACITY],
        }
    }

    /// Reserve a new handle. Returns `0` if the wheel is exhausted.
    pub fn alloc(&mut self) -> TimeoutHandle {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if !slot.used {
                slot.used = true;
                slot.armed = false;
                slot.deadline = 0;
                return (idx + 1) as TimeoutHandle;
            }
        }
        0
    }

    fn index(handle: TimeoutHandle) -> Option<usize> {
        if handle == 0 || handle as usize > WHEEL_CAPACITY {
            None
        } else {
            Some(handle as usize - 1)
        }
    }

    /// Arm (or re-arm) `handle` for `abstime`. Idempotent: calling this again
    /// on an already-armed handle simply replaces the deadline.
    pub fn request(&mut self, handle: TimeoutHandle, abstime: u64) -> bool {
        match Self::index(handle) {
            Some(idx) if self.slots[idx].used => {
                self.slots[idx].armed = true;
                self.slots[idx].deadline = abstime;
                true
            }
            _ => false,
        }
    }

    /// Disarm `handle` without freeing its slot.
    pub fn cancel(&mut self, handle: TimeoutHandle) -> bool {
        match Self::index(handle) {
            Some(idx) if self.slots[idx].used => {
                self.slots[idx].armed = false;
                true
            }
            _ => false,
        }
    }

    /// Free `handle` entirely so it may be reallocated.
    pub fn free(&mut self, handle: TimeoutHandle) {
        if let Some(idx) = Self::index(handle) {
            self.slots[idx] = Slot::empty();
        }
    }

    /// Pop the earliest-deadline handle with `deadline <= now`, if any. Ties
    /// are broken by handle id (lowest id first).
    pub fn trigger(&mut self, now: u64) -> Option<TimeoutHandle> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.used && slot.armed && slot.deadline <= now {
                match best {
                    Some((_, best_deadline)) if slot.deadline >= best_deadline => {}
                    _ => best = Some((idx, slot.deadline)),
                }
            }
        }
        let (idx, _) = best?;
        self.slots[idx].armed = false;
        Some((idx + 1) as TimeoutHandle)
    }

    /// Nearest active deadline across all armed handles, or `None` if none armed.
    pub fn timeout(&self) -> Option<u64> {
        self.slots
            .iter()
            .filter(|slot| slot.used && slot.armed)
            .map(|slot| slot.deadline)
            .min()
    }
}

impl Default for TimeoutWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_exhausted_after_capacity() {
        let mut wheel = TimeoutWheel::new();
        for _ in 0..WHEEL_CAPACITY {
            assert_ne!(wheel.alloc(), 0);
        }
        assert_eq!(wheel.alloc(), 0);
    }

    #[test]
    fn trigger_orders_by_deadline_then_handle() {
        let mut wheel = TimeoutWheel::new();
        let a = wheel.alloc();
        let b = wheel.alloc();
        let c = wheel.alloc();
        wheel.request(a, 100);
        wheel.request(b, 50);
        wheel.request(c, 50);

        assert_eq!(wheel.trigger(1000), Some(b));
        assert_eq!(wheel.trigger(1000), Some(c));
        assert_eq!(wheel.trigger(1000), Some(a));
        assert_eq!(wheel.trigger(1000), None);
    }

    #[test]
    fn request_is_idempotent_rearm() {
        let mut wheel = TimeoutWheel::new();
        let h = wheel.alloc();
        wheel.request(h, 10);
        wheel.request(h, 20);
        assert_eq!(wheel.timeout(), Some(20));
        assert_eq!(wheel.trigger(15), None);
        assert_eq!(wheel.trigger(25), Some(h));
    }

    #[test]
    fn cancel_disarms_without_freeing_slot() {
        let mut wheel = TimeoutWheel::new();
        let h = wheel.alloc();
        wheel.request(h, 10);
        assert!(wheel.cancel(h));
        assert_eq!(wheel.trigger(100), None);
        assert!(wheel.request(h, 5));
    }

    #[test]
    fn timeout_reports_nearest_deadline() {
        let mut wheel = TimeoutWheel::new();
        assert_eq!(wheel.timeout(), None);
        let a = wheel.alloc();
        let b = wheel.alloc();
        wheel.request(a, 500);
        wheel.request(b, 200);
        assert_eq!(wheel.timeout(), Some(200));
    }
}
