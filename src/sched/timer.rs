/*!
 * Clocks and Timers
 *
 * `SystemClock` reads the host monotonic clock; `ManualClock` only moves when
 * told to, for deterministic simulation. `CalloutQueue` is a deadline-ordered
 * timer list fired explicitly by whoever owns the time base.
 */

use super::traits::{Clock, TimerCallback, TimerHandle, TimerService};
use crate::core::types::AbsTime;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Nanoseconds since construction
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> AbsTime {
        self.origin.elapsed().as_nanos() as AbsTime
    }
}

/// Clock advanced by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: AbsTime) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move forward by `delta`, returning the new time
    pub fn advance(&self, delta: AbsTime) -> AbsTime {
        self.now.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Jump to `time`; never moves backwards
    pub fn set(&self, time: AbsTime) {
        self.now.fetch_max(time, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> AbsTime {
        self.now.load(Ordering::Acquire)
    }
}

/// Deadline-ordered one-shot timers
///
/// The list lock is a leaf; callbacks run after it is released, so a
/// callback may arm or cancel timers.
pub struct CalloutQueue {
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<TimerHandle, TimerCallback>>,
}

impl CalloutQueue {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Run every callout due at or before `now`, earliest first
    ///
    /// Returns the number of callbacks run.
    pub fn fire_expired(&self, now: AbsTime) -> usize {
        let mut fired = 0;
        loop {
            let due = {
                let mut pending = self.pending.lock();
                match pending.first_key_value() {
                    Some((handle, _)) if handle.deadline <= now => pending.pop_first(),
                    _ => None,
                }
            };
            match due {
                Some((_, callback)) => {
                    callback(now);
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<AbsTime> {
        self.pending
            .lock()
            .first_key_value()
            .map(|(handle, _)| handle.deadline)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for CalloutQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for CalloutQueue {
    fn arm(&self, deadline: AbsTime, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle {
            deadline,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        self.pending.lock().insert(handle, callback);
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.pending.lock().remove(&handle).is_some()
    }
}
