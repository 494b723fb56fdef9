/*!
 * Lock-Free Scheduler Statistics
 * Atomic counters for the priority engine and dispatcher hot paths
 */

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub threads_created: u64,
    pub ticks: u64,
    pub quantum_expirations: u64,
    pub priority_updates: u64,
    pub lightweight_updates: u64,
    pub runq_repositions: u64,
    pub failsafe_trips: u64,
    pub failsafe_releases: u64,
    pub preemptions: u64,
    pub context_switches: u64,
    pub wakeups: u64,
}

/// Atomic scheduler statistics
///
/// # Performance
/// - Cache-line aligned to prevent false sharing
/// - Relaxed ordering; counters are independent
#[repr(C, align(64))]
#[derive(Default)]
pub struct AtomicSchedulerStats {
    threads_created: AtomicU64,
    ticks: AtomicU64,
    quantum_expirations: AtomicU64,
    priority_updates: AtomicU64,
    lightweight_updates: AtomicU64,
    runq_repositions: AtomicU64,
    failsafe_trips: AtomicU64,
    failsafe_releases: AtomicU64,
    preemptions: AtomicU64,
    context_switches: AtomicU64,
    wakeups: AtomicU64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            #[inline(always)]
            pub fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl AtomicSchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        inc_threads_created => threads_created,
        inc_ticks => ticks,
        inc_quantum_expirations => quantum_expirations,
        inc_priority_updates => priority_updates,
        inc_lightweight_updates => lightweight_updates,
        inc_runq_repositions => runq_repositions,
        inc_failsafe_trips => failsafe_trips,
        inc_failsafe_releases => failsafe_releases,
        inc_preemptions => preemptions,
        inc_context_switches => context_switches,
        inc_wakeups => wakeups,
    }

    /// Snapshot of current counters
    ///
    /// # Note
    /// Values may be mutually inconsistent under concurrent updates; each is
    /// individually accurate.
    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            threads_created: self.threads_created.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            quantum_expirations: self.quantum_expirations.load(Ordering::Relaxed),
            priority_updates: self.priority_updates.load(Ordering::Relaxed),
            lightweight_updates: self.lightweight_updates.load(Ordering::Relaxed),
            runq_repositions: self.runq_repositions.load(Ordering::Relaxed),
            failsafe_trips: self.failsafe_trips.load(Ordering::Relaxed),
            failsafe_releases: self.failsafe_releases.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
        }
    }
}
