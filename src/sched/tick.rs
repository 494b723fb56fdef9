/*!
 * Scheduler Tick
 *
 * Periodic maintenance: advance the global tick, derive `pri_shift` from
 * run-queue load, and age the priorities of threads that have not been
 * updated this tick (threads that sit on a run queue never hit
 * `quantum_expire`, so without the scan their priority would never recover).
 */

use super::config::DecayPolicy;
use super::decay::NO_DECAY_SHIFT;
use super::thread::{Thread, ThreadOptions};
use super::Scheduler;
use crate::core::types::Tick;
use crate::monitoring::span_operation;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

/// The three `pri_shift` values recomputed every tick
pub struct PriShifts {
    normal: AtomicU32,
    background: AtomicU32,
    combined: AtomicU32,
}

/// Copy of the current shifts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriShiftSnapshot {
    pub normal: u32,
    pub background: u32,
    pub combined: u32,
}

impl PriShifts {
    pub(crate) fn new() -> Self {
        Self {
            normal: AtomicU32::new(NO_DECAY_SHIFT),
            background: AtomicU32::new(NO_DECAY_SHIFT),
            combined: AtomicU32::new(NO_DECAY_SHIFT),
        }
    }

    #[inline]
    pub fn normal(&self) -> u32 {
        self.normal.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn background(&self) -> u32 {
        self.background.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn combined(&self) -> u32 {
        self.combined.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PriShiftSnapshot {
        PriShiftSnapshot {
            normal: self.normal(),
            background: self.background(),
            combined: self.combined(),
        }
    }

    /// Shift applying to a thread with `options` under `policy`
    #[inline]
    pub fn for_options(&self, options: ThreadOptions, policy: DecayPolicy) -> u32 {
        match policy {
            DecayPolicy::CombinedFgbg => self.combined(),
            DecayPolicy::Normal if options.contains(ThreadOptions::BACKGROUND) => {
                self.background()
            }
            DecayPolicy::Normal => self.normal(),
        }
    }

    fn store(&self, normal: u32, background: u32, combined: u32) {
        self.normal.store(normal, Ordering::Relaxed);
        self.background.store(background, Ordering::Relaxed);
        self.combined.store(combined, Ordering::Relaxed);
    }
}

impl Scheduler {
    /// One scheduler tick: advance, recompute shifts, age stale threads
    pub fn sched_tick(&self) -> Tick {
        let tick = self.advance_tick();
        let span = span_operation("sched_tick", tick);
        self.compute_averages();
        let updated = self.scan_stale_threads();
        span.record_items_processed(updated);
        trace!(tick, updated, "scheduler tick");
        tick
    }

    /// Advance the global tick, returning the new value
    pub fn advance_tick(&self) -> Tick {
        self.stats.inc_ticks();
        self.tick.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Derive `pri_shift` values from run-queue load per processor
    pub fn compute_averages(&self) {
        let load = self.runq.load();
        let config = self.config();
        let cpus = self.processors.len().max(1);
        let running = self
            .processors
            .iter()
            .filter(|processor| processor.state.lock().active_thread.is_some())
            .count();

        let total = load.total + running;
        let foreground = total.saturating_sub(load.background);
        let shift = |count: usize| self.decay.pri_shift(config.fixed_shift, count / cpus);

        self.pri_shifts
            .store(shift(foreground), shift(load.background), shift(total));
    }

    /// Override the shifts until the next `compute_averages`
    pub fn set_pri_shifts(&self, normal: u32, background: u32, combined: u32) {
        self.pri_shifts.store(normal, background, combined);
    }

    /// Apply `update_priority` to queued and running threads not yet
    /// updated this tick
    fn scan_stale_threads(&self) -> usize {
        let mut candidates = self.runq.snapshot();
        candidates.extend(
            self.processors
                .iter()
                .filter_map(|processor| processor.state.lock().active_thread.clone()),
        );

        candidates
            .iter()
            .filter(|thread| self.scan_one(thread))
            .count()
    }

    fn scan_one(&self, thread: &Arc<Thread>) -> bool {
        let mut ctl = thread.lock();
        if !self.can_update_priority(&ctl) {
            return false;
        }
        self.update_priority_locked(thread, &mut ctl);
        true
    }
}
