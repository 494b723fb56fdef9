/*!
 * Priority Engine
 *
 * Scheduled priority of a timeshare thread is its base priority minus its
 * decayed CPU usage scaled by `pri_shift`:
 *
 * ```text
 * sched_priority = clamp(base_priority - (usage >> pri_shift))
 * ```
 *
 * Fixed and realtime threads run at their base priority. Promotion and
 * depression override both until they are undone. Every priority change of
 * a queued thread repositions it in the run queue.
 *
 * ## Priority Bands
 *
 * ```text
 * 0-63:   user threads (0 is also the depression priority)
 * 64-79:  system threads
 * 80-95:  kernel threads
 * ```
 */

use super::decay::{DECAY_TICKS, NO_DECAY_SHIFT};
use super::thread::{SchedFlags, SchedMode, Thread, ThreadControl};
use super::Scheduler;
use crate::core::types::{AbsTime, Priority};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

pub const MIN_PRI: Priority = 0;
pub const MIN_USER_PRI: Priority = MIN_PRI;
pub const DEPRESS_PRI: Priority = MIN_PRI;
pub const BASEPRI_DEFAULT: Priority = 31;
pub const MAX_USER_PRI: Priority = 63;
pub const MIN_KERNEL_PRI: Priority = 80;
pub const MAX_KERNEL_PRI: Priority = 95;

/// Bound a priority to the schedulable band
#[inline(always)]
pub fn clamp_priority(priority: Priority) -> Priority {
    priority.clamp(MIN_USER_PRI, MAX_KERNEL_PRI)
}

/// Timeshare priority for the current usage and shift
#[inline]
fn timeshare_priority(ctl: &ThreadControl) -> Priority {
    let penalty = ctl.usage.checked_shr(ctl.pri_shift).unwrap_or(0);
    let penalty = Priority::try_from(penalty).unwrap_or(Priority::MAX);
    clamp_priority(ctl.base_priority.saturating_sub(penalty))
}

impl Scheduler {
    /// Set the base priority, recomputing the scheduled priority unless it
    /// is overridden by a promotion or depression
    pub fn set_priority(&self, thread: &Arc<Thread>, priority: Priority) {
        let priority = clamp_priority(priority);
        let mut ctl = thread.lock();

        // a demoted realtime thread gets its new base back on release
        if ctl.flags.contains(SchedFlags::FAILSAFE) && ctl.saved_mode == SchedMode::Realtime {
            ctl.saved_base_priority = priority;
            return;
        }

        ctl.base_priority = priority;
        ctl.saved_base_priority = priority;
        if !ctl.flags.overrides_priority() {
            self.compute_priority(thread, &mut ctl);
        }
    }

    /// Whether the thread has not been updated during the current tick
    #[inline(always)]
    pub fn can_update_priority(&self, ctl: &ThreadControl) -> bool {
        ctl.sched_stamp != self.tick()
    }

    /// Apply usage decay for the ticks elapsed since the last update
    pub fn update_priority(&self, thread: &Arc<Thread>) {
        let mut ctl = thread.lock();
        self.update_priority_locked(thread, &mut ctl);
    }

    /// Fold pending CPU usage in without decaying
    pub fn lightweight_update_priority(&self, thread: &Arc<Thread>) {
        let mut ctl = thread.lock();
        self.lightweight_update_locked(thread, &mut ctl);
    }

    pub(crate) fn update_priority_locked(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl) {
        let config = self.config();
        let elapsed = self.tick().wrapping_sub(ctl.sched_stamp);
        ctl.sched_stamp = ctl.sched_stamp.wrapping_add(elapsed);
        ctl.pri_shift = self
            .pri_shifts
            .for_options(thread.options(), config.decay_policy);
        self.stats.inc_priority_updates();

        let ticks = elapsed.saturating_mul(config.decay_usage_age_factor);
        let delta = std::mem::take(&mut ctl.cpu_delta);
        if ticks < DECAY_TICKS {
            if ticks > 0 {
                ctl.usage = self.decay.decay(ctl.usage, ticks);
                ctl.cpu_usage = self.decay.decay(ctl.cpu_usage, ticks);
            }
            ctl.cpu_usage = ctl.cpu_usage.saturating_add(delta);
            if ctl.pri_shift < NO_DECAY_SHIFT {
                ctl.usage = ctl.usage.saturating_add(delta);
            }
        } else {
            ctl.usage = 0;
            ctl.cpu_usage = 0;
        }

        if ctl.flags.contains(SchedFlags::FAILSAFE) && self.now() >= ctl.safe_release {
            self.failsafe_release(thread, ctl);
        }

        if ctl.mode == SchedMode::Timeshare && !ctl.flags.overrides_priority() {
            let priority = timeshare_priority(ctl);
            self.set_sched_pri(thread, ctl, priority);
        }
    }

    pub(crate) fn lightweight_update_locked(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl) {
        if ctl.mode != SchedMode::Timeshare {
            return;
        }
        self.stats.inc_lightweight_updates();

        let delta = std::mem::take(&mut ctl.cpu_delta);
        ctl.cpu_usage = ctl.cpu_usage.saturating_add(delta);
        if ctl.pri_shift < NO_DECAY_SHIFT {
            ctl.usage = ctl.usage.saturating_add(delta);
        }

        if !ctl.flags.overrides_priority() {
            let priority = timeshare_priority(ctl);
            self.set_sched_pri(thread, ctl, priority);
        }
    }

    /// Recompute from mode, base priority and usage
    pub(crate) fn compute_priority(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl) {
        let priority = match ctl.mode {
            SchedMode::Timeshare => timeshare_priority(ctl),
            SchedMode::Fixed | SchedMode::Realtime => ctl.base_priority,
        };
        self.set_sched_pri(thread, ctl, priority);
    }

    /// Change the scheduled priority, moving a queued thread to its new
    /// level. Returns whether the priority changed.
    pub(crate) fn set_sched_pri(
        &self,
        thread: &Arc<Thread>,
        ctl: &mut ThreadControl,
        priority: Priority,
    ) -> bool {
        let priority = clamp_priority(priority);
        if ctl.sched_priority == priority {
            return false;
        }
        let old = ctl.sched_priority;

        // a failed dequeue means a dispatcher already took the thread
        if ctl.on_runq && self.runq.dequeue(thread) {
            ctl.sched_priority = priority;
            self.runq.enqueue(thread, priority);
            self.stats.inc_runq_repositions();
        } else {
            ctl.sched_priority = priority;
        }

        if ctl.run_state == super::thread::RunState::Running {
            if let Some(processor) = ctl.processor.as_ref().and_then(Weak::upgrade) {
                processor.state.lock().current_priority = priority;
            }
        }

        trace!(thread = %thread.id(), old, new = priority, "scheduled priority changed");
        true
    }

    /// Demote a fixed-priority thread that ran too long without blocking
    pub(crate) fn failsafe_trip(
        &self,
        thread: &Arc<Thread>,
        ctl: &mut ThreadControl,
        release_at: AbsTime,
    ) {
        if ctl.mode == SchedMode::Realtime {
            ctl.saved_base_priority = ctl.base_priority;
            ctl.base_priority = DEPRESS_PRI;
        }
        ctl.saved_mode = ctl.mode;
        ctl.mode = SchedMode::Timeshare;
        ctl.safe_release = release_at;
        ctl.flags.insert(SchedFlags::FAILSAFE);
        self.stats.inc_failsafe_trips();

        warn!(
            thread = %thread.id(),
            task = %thread.task(),
            saved_mode = ?ctl.saved_mode,
            safe_release = release_at,
            "fail-safe: fixed priority thread demoted to timeshare"
        );
    }

    fn failsafe_release(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl) {
        ctl.mode = ctl.saved_mode;
        if ctl.mode == SchedMode::Realtime {
            ctl.base_priority = ctl.saved_base_priority;
        }
        ctl.flags.remove(SchedFlags::FAILSAFE);
        self.stats.inc_failsafe_releases();

        warn!(
            thread = %thread.id(),
            mode = ?ctl.mode,
            base_priority = ctl.base_priority,
            "fail-safe released"
        );

        if !ctl.flags.overrides_priority() {
            let base = ctl.base_priority;
            self.set_sched_pri(thread, ctl, base);
        }
    }

    /// Raise the scheduled priority to at least `priority` and hold it
    pub fn promote(&self, thread: &Arc<Thread>, priority: Priority) {
        let priority = clamp_priority(priority);
        let mut ctl = thread.lock();
        ctl.flags.insert(SchedFlags::PROMOTED);
        if priority > ctl.sched_priority {
            self.set_sched_pri(thread, &mut ctl, priority);
        }
        debug!(thread = %thread.id(), priority = ctl.sched_priority, "thread promoted");
    }

    /// Undo a promotion; returns whether the thread was promoted
    pub fn unpromote(&self, thread: &Arc<Thread>) -> bool {
        let mut ctl = thread.lock();
        if !ctl.flags.contains(SchedFlags::PROMOTED) {
            return false;
        }
        ctl.flags.remove(SchedFlags::PROMOTED);
        if ctl.flags.contains(SchedFlags::DEPRESSED) {
            self.set_sched_pri(thread, &mut ctl, DEPRESS_PRI);
        } else {
            self.compute_priority(thread, &mut ctl);
        }
        true
    }

    /// Drop to the depression priority until `depress_abort`
    pub fn depress(&self, thread: &Arc<Thread>) {
        let mut ctl = thread.lock();
        ctl.flags.insert(SchedFlags::DEPRESSED);
        if !ctl.flags.contains(SchedFlags::PROMOTED) {
            self.set_sched_pri(thread, &mut ctl, DEPRESS_PRI);
        }
    }

    /// End a depression; returns whether the thread was depressed
    pub fn depress_abort(&self, thread: &Arc<Thread>) -> bool {
        let mut ctl = thread.lock();
        if !ctl.flags.contains(SchedFlags::DEPRESSED) {
            return false;
        }
        ctl.flags.remove(SchedFlags::DEPRESSED);
        if !ctl.flags.contains(SchedFlags::PROMOTED) {
            self.compute_priority(thread, &mut ctl);
        }
        true
    }

    /// Change scheduling mode; while fail-safe is active the change takes
    /// effect on release
    pub fn set_mode(&self, thread: &Arc<Thread>, mode: SchedMode) {
        let mut ctl = thread.lock();
        if ctl.flags.contains(SchedFlags::FAILSAFE) {
            ctl.saved_mode = mode;
            return;
        }
        if ctl.mode == mode {
            return;
        }

        let old = ctl.mode;
        ctl.mode = mode;
        ctl.saved_mode = mode;
        if mode == SchedMode::Timeshare {
            ctl.sched_stamp = self.tick();
            ctl.pri_shift = self
                .pri_shifts
                .for_options(thread.options(), self.config().decay_policy);
        }
        if !ctl.flags.overrides_priority() {
            self.compute_priority(thread, &mut ctl);
        }
        debug!(thread = %thread.id(), ?old, new = ?mode, "scheduling mode changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::TaskId;
    use crate::sched::thread::ThreadSpec;

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_priority(-5), MIN_USER_PRI);
        assert_eq!(clamp_priority(500), MAX_KERNEL_PRI);
        assert_eq!(clamp_priority(40), 40);
    }

    #[test]
    fn test_timeshare_priority_ignores_oversized_shift() {
        let spec = ThreadSpec::new(TaskId::new(1));
        let mut ctl = ThreadControl::new(&spec, 0, NO_DECAY_SHIFT, 10);
        ctl.usage = u64::MAX;
        assert_eq!(timeshare_priority(&ctl), BASEPRI_DEFAULT);

        ctl.pri_shift = 0;
        assert_eq!(timeshare_priority(&ctl), MIN_USER_PRI);
    }

    #[test]
    fn test_set_priority_fixed_thread() {
        let scheduler = Scheduler::builder().build().unwrap();
        let thread =
            scheduler.create_thread(ThreadSpec::new(TaskId::new(1)).mode(SchedMode::Fixed));
        scheduler.set_priority(&thread, 70);
        let ctl = thread.lock();
        assert_eq!(ctl.base_priority(), 70);
        assert_eq!(ctl.sched_priority(), 70);
    }
}
