/*!
 * Ending Waits From the Thread Side
 *
 * Timeouts and interruption start from a thread rather than a queue. They
 * snapshot the wait under the thread lock, drop it, take the queue
 * interlock and the thread lock in order, and act only if the same wait
 * (same generation) is still in progress. Whichever of wakeup, timeout and
 * interruption gets there first wins; the others find nothing to do.
 */

use super::queue::WaitQueue;
use super::result::WaitResult;
use crate::core::types::AbsTime;
use crate::sched::thread::{Thread, ThreadControl};
use crate::sched::{Scheduler, TimerHandle};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Arm the deadline timer for wait `generation` of `thread`
pub(crate) fn arm_wait_timeout(
    scheduler: &Arc<Scheduler>,
    thread: &Arc<Thread>,
    generation: u64,
    deadline: AbsTime,
) -> TimerHandle {
    let scheduler_ref = Arc::downgrade(scheduler);
    let target = Arc::downgrade(thread);
    scheduler.timers().arm(
        deadline,
        Box::new(move |_| wait_timeout(&scheduler_ref, &target, generation)),
    )
}

fn wait_timeout(scheduler: &Weak<Scheduler>, thread: &Weak<Thread>, generation: u64) {
    let (Some(scheduler), Some(thread)) = (scheduler.upgrade(), thread.upgrade()) else {
        return;
    };
    if end_wait(&scheduler, &thread, WaitResult::TimedOut, |ctl| {
        ctl.wait_generation == generation
    }) {
        trace!(thread = %thread.id(), generation, "wait timed out");
    }
}

/// Snapshot of a wait in progress
struct PendingWait {
    queue: Weak<WaitQueue>,
    generation: u64,
}

/// End the current wait of `thread` if `accept` approves it
fn end_wait(
    scheduler: &Scheduler,
    thread: &Arc<Thread>,
    result: WaitResult,
    accept: impl Fn(&ThreadControl) -> bool,
) -> bool {
    let pending = {
        let ctl = thread.lock();
        match ctl.wait_queue.as_ref() {
            Some(queue) if accept(&ctl) => PendingWait {
                queue: queue.clone(),
                generation: ctl.wait_generation,
            },
            _ => return false,
        }
    };

    match pending.queue.upgrade() {
        Some(queue) => {
            let mut locked = queue.lock();
            locked.pull_waiter(thread, pending.generation, result)
        }
        None => {
            // the queue and its element list are gone; nothing will wake us
            let mut ctl = thread.lock();
            if ctl.wait_generation != pending.generation || ctl.wait_queue.is_none() {
                return false;
            }
            scheduler.thread_go(thread, &mut ctl, WaitResult::Restart);
            true
        }
    }
}

impl Scheduler {
    /// End whatever wait `thread` is in with `result`
    ///
    /// Returns false if the thread was not waiting.
    pub fn clear_wait(&self, thread: &Arc<Thread>, result: WaitResult) -> bool {
        end_wait(self, thread, result, |_| true)
    }

    /// Interrupt an interruptible wait
    ///
    /// Returns false if the thread was not waiting or its wait cannot be
    /// interrupted.
    pub fn thread_interrupt(&self, thread: &Arc<Thread>) -> bool {
        let interrupted = end_wait(self, thread, WaitResult::Interrupted, |ctl| {
            ctl.interruptible.allows_interrupt()
        });
        if interrupted {
            trace!(thread = %thread.id(), "wait interrupted");
        }
        interrupted
    }

    /// Interrupt the wait only if it was asserted abort-safe
    ///
    /// Plain `Interruptible` waits are left alone.
    pub fn thread_abort_safely(&self, thread: &Arc<Thread>) -> bool {
        let aborted = end_wait(self, thread, WaitResult::Interrupted, |ctl| {
            ctl.interruptible.allows_safe_abort()
        });
        if aborted {
            trace!(thread = %thread.id(), "wait aborted safely");
        }
        aborted
    }
}
