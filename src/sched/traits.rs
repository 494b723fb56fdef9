/*!
 * Scheduler Collaborators
 *
 * Seams between the priority engine and the rest of the kernel: the run
 * queue that orders runnable threads, the clock, the timer service that
 * drives quantum expiration and wait timeouts, and the resource ledger.
 */

use super::thread::Thread;
use crate::core::id::{TaskId, ThreadId};
use crate::core::types::{AbsTime, Priority};
use serde::Serialize;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Runnable thread counts used to derive `pri_shift`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunQueueLoad {
    pub total: usize,
    pub background: usize,
}

/// Ordered set of runnable threads
///
/// Implementations take their own lock; it is a leaf in the lock order and
/// must not be held while calling back into the scheduler.
#[cfg_attr(test, automock)]
pub trait RunQueue: Send + Sync {
    /// Insert at the tail of `priority`
    fn enqueue(&self, thread: &Arc<Thread>, priority: Priority);

    /// Remove wherever it is; `false` if it was not queued
    fn dequeue(&self, thread: &Arc<Thread>) -> bool;

    /// Remove if present, then insert at the tail of `priority`
    fn requeue(&self, thread: &Arc<Thread>, priority: Priority);

    /// Pop the first thread of the highest priority
    fn choose(&self) -> Option<Arc<Thread>>;

    fn highest_priority(&self) -> Option<Priority>;

    fn load(&self) -> RunQueueLoad;

    /// Every queued thread, highest priority first
    fn snapshot(&self) -> Vec<Arc<Thread>>;
}

/// Monotonic time source
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> AbsTime;
}

/// Callback run when a timer fires, given the firing time
pub type TimerCallback = Box<dyn FnOnce(AbsTime) + Send + 'static>;

/// Handle for cancelling an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle {
    pub deadline: AbsTime,
    pub id: u64,
}

/// One-shot timers
///
/// Callbacks run with no scheduler or wait queue locks held.
pub trait TimerService: Send + Sync {
    fn arm(&self, deadline: AbsTime, callback: TimerCallback) -> TimerHandle;

    /// `false` if the timer already fired or was cancelled
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// Account charged for consumed resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LedgerAccount {
    Thread(ThreadId),
    Task(TaskId),
}

/// Resource kind being charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LedgerKind {
    CpuTime,
}

/// Resource accounting sink
#[cfg_attr(test, automock)]
pub trait Ledger: Send + Sync {
    fn credit(&self, account: LedgerAccount, kind: LedgerKind, amount: u64);

    /// Drop every balance held for a retired `account`
    fn forget(&self, account: LedgerAccount);
}
