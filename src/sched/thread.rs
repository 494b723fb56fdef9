/*!
 * Thread Control State
 *
 * Per-thread scheduling fields. Everything in `ThreadControl` is guarded by
 * the thread's scheduling lock, which ranks after every wait queue lock:
 * a caller holding a thread lock may only take leaf locks (processor state,
 * run queue, timers).
 */

use super::priority::{clamp_priority, BASEPRI_DEFAULT};
use super::processor::Processor;
use super::traits::TimerHandle;
use super::Scheduler;
use crate::core::id::{QueueId, TaskId, ThreadId};
use crate::core::sync::lock_rank::{LockRank, RankToken};
use crate::core::types::{AbsTime, Priority, Tick};
use crate::waitq::{Event, Interruptible, WaitQueue, WaitResult};
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedMode {
    /// Priority decays with CPU usage
    Timeshare,
    /// Priority pinned to the base priority
    Fixed,
    /// Fixed priority with a realtime computation quantum
    Realtime,
}

impl SchedMode {
    /// Modes subject to the fail-safe
    #[inline]
    pub fn is_fixed_priority(self) -> bool {
        matches!(self, SchedMode::Fixed | SchedMode::Realtime)
    }
}

bitflags! {
    /// Scheduler-owned state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SchedFlags: u32 {
        /// Demoted to timeshare for exceeding the unsafe computation limit
        const FAILSAFE = 1 << 0;
        /// Priority raised by a promotion; normal recomputation suspended
        const PROMOTED = 1 << 1;
        /// Priority depressed; normal recomputation suspended
        const DEPRESSED = 1 << 2;
    }
}

impl SchedFlags {
    /// Flags that suppress normal priority recomputation
    #[inline(always)]
    pub fn overrides_priority(self) -> bool {
        self.intersects(SchedFlags::PROMOTED | SchedFlags::DEPRESSED)
    }
}

bitflags! {
    /// Caller-supplied thread options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ThreadOptions: u32 {
        /// Exempt from the fail-safe
        const SYSTEM_CRITICAL = 1 << 0;
        /// Decays against background load
        const BACKGROUND = 1 << 1;
    }
}

/// Dispatch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Runnable,
    Running,
    Waiting,
}

/// Creation parameters
#[derive(Debug, Clone)]
pub struct ThreadSpec {
    pub task: TaskId,
    pub priority: Priority,
    pub mode: SchedMode,
    pub options: ThreadOptions,
}

impl ThreadSpec {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            priority: BASEPRI_DEFAULT,
            mode: SchedMode::Timeshare,
            options: ThreadOptions::empty(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn mode(mut self, mode: SchedMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn options(mut self, options: ThreadOptions) -> Self {
        self.options = options;
        self
    }
}

/// Scheduling fields of one thread
pub struct ThreadControl {
    pub(crate) base_priority: Priority,
    pub(crate) sched_priority: Priority,
    pub(crate) saved_base_priority: Priority,
    pub(crate) mode: SchedMode,
    pub(crate) saved_mode: SchedMode,
    pub(crate) flags: SchedFlags,

    pub(crate) usage: u64,
    pub(crate) cpu_usage: u64,
    pub(crate) cpu_delta: u64,
    pub(crate) pri_shift: u32,
    pub(crate) sched_stamp: Tick,

    pub(crate) current_quantum: AbsTime,
    pub(crate) realtime_computation: AbsTime,
    pub(crate) computation_epoch: AbsTime,
    pub(crate) computation_metered: AbsTime,
    pub(crate) last_run_time: AbsTime,
    pub(crate) safe_release: AbsTime,
    pub(crate) precise_accounting: bool,

    pub(crate) run_state: RunState,
    pub(crate) on_runq: bool,
    pub(crate) processor: Option<Weak<Processor>>,

    pub(crate) wait_queue: Option<Weak<WaitQueue>>,
    pub(crate) wait_event: Event,
    pub(crate) interruptible: Interruptible,
    pub(crate) wait_result: WaitResult,
    pub(crate) wait_timer: Option<TimerHandle>,
    pub(crate) wait_generation: u64,
}

impl ThreadControl {
    pub(crate) fn new(spec: &ThreadSpec, stamp: Tick, pri_shift: u32, quantum: AbsTime) -> Self {
        let priority = clamp_priority(spec.priority);
        Self {
            base_priority: priority,
            sched_priority: priority,
            saved_base_priority: priority,
            mode: spec.mode,
            saved_mode: spec.mode,
            flags: SchedFlags::empty(),
            usage: 0,
            cpu_usage: 0,
            cpu_delta: 0,
            pri_shift,
            sched_stamp: stamp,
            current_quantum: quantum,
            realtime_computation: 0,
            computation_epoch: 0,
            computation_metered: 0,
            last_run_time: 0,
            safe_release: 0,
            precise_accounting: false,
            run_state: RunState::Idle,
            on_runq: false,
            processor: None,
            wait_queue: None,
            wait_event: Event::NONE,
            interruptible: Interruptible::Uninterruptible,
            wait_result: WaitResult::Awakened,
            wait_timer: None,
            wait_generation: 0,
        }
    }

    #[inline]
    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    #[inline]
    pub fn sched_priority(&self) -> Priority {
        self.sched_priority
    }

    pub fn saved_base_priority(&self) -> Priority {
        self.saved_base_priority
    }

    #[inline]
    pub fn mode(&self) -> SchedMode {
        self.mode
    }

    pub fn saved_mode(&self) -> SchedMode {
        self.saved_mode
    }

    #[inline]
    pub fn flags(&self) -> SchedFlags {
        self.flags
    }

    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub fn cpu_usage(&self) -> u64 {
        self.cpu_usage
    }

    pub fn cpu_delta(&self) -> u64 {
        self.cpu_delta
    }

    pub fn pri_shift(&self) -> u32 {
        self.pri_shift
    }

    pub fn sched_stamp(&self) -> Tick {
        self.sched_stamp
    }

    pub fn current_quantum(&self) -> AbsTime {
        self.current_quantum
    }

    pub fn computation_metered(&self) -> AbsTime {
        self.computation_metered
    }

    pub fn last_run_time(&self) -> AbsTime {
        self.last_run_time
    }

    pub fn safe_release(&self) -> AbsTime {
        self.safe_release
    }

    pub fn precise_accounting(&self) -> bool {
        self.precise_accounting
    }

    #[inline]
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn on_runq(&self) -> bool {
        self.on_runq
    }

    pub fn wait_result(&self) -> WaitResult {
        self.wait_result
    }

    pub fn wait_event(&self) -> Event {
        self.wait_event
    }

    /// Queue this thread is enqueued on, if any
    pub fn wait_queue(&self) -> Option<Arc<WaitQueue>> {
        self.wait_queue.as_ref().and_then(Weak::upgrade)
    }

    /// Set the computation quantum used while in realtime mode
    pub fn set_realtime_computation(&mut self, computation: AbsTime) {
        self.realtime_computation = computation;
    }

    #[inline]
    pub(crate) fn is_waiting_on(&self, queue: &Arc<WaitQueue>) -> bool {
        self.wait_queue
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(queue)))
    }

    /// Forget the current wait; the caller removes the queue element
    pub(crate) fn clear_wait_state(&mut self) -> Option<TimerHandle> {
        self.wait_queue = None;
        self.wait_event = Event::NONE;
        self.interruptible = Interruptible::Uninterruptible;
        self.wait_timer.take()
    }
}

/// Serializable view of a thread's scheduling state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSchedInfo {
    pub id: ThreadId,
    pub task: TaskId,
    pub base_priority: Priority,
    pub sched_priority: Priority,
    pub mode: SchedMode,
    pub failsafe: bool,
    pub promoted: bool,
    pub depressed: bool,
    pub usage: u64,
    pub cpu_usage: u64,
    pub pri_shift: u32,
    pub run_state: RunState,
    pub on_runq: bool,
    pub waiting_on: Option<QueueId>,
}

/// A schedulable thread
pub struct Thread {
    id: ThreadId,
    task: TaskId,
    options: AtomicU32,
    scheduler: Weak<Scheduler>,
    pub(crate) sched: Mutex<ThreadControl>,
    pub(crate) wakeup: Condvar,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        spec: &ThreadSpec,
        scheduler: Weak<Scheduler>,
        control: ThreadControl,
    ) -> Self {
        Self {
            id,
            task: spec.task,
            options: AtomicU32::new(spec.options.bits()),
            scheduler,
            sched: Mutex::new(control),
            wakeup: Condvar::new(),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline(always)]
    pub fn task(&self) -> TaskId {
        self.task
    }

    #[inline]
    pub fn options(&self) -> ThreadOptions {
        ThreadOptions::from_bits_truncate(self.options.load(Ordering::Acquire))
    }

    pub fn set_options(&self, options: ThreadOptions) {
        self.options.store(options.bits(), Ordering::Release);
    }

    /// Acquire the scheduling lock
    pub fn lock(&self) -> ThreadGuard<'_> {
        let token = RankToken::acquire(LockRank::Thread, self.id.as_u64());
        ThreadGuard {
            guard: self.sched.lock(),
            _token: token,
        }
    }

    /// The scheduler that created this thread
    ///
    /// A thread outliving its scheduler is a kernel bug.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler,
            None => panic!("thread {} outlived its scheduler", self.id),
        }
    }

    pub fn run_state(&self) -> RunState {
        self.lock().run_state
    }

    pub fn sched_priority(&self) -> Priority {
        self.lock().sched_priority
    }

    pub fn is_waiting(&self) -> bool {
        self.lock().wait_queue.is_some()
    }

    pub fn sched_info(&self) -> ThreadSchedInfo {
        let ctl = self.lock();
        ThreadSchedInfo {
            id: self.id,
            task: self.task,
            base_priority: ctl.base_priority,
            sched_priority: ctl.sched_priority,
            mode: ctl.mode,
            failsafe: ctl.flags.contains(SchedFlags::FAILSAFE),
            promoted: ctl.flags.contains(SchedFlags::PROMOTED),
            depressed: ctl.flags.contains(SchedFlags::DEPRESSED),
            usage: ctl.usage,
            cpu_usage: ctl.cpu_usage,
            pri_shift: ctl.pri_shift,
            run_state: ctl.run_state,
            on_runq: ctl.on_runq,
            waiting_on: ctl.wait_queue().map(|queue| queue.id()),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("options", &self.options())
            .finish()
    }
}

/// Held scheduling lock of one thread
pub struct ThreadGuard<'a> {
    pub(crate) guard: MutexGuard<'a, ThreadControl>,
    _token: RankToken,
}

impl Deref for ThreadGuard<'_> {
    type Target = ThreadControl;

    fn deref(&self) -> &ThreadControl {
        &self.guard
    }
}

impl DerefMut for ThreadGuard<'_> {
    fn deref_mut(&mut self) -> &mut ThreadControl {
        &mut self.guard
    }
}
