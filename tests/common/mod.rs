/*!
 * Shared test harness
 */

#![allow(dead_code)]

use ai_os_sched::sched::{CalloutQueue, ManualClock, SchedConfig, Scheduler};
use ai_os_sched::{AbsTime, TaskId, Thread, ThreadSpec};
use std::sync::Arc;

/// Scheduler on a manual clock with an inspectable callout queue
pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub clock: Arc<ManualClock>,
    pub timers: Arc<CalloutQueue>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SchedConfig::default())
    }

    pub fn with_config(config: SchedConfig) -> Self {
        Self::build(config, 1)
    }

    pub fn build(config: SchedConfig, processors: usize) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let timers = Arc::new(CalloutQueue::new());
        let scheduler = Scheduler::builder()
            .with_config(config)
            .with_clock(clock.clone())
            .with_timers(timers.clone())
            .with_processors(processors)
            .build()
            .expect("valid test config");
        Self {
            scheduler,
            clock,
            timers,
        }
    }

    pub fn thread(&self, spec: ThreadSpec) -> Arc<Thread> {
        self.scheduler.create_thread(spec)
    }

    pub fn default_thread(&self) -> Arc<Thread> {
        self.thread(ThreadSpec::new(TaskId::new(1)))
    }

    /// Move the clock to `time` and run every callout due by then
    pub fn run_until(&self, time: AbsTime) -> usize {
        self.clock.set(time);
        self.timers.fire_expired(time)
    }
}

pub const MS: AbsTime = 1_000_000;
