/*!
 * Priority-Decay Scheduler
 *
 * Decides which runnable thread a processor executes and how thread
 * priorities evolve: timeshare priorities decay with recent CPU usage,
 * fixed and realtime threads keep their base priority until the fail-safe
 * demotes a thread that monopolizes a processor.
 *
 * The engine is driven by three inputs:
 * - the periodic scheduler tick (`sched_tick`), which ages usage and
 *   refreshes `pri_shift` from load
 * - quantum expiration of the running thread (`quantum_expire`)
 * - state changes from wait queues (`thread_setrun` on wakeup)
 *
 * Lock order: wait queue -> wait queue set -> thread -> {processor, run
 * queue, timers}.
 */

use crate::core::errors::ConfigError;
use crate::core::id::{ProcessorId, THREAD_IDS};
use crate::core::types::{AbsTime, Tick};
use crate::waitq::{LinkZone, WaitQueue, WaitQueuePolicy, WaitQueueSet};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

pub mod config;
pub mod decay;
pub mod ledger;
pub mod priority;
pub mod processor;
pub mod runq;
pub mod stats;
pub mod thread;
pub mod timer;
pub mod traits;

mod dispatch;
mod quantum;
mod tick;

pub use config::{DecayPolicy, SchedConfig};
pub use decay::{DecayTable, ShiftPair, DECAY_TICKS, NO_DECAY_SHIFT};
pub use ledger::CpuLedger;
pub use priority::{
    BASEPRI_DEFAULT, DEPRESS_PRI, MAX_KERNEL_PRI, MAX_USER_PRI, MIN_KERNEL_PRI, MIN_PRI,
    MIN_USER_PRI,
};
pub use processor::{Ast, Processor, ProcessorInfo, ProcessorSet, PsetHints};
pub use runq::PriorityRunQueue;
pub use stats::SchedulerStats;
pub use thread::{
    RunState, SchedFlags, SchedMode, Thread, ThreadControl, ThreadGuard, ThreadOptions,
    ThreadSchedInfo, ThreadSpec,
};
pub use tick::{PriShiftSnapshot, PriShifts};
pub use timer::{CalloutQueue, ManualClock, SystemClock};
pub use traits::{
    Clock, Ledger, LedgerAccount, LedgerKind, RunQueue, RunQueueLoad, TimerCallback,
    TimerHandle, TimerService,
};

use stats::AtomicSchedulerStats;

/// Scheduler instance: configuration, collaborators and processors
///
/// Always held in an `Arc`; threads and timer callbacks keep weak handles.
pub struct Scheduler {
    this: Weak<Scheduler>,
    config: ArcSwap<SchedConfig>,
    decay: &'static DecayTable,
    clock: Arc<dyn Clock>,
    timers: Arc<dyn TimerService>,
    runq: Arc<dyn RunQueue>,
    ledger: Arc<dyn Ledger>,
    tick: AtomicU32,
    pri_shifts: PriShifts,
    pset: Arc<ProcessorSet>,
    processors: Vec<Arc<Processor>>,
    link_zone: Arc<LinkZone>,
    stats: AtomicSchedulerStats,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Current configuration
    #[inline]
    pub fn config(&self) -> Arc<SchedConfig> {
        self.config.load_full()
    }

    /// Replace the configuration; threads pick it up at their next quantum
    pub fn set_config(&self, config: SchedConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.link_zone.set_limit(config.link_zone_limit);
        info!(
            std_quantum_us = config.std_quantum_us,
            decay_policy = ?config.decay_policy,
            "scheduler configuration replaced"
        );
        self.config.store(Arc::new(config));
        Ok(())
    }

    #[inline(always)]
    pub fn now(&self) -> AbsTime {
        self.clock.now()
    }

    /// Current global scheduler tick
    #[inline(always)]
    pub fn tick(&self) -> Tick {
        self.tick.load(Ordering::Acquire)
    }

    pub fn decay_table(&self) -> &'static DecayTable {
        self.decay
    }

    pub fn pri_shifts(&self) -> &PriShifts {
        &self.pri_shifts
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn timers(&self) -> &Arc<dyn TimerService> {
        &self.timers
    }

    pub fn run_queue(&self) -> &Arc<dyn RunQueue> {
        &self.runq
    }

    pub fn processor_set(&self) -> &Arc<ProcessorSet> {
        &self.pset
    }

    pub fn processors(&self) -> &[Arc<Processor>] {
        &self.processors
    }

    pub fn processor(&self, index: usize) -> Option<&Arc<Processor>> {
        self.processors.get(index)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot()
    }

    /// Zone bounding the links of sets built by this scheduler
    pub fn link_zone(&self) -> &Arc<LinkZone> {
        &self.link_zone
    }

    /// Wait queue with this scheduler's interlock timeout
    ///
    /// The timeout is fixed when the queue is built; later configuration
    /// changes apply to queues built afterwards.
    pub fn wait_queue(&self, policy: WaitQueuePolicy) -> Arc<WaitQueue> {
        WaitQueue::with_timeout(policy, self.config().interlock_timeout())
    }

    /// Wait queue set drawing links from this scheduler's zone
    pub fn wait_queue_set(&self, policy: WaitQueuePolicy) -> WaitQueueSet {
        WaitQueueSet::with_limits(
            policy,
            Arc::clone(&self.link_zone),
            self.config().interlock_timeout(),
        )
    }

    /// Create a thread bound to this scheduler, idle and unqueued
    pub fn create_thread(&self, spec: ThreadSpec) -> Arc<Thread> {
        let config = self.config();
        let mut control = thread::ThreadControl::new(
            &spec,
            self.tick(),
            self.pri_shifts.for_options(spec.options, config.decay_policy),
            config.std_quantum(),
        );
        control.precise_accounting = config.precise_accounting;

        let thread = Arc::new(Thread::new(
            THREAD_IDS.next(),
            &spec,
            self.this.clone(),
            control,
        ));
        self.stats.inc_threads_created();
        debug!(
            thread = %thread.id(),
            task = %spec.task,
            priority = spec.priority,
            mode = ?spec.mode,
            "thread created"
        );
        thread
    }
}

/// Builder for `Scheduler`
pub struct SchedulerBuilder {
    config: SchedConfig,
    clock: Option<Arc<dyn Clock>>,
    timers: Option<Arc<dyn TimerService>>,
    runq: Option<Arc<dyn RunQueue>>,
    ledger: Option<Arc<dyn Ledger>>,
    processors: usize,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedConfig::default(),
            clock: None,
            timers: None,
            runq: None,
            ledger: None,
            processors: 1,
        }
    }

    pub fn with_config(mut self, config: SchedConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Timer service for quantum expiration and wait timeouts
    pub fn with_timers(mut self, timers: Arc<dyn TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    pub fn with_run_queue(mut self, runq: Arc<dyn RunQueue>) -> Self {
        self.runq = Some(runq);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_processors(mut self, count: usize) -> Self {
        self.processors = count.max(1);
        self
    }

    pub fn build(self) -> Result<Arc<Scheduler>, ConfigError> {
        self.config.validate()?;

        let pset = Arc::new(ProcessorSet::new());
        let processors = (0..self.processors)
            .map(|index| {
                Arc::new(Processor::new(
                    ProcessorId::new(index as u64),
                    Arc::clone(&pset),
                ))
            })
            .collect::<Vec<_>>();

        info!(
            processors = processors.len(),
            std_quantum_us = self.config.std_quantum_us,
            max_unsafe_computation_us = self.config.max_unsafe_computation_us,
            decay_policy = ?self.config.decay_policy,
            "scheduler initialized"
        );

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let timers = self
            .timers
            .unwrap_or_else(|| Arc::new(CalloutQueue::new()) as Arc<dyn TimerService>);
        let runq = self
            .runq
            .unwrap_or_else(|| Arc::new(PriorityRunQueue::new()) as Arc<dyn RunQueue>);
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(CpuLedger::new()) as Arc<dyn Ledger>);
        let config = self.config;
        let link_zone = LinkZone::new(config.link_zone_limit);

        Ok(Arc::new_cyclic(|this| Scheduler {
            this: this.clone(),
            config: ArcSwap::from_pointee(config),
            decay: DecayTable::standard(),
            clock,
            timers,
            runq,
            ledger,
            tick: AtomicU32::new(0),
            pri_shifts: PriShifts::new(),
            pset,
            processors,
            link_zone,
            stats: AtomicSchedulerStats::new(),
        }))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
