/*!
 * Scheduler Simulator - Main Entry Point
 *
 * Drives the scheduler on a manual clock with a fixed workload:
 * - CPU-bound timeshare threads competing for the processors
 * - a fixed-priority thread that monopolizes a processor until the
 *   fail-safe demotes it
 * - I/O-bound threads blocking on a wait queue set fed by two devices
 *
 * Prints a JSON report of the final thread and processor state.
 *
 * Environment variables:
 * - SCHED_SIM_CPUS: processors (default 2)
 * - SCHED_SIM_MS: simulated milliseconds (default 5000)
 * - plus every SCHED_* configuration override
 */

use ai_os_sched::core::sync::set_default_timeout;
use ai_os_sched::monitoring::init_tracing;
use ai_os_sched::sched::{
    Ast, CalloutQueue, ManualClock, PriShiftSnapshot, ProcessorInfo, RunState, SchedConfig,
    SchedMode, Scheduler, SchedulerStats, ThreadOptions, ThreadSchedInfo, ThreadSpec,
};
use ai_os_sched::waitq::{Event, Interruptible, LinkZone, WaitQueue, WaitQueuePolicy, WaitResult};
use ai_os_sched::{AbsTime, TaskId};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const STEP: AbsTime = 1_000_000;
const IO_EVENT: Event = Event::new(0x10);

/// Device raising an I/O completion every `period`
struct Device {
    queue: Arc<WaitQueue>,
    period: AbsTime,
}

#[derive(Serialize)]
struct Report {
    simulated_ms: u64,
    config: SchedConfig,
    stats: SchedulerStats,
    pri_shifts: PriShiftSnapshot,
    processors: Vec<ProcessorInfo>,
    threads: Vec<ThreadSchedInfo>,
}

fn env_or(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{key} must be an integer, got {value:?}")),
        Err(_) => Ok(default),
    }
}

fn main() -> Result<()> {
    init_tracing();

    let config = SchedConfig::from_env().context("loading scheduler configuration")?;
    let cpus = env_or("SCHED_SIM_CPUS", 2)? as usize;
    let simulated_ms = env_or("SCHED_SIM_MS", 5_000)?;
    let tick_interval = config.tick_interval();

    // process-wide defaults for queues and links created outside a scheduler
    set_default_timeout(config.interlock_timeout());
    LinkZone::global().set_limit(config.link_zone_limit);

    let clock = Arc::new(ManualClock::new(0));
    let timers = Arc::new(CalloutQueue::new());
    let scheduler = Scheduler::builder()
        .with_config(config.clone())
        .with_clock(clock.clone())
        .with_timers(timers.clone())
        .with_processors(cpus)
        .build()
        .context("building scheduler")?;

    info!(cpus, simulated_ms, "simulation starting");

    let mut hogs = (0..cpus + 1)
        .map(|_| scheduler.create_thread(ThreadSpec::new(TaskId::new(1))))
        .collect::<Vec<_>>();
    hogs.push(
        scheduler.create_thread(
            ThreadSpec::new(TaskId::new(1)).options(ThreadOptions::BACKGROUND),
        ),
    );
    let fixed = scheduler.create_thread(
        ThreadSpec::new(TaskId::new(2))
            .priority(50)
            .mode(SchedMode::Fixed),
    );
    let io_threads = (0..2)
        .map(|_| scheduler.create_thread(ThreadSpec::new(TaskId::new(3)).priority(40)))
        .collect::<Vec<_>>();

    let completions = scheduler.wait_queue_set(WaitQueuePolicy::FIFO.with_prepost());
    let devices = [
        Device {
            queue: scheduler.wait_queue(WaitQueuePolicy::FIFO),
            period: 20 * STEP,
        },
        Device {
            queue: scheduler.wait_queue(WaitQueuePolicy::FIFO),
            period: 30 * STEP,
        },
    ];
    for device in &devices {
        completions.link(&device.queue).context("linking device queue")?;
    }

    for thread in hogs.iter().chain([&fixed]).chain(io_threads.iter()) {
        scheduler.thread_setrun(thread);
    }

    let mut next_tick = tick_interval;
    for step in 1..=simulated_ms {
        let now = clock.advance(STEP);
        timers.fire_expired(now);
        if now >= next_tick {
            scheduler.sched_tick();
            next_tick += tick_interval;
        }

        for device in &devices {
            if now % device.period == 0 {
                device.queue.wakeup_one(IO_EVENT, WaitResult::Awakened);
            }
        }

        for processor in scheduler.processors() {
            // I/O threads compute for one step, then wait for a completion
            if let Some(active) = processor.active_thread() {
                if io_threads.iter().any(|io| Arc::ptr_eq(io, &active))
                    && active.run_state() == RunState::Running
                {
                    scheduler.account_cpu(&active, STEP);
                    let result =
                        completions.assert_wait(&active, IO_EVENT, Interruptible::Interruptible, None);
                    if result == WaitResult::Waiting {
                        scheduler.thread_relinquish(&active);
                    }
                }
            }

            if processor.pending_ast().contains(Ast::PREEMPT) {
                scheduler.thread_preempt(processor);
            } else {
                scheduler.thread_select(processor);
            }
        }

        if step % 1_000 == 0 {
            info!(step, stats = ?scheduler.stats(), "simulation progress");
        }
    }

    // let blocked I/O threads go before reporting
    for thread in &io_threads {
        scheduler.thread_interrupt(thread);
    }
    completions.unlink_all();

    let report = Report {
        simulated_ms,
        config: (*scheduler.config()).clone(),
        stats: scheduler.stats(),
        pri_shifts: scheduler.pri_shifts().snapshot(),
        processors: scheduler.processors().iter().map(|p| p.info()).collect(),
        threads: hogs
            .iter()
            .chain([&fixed])
            .chain(io_threads.iter())
            .map(|thread| thread.sched_info())
            .collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing report")?
    );
    Ok(())
}
