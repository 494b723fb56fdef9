/*!
 * Scheduler Tests
 * Priority decay, priority overrides and dispatch on a manual clock
 */

mod common;

use ai_os_sched::sched::{
    CalloutQueue, CpuLedger, LedgerAccount, ManualClock, RunState, SchedMode, Scheduler, BASEPRI_DEFAULT, DEPRESS_PRI, MAX_KERNEL_PRI, MIN_USER_PRI,
    NO_DECAY_SHIFT,
};
use ai_os_sched::{TaskId, ThreadOptions, ThreadSpec};
use common::{Harness, MS};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn test_first_interval_usage_and_priority() {
    let h = Harness::new();
    let thread = h.default_thread();

    h.scheduler.set_pri_shifts(3, 3, 3);
    h.scheduler.advance_tick();
    h.scheduler.account_cpu(&thread, 800);
    h.scheduler.update_priority(&thread);

    let ctl = thread.lock();
    assert_eq!(ctl.usage(), 800);
    assert_eq!(ctl.cpu_usage(), 800);
    assert_eq!(ctl.pri_shift(), 3);
    assert_eq!(ctl.sched_stamp(), 1);
    assert_eq!(ctl.sched_priority(), MIN_USER_PRI);
}

#[test]
fn test_priority_recovers_as_usage_decays() {
    let h = Harness::new();
    let thread = h.default_thread();
    h.scheduler.set_pri_shifts(5, 5, 5);

    h.scheduler.advance_tick();
    h.scheduler.account_cpu(&thread, 800);
    h.scheduler.update_priority(&thread);
    assert_eq!(thread.sched_priority(), BASEPRI_DEFAULT - 25);

    // one idle tick decays by roughly 5/8
    h.scheduler.advance_tick();
    h.scheduler.update_priority(&thread);
    assert_eq!(thread.lock().usage(), 500);
    assert_eq!(thread.sched_priority(), BASEPRI_DEFAULT - 15);

    // a long idle stretch forgets everything
    for _ in 0..40 {
        h.scheduler.advance_tick();
    }
    h.scheduler.update_priority(&thread);
    assert_eq!(thread.lock().usage(), 0);
    assert_eq!(thread.sched_priority(), BASEPRI_DEFAULT);
}

#[test]
fn test_usage_not_accumulated_without_decay() {
    let h = Harness::new();
    let thread = h.default_thread();
    assert_eq!(h.scheduler.pri_shifts().normal(), NO_DECAY_SHIFT);

    h.scheduler.advance_tick();
    h.scheduler.account_cpu(&thread, 10_000);
    h.scheduler.update_priority(&thread);

    let ctl = thread.lock();
    assert_eq!(ctl.usage(), 0);
    assert_eq!(ctl.cpu_usage(), 10_000);
    assert_eq!(ctl.sched_priority(), BASEPRI_DEFAULT);
}

#[test]
fn test_update_at_most_once_per_tick() {
    let h = Harness::new();
    let thread = h.default_thread();

    assert!(!h.scheduler.can_update_priority(&thread.lock()));
    h.scheduler.advance_tick();
    assert!(h.scheduler.can_update_priority(&thread.lock()));
    h.scheduler.update_priority(&thread);
    assert!(!h.scheduler.can_update_priority(&thread.lock()));
}

#[test]
fn test_background_thread_uses_background_shift() {
    let h = Harness::new();
    let background =
        h.thread(ThreadSpec::new(TaskId::new(1)).options(ThreadOptions::BACKGROUND));
    h.scheduler.set_pri_shifts(20, 4, 10);
    h.scheduler.advance_tick();
    h.scheduler.update_priority(&background);
    assert_eq!(background.lock().pri_shift(), 4);
}

#[test]
fn test_set_priority_is_clamped() {
    let h = Harness::new();
    let thread = h.default_thread();

    h.scheduler.set_priority(&thread, 1_000);
    assert_eq!(thread.lock().base_priority(), MAX_KERNEL_PRI);
    h.scheduler.set_priority(&thread, -1_000);
    assert_eq!(thread.sched_priority(), MIN_USER_PRI);
}

#[test]
fn test_priority_change_repositions_queued_thread() {
    let h = Harness::new();
    let first = h.default_thread();
    let second = h.default_thread();
    h.scheduler.thread_setrun(&first);
    h.scheduler.thread_setrun(&second);

    h.scheduler.set_priority(&first, 10);

    let runq = h.scheduler.run_queue();
    assert_eq!(runq.highest_priority(), Some(BASEPRI_DEFAULT));
    let chosen = runq.choose().unwrap();
    assert!(Arc::ptr_eq(&chosen, &second));
    assert_eq!(h.scheduler.stats().runq_repositions, 1);
}

#[test]
fn test_promotion_and_depression() {
    let h = Harness::new();
    let thread = h.default_thread();

    h.scheduler.promote(&thread, 60);
    assert_eq!(thread.sched_priority(), 60);

    // base changes are remembered but do not override the promotion
    h.scheduler.set_priority(&thread, 20);
    assert_eq!(thread.sched_priority(), 60);

    assert!(h.scheduler.unpromote(&thread));
    assert!(!h.scheduler.unpromote(&thread));
    assert_eq!(thread.sched_priority(), 20);

    h.scheduler.depress(&thread);
    assert_eq!(thread.sched_priority(), DEPRESS_PRI);
    h.scheduler.advance_tick();
    h.scheduler.update_priority(&thread);
    assert_eq!(thread.sched_priority(), DEPRESS_PRI);

    assert!(h.scheduler.depress_abort(&thread));
    assert!(!h.scheduler.depress_abort(&thread));
    assert_eq!(thread.sched_priority(), 20);
}

#[test]
fn test_set_mode_fixed_runs_at_base() {
    let h = Harness::new();
    let thread = h.default_thread();
    h.scheduler.set_pri_shifts(0, 0, 0);
    h.scheduler.advance_tick();
    h.scheduler.account_cpu(&thread, 100);
    h.scheduler.update_priority(&thread);
    assert_eq!(thread.sched_priority(), MIN_USER_PRI);

    h.scheduler.set_mode(&thread, SchedMode::Fixed);
    assert_eq!(thread.lock().mode(), SchedMode::Fixed);
    assert_eq!(thread.sched_priority(), BASEPRI_DEFAULT);
}

#[test]
fn test_sched_tick_computes_shifts_from_load() {
    let h = Harness::new();
    let threads: Vec<_> = (0..3).map(|_| h.default_thread()).collect();
    for thread in &threads {
        h.scheduler.thread_setrun(thread);
    }

    let tick = h.scheduler.sched_tick();
    assert_eq!(tick, 1);

    // three runnable threads on one processor: 24 - floor(log2(3))
    let shifts = h.scheduler.pri_shifts().snapshot();
    assert_eq!(shifts.normal, 23);
    assert_eq!(shifts.background, NO_DECAY_SHIFT);
    assert_eq!(shifts.combined, 23);

    for thread in &threads {
        let ctl = thread.lock();
        assert_eq!(ctl.sched_stamp(), 1);
        assert_eq!(ctl.pri_shift(), 23);
    }
    assert_eq!(h.scheduler.stats().ticks, 1);
}

#[test]
fn test_dispatch_and_select_higher_priority() {
    let h = Harness::new();
    let processor = Arc::clone(&h.scheduler.processors()[0]);
    let low = h.thread(ThreadSpec::new(TaskId::new(1)).priority(20));
    let high = h.thread(ThreadSpec::new(TaskId::new(1)).priority(40));

    h.scheduler.thread_setrun(&low);
    let running = h.scheduler.thread_select(&processor).unwrap();
    assert!(Arc::ptr_eq(&running, &low));
    assert_eq!(low.run_state(), RunState::Running);
    assert_eq!(processor.current_priority(), 20);

    h.scheduler.thread_setrun(&high);
    let running = h.scheduler.thread_select(&processor).unwrap();
    assert!(Arc::ptr_eq(&running, &high));
    assert_eq!(low.run_state(), RunState::Runnable);
    assert!(low.lock().on_runq());
    assert_eq!(h.scheduler.stats().context_switches, 2);
}

#[test]
fn test_quantum_timer_drives_expiration() {
    let h = Harness::new();
    let processor = Arc::clone(&h.scheduler.processors()[0]);
    let thread = h.default_thread();
    h.scheduler.thread_setrun(&thread);
    h.scheduler.thread_select(&processor);
    assert_eq!(processor.quantum_end(), 10 * MS);

    assert_eq!(h.run_until(10 * MS), 1);
    assert_eq!(h.scheduler.stats().quantum_expirations, 1);
    assert_eq!(processor.quantum_end(), 20 * MS);

    // same tick: the quantum is folded in without decay
    let ctl = thread.lock();
    assert_eq!(ctl.cpu_delta(), 0);
    assert_eq!(ctl.cpu_usage(), 10 * MS);
    assert_eq!(ctl.last_run_time(), 10 * MS);
    drop(ctl);
    assert_eq!(h.scheduler.stats().lightweight_updates, 1);
}

#[test]
fn test_terminate_releases_thread_ledger() {
    let clock = Arc::new(ManualClock::new(0));
    let timers = Arc::new(CalloutQueue::new());
    let ledger = Arc::new(CpuLedger::new());
    let scheduler = Scheduler::builder()
        .with_clock(clock.clone())
        .with_timers(timers.clone())
        .with_ledger(ledger.clone())
        .build()
        .unwrap();
    let processor = Arc::clone(&scheduler.processors()[0]);
    let thread = scheduler.create_thread(ThreadSpec::new(TaskId::new(5)));
    let queued = scheduler.create_thread(ThreadSpec::new(TaskId::new(5)));

    scheduler.thread_setrun(&thread);
    scheduler.thread_select(&processor);
    clock.set(10 * MS);
    timers.fire_expired(10 * MS);
    assert_eq!(ledger.cpu_time(LedgerAccount::Thread(thread.id())), 10 * MS);

    scheduler.thread_setrun(&queued);
    scheduler.thread_terminate(&thread);
    scheduler.thread_terminate(&queued);

    assert!(processor.active_thread().is_none());
    assert!(scheduler.run_queue().snapshot().is_empty());
    assert_eq!(ledger.cpu_time(LedgerAccount::Thread(thread.id())), 0);
    assert_eq!(ledger.cpu_time(LedgerAccount::Task(TaskId::new(5))), 10 * MS);
    assert_eq!(ledger.accounts(), 1);
}

#[test]
fn test_preempt_switches_to_higher_priority() {
    let h = Harness::new();
    let processor = Arc::clone(&h.scheduler.processors()[0]);
    let low = h.thread(ThreadSpec::new(TaskId::new(1)).priority(20));
    let high = h.thread(ThreadSpec::new(TaskId::new(1)).priority(40));

    h.scheduler.thread_dispatch(&processor, &low);
    h.scheduler.thread_setrun(&high);
    h.run_until(10 * MS);

    let next = h.scheduler.thread_preempt(&processor).unwrap();
    assert!(Arc::ptr_eq(&next, &high));
    assert_eq!(h.scheduler.stats().preemptions, 1);
    assert!(Arc::ptr_eq(&processor.active_thread().unwrap(), &high));
}
