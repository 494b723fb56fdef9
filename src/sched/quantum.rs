/*!
 * Quantum Expiration
 *
 * Runs when the active thread of a processor uses up its quantum: charge the
 * quantum, enforce the fail-safe on fixed-priority threads, age priority,
 * start the next quantum, and decide whether the processor should preempt.
 */

use super::processor::{Ast, Processor, ProcessorState};
use super::thread::{SchedFlags, SchedMode, Thread, ThreadControl, ThreadOptions};
use super::traits::{LedgerAccount, LedgerKind};
use super::Scheduler;
use crate::core::types::{AbsTime, Priority};
use std::sync::{Arc, Weak};
use tracing::trace;

impl Scheduler {
    /// Quantum expiration for `thread` running on `processor`
    pub fn quantum_expire(&self, thread: &Arc<Thread>, processor: &Arc<Processor>) {
        let config = self.config();
        let (quantum_len, quantum_end) = {
            let state = processor.state.lock();
            (state.quantum_len, state.quantum_end)
        };

        // ledgers take their own locks; charge before the thread lock
        self.ledger.credit(
            LedgerAccount::Thread(thread.id()),
            LedgerKind::CpuTime,
            quantum_len,
        );
        self.ledger.credit(
            LedgerAccount::Task(thread.task()),
            LedgerKind::CpuTime,
            quantum_len,
        );

        let mut ctl = thread.lock();
        self.stats.inc_quantum_expirations();
        ctl.last_run_time = quantum_end;
        ctl.cpu_delta = ctl.cpu_delta.saturating_add(quantum_len);

        if ctl.mode.is_fixed_priority()
            && !ctl.flags.contains(SchedFlags::PROMOTED)
            && !thread.options().contains(ThreadOptions::SYSTEM_CRITICAL)
        {
            let computation = quantum_end
                .saturating_sub(ctl.computation_epoch)
                .saturating_add(ctl.computation_metered);
            if computation > config.max_unsafe_computation() {
                let release_at = quantum_end.saturating_add(config.safe_duration());
                self.failsafe_trip(thread, &mut ctl, release_at);
            }
        }

        if self.can_update_priority(&ctl) {
            self.update_priority_locked(thread, &mut ctl);
        } else {
            self.lightweight_update_locked(thread, &mut ctl);
        }

        self.thread_quantum_init(&mut ctl);
        ctl.precise_accounting = config.precise_accounting;

        let now = self.now();
        let deadline = now.saturating_add(ctl.current_quantum);
        {
            let mut state = processor.state.lock();
            state.current_priority = ctl.sched_priority;
            state.current_mode = ctl.mode;
            state.quantum_len = ctl.current_quantum;
            state.quantum_end = deadline;
            state.timeslice = state.timeslice.saturating_sub(1);
            state.pending_ast.remove(Ast::QUANTUM);
            self.arm_quantum_timer(processor, &mut state, deadline);
        }
        let current = ctl.sched_priority;
        drop(ctl);

        self.check_preemption(processor, current);
        trace!(thread = %thread.id(), processor = %processor.id(), deadline, "quantum expired");
    }

    /// Load the next quantum for the thread's mode
    pub(crate) fn thread_quantum_init(&self, ctl: &mut ThreadControl) {
        ctl.current_quantum = match ctl.mode {
            SchedMode::Realtime if ctl.realtime_computation > 0 => ctl.realtime_computation,
            _ => self.config().std_quantum(),
        };
    }

    /// Request preemption if a runnable thread outranks the current one,
    /// otherwise refresh the processor set hints
    pub(crate) fn check_preemption(&self, processor: &Arc<Processor>, current: Priority) -> bool {
        let highest = self.runq.highest_priority();
        let load = self.runq.load();
        let mut state = processor.state.lock();

        let preempt = match highest {
            Some(highest) => {
                highest > current || (highest == current && state.timeslice == 0)
            }
            None => false,
        };

        if preempt {
            state.pending_ast.insert(Ast::PREEMPT);
            true
        } else {
            drop(state);
            let pset = processor.processor_set();
            pset.note_priority(processor.id(), current);
            pset.note_count(processor.id(), load.total);
            false
        }
    }

    /// Replace the processor's quantum timer
    pub(crate) fn arm_quantum_timer(
        &self,
        processor: &Arc<Processor>,
        state: &mut ProcessorState,
        deadline: AbsTime,
    ) {
        if let Some(handle) = state.quantum_timer.take() {
            self.timers.cancel(handle);
        }
        state.quantum_generation = state.quantum_generation.wrapping_add(1);

        let generation = state.quantum_generation;
        let scheduler = self.this.clone();
        let target = Arc::downgrade(processor);
        state.quantum_timer = Some(self.timers.arm(
            deadline,
            Box::new(move |_| quantum_timer_fired(&scheduler, &target, generation)),
        ));
    }

    pub(crate) fn cancel_quantum_timer(&self, state: &mut ProcessorState) {
        if let Some(handle) = state.quantum_timer.take() {
            self.timers.cancel(handle);
        }
        state.quantum_generation = state.quantum_generation.wrapping_add(1);
    }
}

fn quantum_timer_fired(scheduler: &Weak<Scheduler>, processor: &Weak<Processor>, generation: u64) {
    let (Some(scheduler), Some(processor)) = (scheduler.upgrade(), processor.upgrade()) else {
        return;
    };

    let active = {
        let mut state = processor.state.lock();
        if state.quantum_generation != generation {
            return;
        }
        state.quantum_timer = None;
        state.pending_ast.insert(Ast::QUANTUM);
        state.active_thread.clone()
    };

    if let Some(thread) = active {
        scheduler.quantum_expire(&thread, &processor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::TaskId;
    use crate::sched::priority::BASEPRI_DEFAULT;
    use crate::sched::thread::ThreadSpec;
    use crate::sched::traits::MockLedger;
    use crate::sched::ManualClock;

    #[test]
    fn test_quantum_expire_credits_thread_and_task() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_credit()
            .withf(|account, kind, amount| {
                matches!(account, LedgerAccount::Thread(_))
                    && *kind == LedgerKind::CpuTime
                    && *amount == 10_000_000
            })
            .times(1)
            .return_const(());
        ledger
            .expect_credit()
            .withf(|account, _, amount| {
                *account == LedgerAccount::Task(TaskId::new(3)) && *amount == 10_000_000
            })
            .times(1)
            .return_const(());

        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Scheduler::builder()
            .with_clock(clock.clone())
            .with_ledger(Arc::new(ledger))
            .build()
            .unwrap();
        let thread = scheduler.create_thread(ThreadSpec::new(TaskId::new(3)));
        let processor = Arc::clone(&scheduler.processors()[0]);

        scheduler.thread_dispatch(&processor, &thread);
        clock.advance(10_000_000);
        scheduler.quantum_expire(&thread, &processor);

        let ctl = thread.lock();
        assert_eq!(ctl.last_run_time(), 10_000_000);
        assert_eq!(processor.quantum_end(), 20_000_000);
    }

    #[test]
    fn test_preemption_requested_for_higher_priority() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Scheduler::builder().with_clock(clock.clone()).build().unwrap();
        let running = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)).priority(20));
        let waiting = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)).priority(40));
        let processor = Arc::clone(&scheduler.processors()[0]);

        scheduler.thread_dispatch(&processor, &running);
        scheduler.thread_setrun(&waiting);
        clock.advance(10_000_000);
        scheduler.quantum_expire(&running, &processor);

        assert!(processor.pending_ast().contains(Ast::PREEMPT));
    }

    #[test]
    fn test_equal_priority_waits_for_first_timeslice() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Scheduler::builder().with_clock(clock.clone()).build().unwrap();
        let running = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)).mode(SchedMode::Fixed));
        let peer = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)).mode(SchedMode::Fixed));
        let processor = Arc::clone(&scheduler.processors()[0]);

        scheduler.thread_dispatch(&processor, &running);
        scheduler.thread_setrun(&peer);
        assert!(processor.in_first_timeslice());
        assert!(!scheduler.check_preemption(&processor, BASEPRI_DEFAULT));

        clock.advance(10_000_000);
        scheduler.quantum_expire(&running, &processor);
        assert!(!processor.in_first_timeslice());
        assert!(processor.pending_ast().contains(Ast::PREEMPT));
    }
}
