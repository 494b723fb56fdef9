/*!
 * Dispatch
 *
 * State transitions between runnable, running and waiting. In the hosted
 * kernel a waiting thread is an OS thread parked on its thread's condition
 * variable; `thread_go` is the single place that ends a wait.
 */

use super::processor::{Ast, Processor};
use super::thread::{RunState, Thread, ThreadControl, ThreadGuard};
use super::traits::LedgerAccount;
use super::Scheduler;
use crate::core::types::AbsTime;
use crate::waitq::WaitResult;
use std::sync::Arc;
use tracing::{debug, trace};

impl Scheduler {
    /// Make a thread runnable and queue it
    pub fn thread_setrun(&self, thread: &Arc<Thread>) {
        let mut ctl = thread.lock();
        self.setrun_locked(thread, &mut ctl);
    }

    pub(crate) fn setrun_locked(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl) {
        if matches!(ctl.run_state, RunState::Running) || ctl.on_runq {
            return;
        }
        if self.can_update_priority(ctl) {
            self.update_priority_locked(thread, ctl);
        }
        ctl.run_state = RunState::Runnable;
        ctl.on_runq = true;
        self.runq.enqueue(thread, ctl.sched_priority);
    }

    /// End the current wait of `thread` with `result`
    ///
    /// The caller holds the queue interlock and has already removed the
    /// thread's element. A thread that never left its processor resumes in
    /// place; otherwise it is queued.
    pub(crate) fn thread_go(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl, result: WaitResult) {
        if let Some(timer) = ctl.clear_wait_state() {
            self.timers.cancel(timer);
        }
        ctl.wait_result = result;
        self.stats.inc_wakeups();

        if ctl.processor.is_some() {
            ctl.run_state = RunState::Running;
        } else {
            ctl.run_state = RunState::Idle;
            self.setrun_locked(thread, ctl);
        }
        thread.wakeup.notify_all();
        trace!(thread = %thread.id(), ?result, "wait ended");
    }

    /// Put `thread` on `processor`, displacing any running thread
    pub fn thread_dispatch(&self, processor: &Arc<Processor>, thread: &Arc<Thread>) {
        let previous = processor.state.lock().active_thread.take();
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, thread) {
                self.requeue_preempted(&previous);
            }
        }

        let now = self.now();
        let mut ctl = thread.lock();
        if ctl.on_runq {
            self.runq.dequeue(thread);
            ctl.on_runq = false;
        }
        ctl.run_state = RunState::Running;
        ctl.processor = Some(Arc::downgrade(processor));
        ctl.computation_epoch = now;
        self.thread_quantum_init(&mut ctl);

        let mut state = processor.state.lock();
        state.active_thread = Some(Arc::clone(thread));
        state.current_priority = ctl.sched_priority;
        state.current_mode = ctl.mode;
        state.last_dispatch = now;
        state.quantum_len = ctl.current_quantum;
        state.quantum_end = now.saturating_add(ctl.current_quantum);
        state.timeslice = 1;
        state.pending_ast = Ast::empty();
        let deadline = state.quantum_end;
        self.arm_quantum_timer(processor, &mut state, deadline);
        drop(state);
        drop(ctl);

        self.stats.inc_context_switches();
        trace!(thread = %thread.id(), processor = %processor.id(), "thread dispatched");
    }

    /// Pick the next thread for `processor`
    ///
    /// Keeps the active thread unless a queued thread outranks it or a
    /// preemption is pending. Returns the thread now running, if any.
    pub fn thread_select(&self, processor: &Arc<Processor>) -> Option<Arc<Thread>> {
        let (active, current, preempt) = {
            let state = processor.state.lock();
            (
                state.active_thread.clone(),
                state.current_priority,
                state.pending_ast.contains(Ast::PREEMPT),
            )
        };

        if let Some(active) = active {
            let still_running = active.lock().run_state == RunState::Running;
            let outranked = self
                .runq
                .highest_priority()
                .is_some_and(|highest| highest > current);
            if still_running && !outranked && !preempt {
                return Some(active);
            }
        }

        match self.runq.choose() {
            Some(next) => {
                self.thread_dispatch(processor, &next);
                Some(next)
            }
            None => {
                let state = processor.state.lock();
                state.active_thread.clone()
            }
        }
    }

    /// Act on a pending preemption: requeue the active thread and dispatch
    /// the best runnable one
    pub fn thread_preempt(&self, processor: &Arc<Processor>) -> Option<Arc<Thread>> {
        let current = {
            let mut state = processor.state.lock();
            state.pending_ast.remove(Ast::PREEMPT);
            self.cancel_quantum_timer(&mut state);
            state.active_thread.take()
        };
        if let Some(current) = current {
            self.requeue_preempted(&current);
            self.stats.inc_preemptions();
        }

        let next = self.runq.choose()?;
        self.thread_dispatch(processor, &next);
        Some(next)
    }

    /// Suspend the calling OS thread until the wait `thread` asserted ends
    ///
    /// Returns immediately if the wait already ended.
    pub fn thread_block(&self, thread: &Arc<Thread>) -> WaitResult {
        let mut ctl = thread.lock();
        if !self.relinquish_locked(thread, &mut ctl) {
            return ctl.wait_result;
        }
        while ctl.run_state == RunState::Waiting {
            wait_for_wakeup(thread, &mut ctl);
        }
        ctl.wait_result
    }

    /// Take a thread that asserted a wait off its processor without
    /// suspending the caller
    ///
    /// Returns false if the wait already ended. The wakeup later queues the
    /// thread like any other blocked thread.
    pub fn thread_relinquish(&self, thread: &Arc<Thread>) -> bool {
        let mut ctl = thread.lock();
        self.relinquish_locked(thread, &mut ctl)
    }

    fn relinquish_locked(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl) -> bool {
        if ctl.run_state != RunState::Waiting {
            return false;
        }
        ctl.computation_metered = 0;
        self.leave_processor(thread, ctl);
        true
    }

    /// Retire `thread`: end any wait, take it off the run queue and its
    /// processor, and drop its ledger balances
    ///
    /// The task account is left alone; it outlives its threads.
    pub fn thread_terminate(&self, thread: &Arc<Thread>) {
        self.clear_wait(thread, WaitResult::Restart);
        {
            let mut ctl = thread.lock();
            if ctl.on_runq {
                self.runq.dequeue(thread);
                ctl.on_runq = false;
            }
            self.leave_processor(thread, &mut ctl);
            ctl.run_state = RunState::Idle;
        }
        self.ledger.forget(LedgerAccount::Thread(thread.id()));
        debug!(thread = %thread.id(), "thread terminated");
    }

    /// Charge CPU time consumed outside a full quantum
    pub fn account_cpu(&self, thread: &Arc<Thread>, delta: AbsTime) {
        let mut ctl = thread.lock();
        ctl.cpu_delta = ctl.cpu_delta.saturating_add(delta);
    }

    fn requeue_preempted(&self, thread: &Arc<Thread>) {
        let now = self.now();
        let mut ctl = thread.lock();
        if ctl.run_state != RunState::Running {
            ctl.processor = None;
            return;
        }
        let ran = now.saturating_sub(ctl.computation_epoch);
        ctl.computation_metered = ctl.computation_metered.saturating_add(ran);
        ctl.processor = None;
        ctl.run_state = RunState::Runnable;
        ctl.on_runq = true;
        self.runq.requeue(thread, ctl.sched_priority);
    }

    fn leave_processor(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl) {
        let Some(processor) = ctl.processor.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let mut state = processor.state.lock();
        if state
            .active_thread
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, thread))
        {
            state.active_thread = None;
            self.cancel_quantum_timer(&mut state);
        }
    }
}

fn wait_for_wakeup(thread: &Thread, ctl: &mut ThreadGuard<'_>) {
    thread.wakeup.wait(&mut ctl.guard);
}
