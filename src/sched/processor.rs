/*!
 * Processors and Processor Sets
 *
 * Per-processor dispatch state: the active thread, its quantum, and pending
 * asynchronous traps. The state lock is a leaf and may be taken while a
 * thread lock is held, never the other way around.
 */

use super::thread::{SchedMode, Thread};
use super::traits::TimerHandle;
use crate::core::id::ProcessorId;
use crate::core::types::{AbsTime, Priority};
use bitflags::bitflags;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

bitflags! {
    /// Asynchronous traps pending on a processor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Ast: u32 {
        /// A higher priority thread is runnable
        const PREEMPT = 1 << 0;
        /// The active thread's quantum expired
        const QUANTUM = 1 << 1;
    }
}

/// Dispatch state guarded by the processor lock
pub struct ProcessorState {
    pub(crate) active_thread: Option<Arc<Thread>>,
    pub(crate) current_priority: Priority,
    pub(crate) current_mode: SchedMode,
    pub(crate) last_dispatch: AbsTime,
    pub(crate) quantum_end: AbsTime,
    pub(crate) quantum_len: AbsTime,
    /// Non-zero while the active thread is in its first timeslice
    pub(crate) timeslice: u32,
    pub(crate) pending_ast: Ast,
    pub(crate) quantum_timer: Option<TimerHandle>,
    pub(crate) quantum_generation: u64,
}

impl ProcessorState {
    fn idle() -> Self {
        Self {
            active_thread: None,
            current_priority: super::priority::MIN_PRI,
            current_mode: SchedMode::Timeshare,
            last_dispatch: 0,
            quantum_end: 0,
            quantum_len: 0,
            timeslice: 0,
            pending_ast: Ast::empty(),
            quantum_timer: None,
            quantum_generation: 0,
        }
    }
}

/// One CPU
pub struct Processor {
    id: ProcessorId,
    pset: Arc<ProcessorSet>,
    pub(crate) state: Mutex<ProcessorState>,
}

impl Processor {
    pub(crate) fn new(id: ProcessorId, pset: Arc<ProcessorSet>) -> Self {
        Self {
            id,
            pset,
            state: Mutex::new(ProcessorState::idle()),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn processor_set(&self) -> &Arc<ProcessorSet> {
        &self.pset
    }

    pub fn active_thread(&self) -> Option<Arc<Thread>> {
        self.state.lock().active_thread.clone()
    }

    pub fn current_priority(&self) -> Priority {
        self.state.lock().current_priority
    }

    pub fn quantum_end(&self) -> AbsTime {
        self.state.lock().quantum_end
    }

    pub fn in_first_timeslice(&self) -> bool {
        self.state.lock().timeslice > 0
    }

    pub fn pending_ast(&self) -> Ast {
        self.state.lock().pending_ast
    }

    /// Consume pending traps
    pub fn take_ast(&self) -> Ast {
        std::mem::take(&mut self.state.lock().pending_ast)
    }

    pub fn info(&self) -> ProcessorInfo {
        let state = self.state.lock();
        ProcessorInfo {
            id: self.id,
            active_thread: state.active_thread.as_ref().map(|thread| thread.id().as_u64()),
            current_priority: state.current_priority,
            current_mode: state.current_mode,
            last_dispatch: state.last_dispatch,
            quantum_end: state.quantum_end,
            preempt_pending: state.pending_ast.contains(Ast::PREEMPT),
        }
    }
}

/// Serializable view of a processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorInfo {
    pub id: ProcessorId,
    pub active_thread: Option<u64>,
    pub current_priority: Priority,
    pub current_mode: SchedMode,
    pub last_dispatch: AbsTime,
    pub quantum_end: AbsTime,
    pub preempt_pending: bool,
}

/// Placement hints: the processor running the lowest priority thread and
/// the processor with the shortest run queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PsetHints {
    pub low_priority: Option<(ProcessorId, Priority)>,
    pub low_count: Option<(ProcessorId, usize)>,
}

/// Group of processors sharing a run queue
#[derive(Default)]
pub struct ProcessorSet {
    hints: Mutex<PsetHints>,
}

impl ProcessorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hints(&self) -> PsetHints {
        *self.hints.lock()
    }

    /// Record `processor` running at `priority`
    pub fn note_priority(&self, processor: ProcessorId, priority: Priority) {
        let mut hints = self.hints.lock();
        match hints.low_priority {
            Some((current, _)) if current == processor => {
                hints.low_priority = Some((processor, priority));
            }
            Some((_, low)) if low <= priority => {}
            _ => hints.low_priority = Some((processor, priority)),
        }
    }

    /// Record `processor` seeing `count` runnable threads
    pub fn note_count(&self, processor: ProcessorId, count: usize) {
        let mut hints = self.hints.lock();
        match hints.low_count {
            Some((current, _)) if current == processor => {
                hints.low_count = Some((processor, count));
            }
            Some((_, low)) if low <= count => {}
            _ => hints.low_count = Some((processor, count)),
        }
    }
}
