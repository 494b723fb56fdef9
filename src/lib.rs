/*!
 * AI-OS Scheduler Library
 * Priority-decay thread scheduler and wait queue primitives exposed as a library
 */

pub mod core;
pub mod monitoring;
pub mod sched;
pub mod waitq;

// Re-exports
pub use crate::core::errors::{ConfigError, KernResult, WaitQueueError};
pub use crate::core::id::{LinkId, ProcessorId, QueueId, TaskId, ThreadId};
pub use crate::core::types::{AbsTime, Priority, Tick};
pub use monitoring::init_tracing;
pub use sched::{
    CalloutQueue, Clock, ManualClock, Processor, SchedConfig, SchedMode, Scheduler,
    SchedulerBuilder, SchedulerStats, SystemClock, Thread, ThreadOptions, ThreadSpec,
};
pub use waitq::{
    Event, Interruptible, LinkZone, WaitQueue, WaitQueueLink, WaitQueuePolicy, WaitQueueSet,
    WaitResult, WakeResult,
};
