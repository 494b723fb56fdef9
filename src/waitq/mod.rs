/*!
 * Wait Queues
 *
 * Blocking primitives built on the scheduler: threads assert a wait for an
 * event on a queue and are made runnable again by a wakeup, a deadline or an
 * interruption. Sets aggregate the wakeups of many base queues through
 * links, optionally preposting wakeups that found nobody waiting.
 */

mod clear;
pub mod event;
pub mod link;
pub mod policy;
pub mod queue;
pub mod result;
pub mod set;

pub use event::{Event, EVENT_MASK_ALL, EVENT_MASK_BITS};
pub use link::{LinkZone, WaitQueueLink, DEFAULT_LINK_ZONE_LIMIT};
pub use policy::{QueueKind, QueueOrder, WaitQueuePolicy};
pub use queue::{LockedWaitQueue, WaitQueue};
pub use result::{Interruptible, WaitResult, WakeResult};
pub use set::WaitQueueSet;
