/*!
 * Wait Events
 *
 * An event is an opaque word naming what a waiter waits for, usually the
 * address of the object being waited on. Queues keep a compact mask of the
 * events they hold as a pre-check before scanning their elements.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Significant bits of the per-queue event mask
pub const EVENT_MASK_BITS: u32 = usize::BITS - 4;

/// Mask value matching every event; used while a queue has links
pub const EVENT_MASK_ALL: usize = (1usize << EVENT_MASK_BITS) - 1;

/// Abstract event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(pub u64);

impl Event {
    /// No event; recorded on threads that are not waiting
    pub const NONE: Event = Event(0);

    #[inline(always)]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Event named by the address of `object`
    #[inline]
    pub fn of<T: ?Sized>(object: &T) -> Self {
        Self(object as *const T as *const () as usize as u64)
    }

    /// Bits this event contributes to a queue's mask
    #[inline(always)]
    pub fn mask(self) -> usize {
        (self.0 as usize) & EVENT_MASK_ALL
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Whether `mask` may contain `event`
#[inline(always)]
pub(crate) fn mask_may_contain(mask: usize, event: Event) -> bool {
    let bits = event.mask();
    mask & bits == bits
}
