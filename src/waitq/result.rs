/*!
 * Wait and Wake Results
 */

use serde::{Deserialize, Serialize};

/// Outcome of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitResult {
    /// Enqueued; the caller should block
    Waiting,
    /// Woken by an explicit wakeup or a consumed prepost
    Awakened,
    /// The deadline passed first
    TimedOut,
    /// Interrupted by `thread_interrupt`
    Interrupted,
    /// The waited-on object went away; retry the operation
    Restart,
}

/// Whether a wait may be ended by interruption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interruptible {
    #[default]
    Uninterruptible,
    /// Ended by `thread_interrupt`
    Interruptible,
    /// Ended by `thread_interrupt` and also by `thread_abort_safely`
    Abortsafe,
}

impl Interruptible {
    /// Whether `thread_interrupt` may end the wait
    #[inline]
    pub fn allows_interrupt(self) -> bool {
        !matches!(self, Interruptible::Uninterruptible)
    }

    /// Whether `thread_abort_safely` may end the wait
    #[inline]
    pub fn allows_safe_abort(self) -> bool {
        matches!(self, Interruptible::Abortsafe)
    }
}

/// Result of a wake operation
///
/// Compact representation (single usize) for efficient returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    /// Successfully woke N waiters (N >= 1)
    Woken(usize),
    /// No waiters were waiting
    NoWaiters,
}

impl WakeResult {
    #[inline(always)]
    pub fn from_count(count: usize) -> Self {
        if count == 0 {
            WakeResult::NoWaiters
        } else {
            WakeResult::Woken(count)
        }
    }

    /// Check if any waiters were woken
    #[inline(always)]
    pub fn is_woken(&self) -> bool {
        matches!(self, WakeResult::Woken(_))
    }

    /// Get number of woken waiters (0 if none)
    #[inline(always)]
    pub fn count(&self) -> usize {
        match self {
            WakeResult::Woken(n) => *n,
            WakeResult::NoWaiters => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_result() {
        assert_eq!(WakeResult::from_count(0), WakeResult::NoWaiters);
        assert_eq!(WakeResult::from_count(3).count(), 3);
        assert!(WakeResult::Woken(1).is_woken());
        assert!(!WakeResult::NoWaiters.is_woken());
    }

    #[test]
    fn test_interruptible() {
        assert!(!Interruptible::Uninterruptible.allows_interrupt());
        assert!(Interruptible::Interruptible.allows_interrupt());
        assert!(Interruptible::Abortsafe.allows_interrupt());
        assert!(Interruptible::Abortsafe.allows_safe_abort());
        assert!(!Interruptible::Interruptible.allows_safe_abort());
        assert!(!Interruptible::Uninterruptible.allows_safe_abort());
    }
}
