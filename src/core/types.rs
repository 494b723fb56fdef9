/*!
 * Core Types
 * Common scalar types shared by the scheduler and the wait queues
 */

/// Absolute time in abstract clock units (nanoseconds for the provided clocks)
pub type AbsTime = u64;

/// Scheduling priority, higher is more important
pub type Priority = i32;

/// Scheduler tick counter; wraps
pub type Tick = u32;

/// Convert microseconds from configuration into clock units
#[inline]
pub const fn micros(us: u64) -> AbsTime {
    us.saturating_mul(1_000)
}

/// Convert milliseconds into clock units
#[inline]
pub const fn millis(ms: u64) -> AbsTime {
    ms.saturating_mul(1_000_000)
}
