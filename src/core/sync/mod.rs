/*!
 * Synchronization Primitives
 * Ranked interlocks for the wait queue and scheduler lock hierarchy
 */

pub mod interlock;
pub mod lock_rank;

pub use interlock::{current_cpu_tag, default_timeout, set_default_timeout, Interlock, InterlockGuard};
pub use lock_rank::LockRank;
