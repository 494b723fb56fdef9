/*!
 * Core Module
 * Fundamental types, identifiers, errors and low-level synchronization
 */

pub mod errors;
pub mod id;
pub mod sync;
pub mod types;

// Re-export for convenience
pub use errors::*;
pub use id::{LinkId, ProcessorId, QueueId, TaskId, ThreadId};
pub use types::*;
