/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use crate::core::id::{LinkId, QueueId};
use miette::Diagnostic;
use thiserror::Error;

/// Expected negative outcomes and resource failures of wait queue, set and
/// link operations. Invariant violations are not represented here; they panic.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum WaitQueueError {
    #[error("wait queue {queue} is not linked into set {set}")]
    #[diagnostic(
        code(waitq::not_in_set),
        help("The link was already removed. Treat the caller's reference as stale.")
    )]
    NotInSet { queue: QueueId, set: QueueId },

    #[error("wait queue {queue} is already linked into set {set}")]
    #[diagnostic(
        code(waitq::already_in_set),
        help("Check membership with `member` before linking.")
    )]
    AlreadyInSet { queue: QueueId, set: QueueId },

    #[error("no wait queue link objects available ({live} live, limit {limit})")]
    #[diagnostic(
        code(waitq::resource_shortage),
        help("Unlink unused sets or raise `link_zone_limit`.")
    )]
    ResourceShortage { live: usize, limit: usize },

    #[error("wait queue {queue} still has {elements} waiters or links")]
    #[diagnostic(
        code(waitq::not_empty),
        help("Wake all waiters and unlink the queue from every set before freeing it.")
    )]
    NotEmpty { queue: QueueId, elements: usize },

    #[error("link {0} is already bound to a queue")]
    #[diagnostic(code(waitq::link_in_use), help("Links join exactly one queue to one set."))]
    LinkInUse(LinkId),

    #[error("invalid argument: {0}")]
    #[diagnostic(code(waitq::invalid_argument))]
    InvalidArgument(&'static str),
}

/// Configuration loading and validation errors
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read scheduler config {path}: {source}")]
    #[diagnostic(code(config::io), help("Check the SCHED_CONFIG path."))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scheduler config: {0}")]
    #[diagnostic(code(config::parse), help("The file must be a JSON object of SchedConfig fields."))]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    #[diagnostic(code(config::invalid_override))]
    Override { key: &'static str, value: String },

    #[error("invalid scheduler config: {0}")]
    #[diagnostic(code(config::invalid))]
    Invalid(String),
}

/// Result type for wait queue operations
pub type KernResult<T> = Result<T, WaitQueueError>;
