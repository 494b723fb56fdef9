/*!
 * Wait Queue Policy
 */

use serde::{Deserialize, Serialize};

/// Wakeup order among waiters of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Arrival order
    Fifo,
    /// Highest scheduled priority first, ties by arrival
    Priority,
}

/// Plain wait queue or a set aggregating other queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Plain,
    Set,
}

/// Creation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaitQueuePolicy {
    pub order: QueueOrder,
    /// Record wakeups that find no waiter (sets only)
    pub prepost: bool,
}

impl WaitQueuePolicy {
    pub const FIFO: Self = Self {
        order: QueueOrder::Fifo,
        prepost: false,
    };

    pub const PRIORITY: Self = Self {
        order: QueueOrder::Priority,
        prepost: false,
    };

    pub const fn with_prepost(self) -> Self {
        Self {
            order: self.order,
            prepost: true,
        }
    }
}

impl Default for WaitQueuePolicy {
    fn default() -> Self {
        Self::FIFO
    }
}
