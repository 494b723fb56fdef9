/*!
 * Wait Queue Sets
 *
 * A set is a wait queue of kind `Set` that also receives wakeups posted on
 * the base queues linked into it. A thread waiting on a set is woken by an
 * event on any member. With the prepost policy, a wakeup that reaches the
 * set while nobody waits is remembered and satisfies the next matching
 * `assert_wait` on the set immediately.
 */

use super::link::{LinkZone, WaitQueueLink};
use super::policy::{QueueKind, WaitQueuePolicy};
use super::queue::WaitQueue;
use crate::core::errors::{KernResult, WaitQueueError};
use crate::core::sync::default_timeout;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Handle to a wait queue set
///
/// Derefs to the set's own queue, so waits and wakeups are issued on it
/// exactly as on a plain queue.
#[derive(Clone)]
pub struct WaitQueueSet {
    queue: Arc<WaitQueue>,
    zone: Arc<LinkZone>,
}

impl WaitQueueSet {
    /// Initialize a set allocating links from the global zone
    pub fn new(policy: WaitQueuePolicy) -> Self {
        Self::with_zone(policy, Arc::clone(LinkZone::global()))
    }

    /// Allocate a dynamically created set
    pub fn alloc(policy: WaitQueuePolicy) -> Self {
        Self::new(policy)
    }

    /// Set allocating its links from `zone`
    pub fn with_zone(policy: WaitQueuePolicy, zone: Arc<LinkZone>) -> Self {
        Self::with_limits(policy, zone, default_timeout())
    }

    /// Set allocating links from `zone` with an interlock timeout of `timeout`
    pub fn with_limits(policy: WaitQueuePolicy, zone: Arc<LinkZone>, timeout: Duration) -> Self {
        Self {
            queue: WaitQueue::build(QueueKind::Set, policy, timeout),
            zone,
        }
    }

    #[inline]
    pub fn queue(&self) -> &Arc<WaitQueue> {
        &self.queue
    }

    pub fn zone(&self) -> &Arc<LinkZone> {
        &self.zone
    }

    /// Release a set with no waiters and no members
    pub fn free(self) -> KernResult<()> {
        let elements = {
            let state = self.queue.state.lock();
            state.elements.len() + state.members.len()
        };
        if elements > 0 {
            return Err(WaitQueueError::NotEmpty {
                queue: self.queue.id(),
                elements,
            });
        }
        debug!(set = %self.queue.id(), "wait queue set freed");
        Ok(())
    }

    /// Link `base` into this set with a link allocated from the set's zone
    pub fn link(&self, base: &Arc<WaitQueue>) -> KernResult<()> {
        let link = WaitQueueLink::alloc_in(&self.zone)?;
        self.link_noalloc(base, &link)
    }

    /// Link `base` into this set using a caller-allocated `link`
    pub fn link_noalloc(&self, base: &Arc<WaitQueue>, link: &Arc<WaitQueueLink>) -> KernResult<()> {
        if base.is_set() {
            return Err(WaitQueueError::InvalidArgument(
                "a wait queue set cannot be linked as a base queue",
            ));
        }

        let mut base_locked = base.lock();
        let mut set_locked = self.queue.lock();
        if base_locked.state.link_position(&self.queue).is_some() {
            return Err(WaitQueueError::AlreadyInSet {
                queue: base.id(),
                set: self.queue.id(),
            });
        }
        link.bind(base, &self.queue)?;
        base_locked.state.push_link(Arc::clone(link));
        set_locked.state.members.push(Arc::clone(link));

        debug!(queue = %base.id(), set = %self.queue.id(), link = %link.id(), "linked");
        Ok(())
    }

    /// Remove the link between `base` and this set and free it
    pub fn unlink(&self, base: &Arc<WaitQueue>) -> KernResult<()> {
        self.unlink_nofree(base).map(drop)
    }

    /// Remove the link between `base` and this set and hand it back
    pub fn unlink_nofree(&self, base: &Arc<WaitQueue>) -> KernResult<Arc<WaitQueueLink>> {
        let mut base_locked = base.lock();
        let mut set_locked = self.queue.lock();
        let not_in_set = || WaitQueueError::NotInSet {
            queue: base.id(),
            set: self.queue.id(),
        };

        let index = base_locked
            .state
            .link_position(&self.queue)
            .ok_or_else(not_in_set)?;
        let link = match base_locked.state.remove_at(index) {
            Some(super::queue::WaitElement::Link(link)) => link,
            _ => return Err(not_in_set()),
        };
        set_locked.state.forget_member(&link);
        link.unbind();

        debug!(queue = %base.id(), set = %self.queue.id(), link = %link.id(), "unlinked");
        Ok(link)
    }

    /// Unlink every member queue; returns how many were unlinked
    pub fn unlink_all(&self) -> usize {
        let mut unlinked = 0;
        loop {
            let Some(link) = self.queue.state.lock().members.first().cloned() else {
                break;
            };

            let Some(base) = link.base_queue() else {
                // base already dropped together with its element list
                self.queue.state.lock().forget_member(&link);
                link.unbind();
                unlinked += 1;
                continue;
            };

            let mut base_locked = base.lock();
            let mut set_locked = self.queue.lock();
            let still_member = set_locked
                .state
                .members
                .iter()
                .any(|member| Arc::ptr_eq(member, &link));
            if !still_member || !link.joins_base(&base) {
                // unlinked concurrently
                continue;
            }
            if let Some(index) = base_locked.state.link_position(&self.queue) {
                base_locked.state.remove_at(index);
            }
            set_locked.state.forget_member(&link);
            link.unbind();
            unlinked += 1;
        }
        if unlinked > 0 {
            debug!(set = %self.queue.id(), unlinked, "set unlinked from all members");
        }
        unlinked
    }

    /// Whether `base` is linked into this set
    pub fn member(&self, base: &Arc<WaitQueue>) -> bool {
        base.state.lock().link_position(&self.queue).is_some()
    }

    /// Number of member queues
    pub fn link_count(&self) -> usize {
        self.queue.state.lock().members.len()
    }

    /// Outstanding preposts
    pub fn prepost_count(&self) -> usize {
        self.queue.state.lock().preposts.len()
    }

    /// Whether a wakeup on `base` is preposted on this set
    pub fn is_preposted(&self, base: &Arc<WaitQueue>) -> bool {
        self.queue
            .state
            .lock()
            .preposts
            .iter()
            .any(|prepost| prepost.link.joins_base(base))
    }
}

impl Deref for WaitQueueSet {
    type Target = Arc<WaitQueue>;

    fn deref(&self) -> &Arc<WaitQueue> {
        &self.queue
    }
}

impl fmt::Debug for WaitQueueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueueSet")
            .field("id", &self.queue.id())
            .field("policy", &self.queue.policy())
            .finish()
    }
}

impl WaitQueue {
    /// Unlink this base queue from every set; returns how many
    pub fn unlink_all(self: &Arc<Self>) -> usize {
        let mut locked = self.lock();
        let mut unlinked = 0;
        let mut index = 0;
        while index < locked.state.elements.len() {
            let link = match &locked.state.elements[index] {
                super::queue::WaitElement::Link(link) => Arc::clone(link),
                super::queue::WaitElement::Thread(_) => {
                    index += 1;
                    continue;
                }
            };
            if let Some(set) = link.set_queue() {
                set.lock().state.forget_member(&link);
            }
            locked.state.remove_at(index);
            link.unbind();
            unlinked += 1;
        }
        if unlinked > 0 {
            debug!(queue = %self.id(), unlinked, "queue unlinked from all sets");
        }
        unlinked
    }
}
