/*!
 * Wait Queue
 *
 * An ordered list of elements guarded by an interlock. An element is either
 * a thread waiting for an event or a link feeding a wait queue set. Wakeups
 * scan in list order, so FIFO queues append and priority queues insert
 * before the first lower-priority thread. A priority queue still picks its
 * direct waiter by current scheduled priority, since promotion and
 * depression change it while the thread waits.
 *
 * # Lock order
 *
 * ```text
 * queue interlock -> set interlock -> thread lock
 * ```
 *
 * A wakeup holds the queue interlock, takes the thread lock of the waiter it
 * removes, and ends the wait with `Scheduler::thread_go`. Paths starting
 * from a thread (timeouts, interruption) read the queue under the thread
 * lock, release it, then lock queue and thread in order and revalidate the
 * wait generation.
 */

use super::clear::arm_wait_timeout;
use super::event::{mask_may_contain, Event, EVENT_MASK_ALL};
use super::link::WaitQueueLink;
use super::policy::{QueueKind, QueueOrder, WaitQueuePolicy};
use super::result::{Interruptible, WaitResult, WakeResult};
use crate::core::errors::{KernResult, WaitQueueError};
use crate::core::id::{QueueId, QUEUE_IDS};
use crate::core::sync::{default_timeout, Interlock, InterlockGuard, LockRank};
use crate::core::types::{AbsTime, Priority};
use crate::sched::thread::{RunState, Thread, ThreadControl};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A thread blocked on a queue
pub(crate) struct ThreadWaiter {
    pub(crate) thread: Arc<Thread>,
    pub(crate) event: Event,
    /// Scheduled priority when the wait began; orders insertion only
    pub(crate) priority: Priority,
}

/// Queue element
pub(crate) enum WaitElement {
    Thread(ThreadWaiter),
    Link(Arc<WaitQueueLink>),
}

impl WaitElement {
    #[inline]
    fn is_thread(&self, thread: &Arc<Thread>) -> bool {
        matches!(self, WaitElement::Thread(waiter) if Arc::ptr_eq(&waiter.thread, thread))
    }
}

/// Event that reached a prepost-capable set with nobody waiting
pub(crate) struct Prepost {
    pub(crate) link: Arc<WaitQueueLink>,
    pub(crate) event: Event,
}

/// State guarded by the interlock
#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) event_mask: usize,
    pub(crate) elements: VecDeque<WaitElement>,
    /// Link elements on this (base) queue
    pub(crate) links: usize,
    /// Links feeding this set
    pub(crate) members: Vec<Arc<WaitQueueLink>>,
    pub(crate) preposts: VecDeque<Prepost>,
}

impl QueueState {
    fn insert_waiter(&mut self, waiter: ThreadWaiter, order: QueueOrder) {
        if self.links == 0 {
            self.event_mask |= waiter.event.mask();
        }
        let position = match order {
            QueueOrder::Fifo => None,
            QueueOrder::Priority => self.elements.iter().position(|element| {
                matches!(element, WaitElement::Thread(queued) if queued.priority < waiter.priority)
            }),
        };
        match position {
            Some(index) => self.elements.insert(index, WaitElement::Thread(waiter)),
            None => self.elements.push_back(WaitElement::Thread(waiter)),
        }
    }

    pub(crate) fn push_link(&mut self, link: Arc<WaitQueueLink>) {
        self.elements.push_back(WaitElement::Link(link));
        self.links += 1;
        self.event_mask = EVENT_MASK_ALL;
    }

    /// Remove the element at `index`, keeping the mask consistent
    pub(crate) fn remove_at(&mut self, index: usize) -> Option<WaitElement> {
        let element = self.elements.remove(index)?;
        if let WaitElement::Link(_) = element {
            self.links -= 1;
            if self.links == 0 {
                self.rebuild_mask();
            }
        }
        if self.elements.is_empty() {
            self.event_mask = 0;
        }
        Some(element)
    }

    fn rebuild_mask(&mut self) {
        self.event_mask = self
            .elements
            .iter()
            .fold(0, |mask, element| match element {
                WaitElement::Thread(waiter) => mask | waiter.event.mask(),
                WaitElement::Link(_) => EVENT_MASK_ALL,
            });
    }

    /// Position of the link joining this base queue to `set`
    pub(crate) fn link_position(&self, set: &Arc<WaitQueue>) -> Option<usize> {
        self.elements.iter().position(
            |element| matches!(element, WaitElement::Link(link) if link.joins_set(set)),
        )
    }

    /// Drop every set-side reference to `link`
    pub(crate) fn forget_member(&mut self, link: &Arc<WaitQueueLink>) {
        self.members.retain(|member| !Arc::ptr_eq(member, link));
        self.preposts.retain(|prepost| !Arc::ptr_eq(&prepost.link, link));
    }

    fn record_prepost(&mut self, link: &Arc<WaitQueueLink>, event: Event) {
        let recorded = self
            .preposts
            .iter()
            .any(|prepost| Arc::ptr_eq(&prepost.link, link) && prepost.event == event);
        if !recorded {
            self.preposts.push_back(Prepost {
                link: Arc::clone(link),
                event,
            });
        }
    }

    fn consume_prepost(&mut self, event: Event) -> bool {
        match self.preposts.iter().position(|prepost| prepost.event == event) {
            Some(index) => {
                self.preposts.remove(index);
                true
            }
            None => false,
        }
    }

    fn waiter_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|element| matches!(element, WaitElement::Thread(_)))
            .count()
    }
}

/// Wait queue or, with `QueueKind::Set`, the queue part of a set
pub struct WaitQueue {
    id: QueueId,
    kind: QueueKind,
    policy: WaitQueuePolicy,
    pub(crate) state: Interlock<QueueState>,
}

impl WaitQueue {
    /// Initialize a plain wait queue
    pub fn new(policy: WaitQueuePolicy) -> Arc<Self> {
        Self::build(QueueKind::Plain, policy, default_timeout())
    }

    /// Allocate a dynamically created wait queue
    pub fn alloc(policy: WaitQueuePolicy) -> Arc<Self> {
        let queue = Self::new(policy);
        trace!(queue = %queue.id, ?policy, "wait queue allocated");
        queue
    }

    /// Plain queue whose interlock aborts after `timeout` of contention
    pub fn with_timeout(policy: WaitQueuePolicy, timeout: Duration) -> Arc<Self> {
        Self::build(QueueKind::Plain, policy, timeout)
    }

    pub(crate) fn build(kind: QueueKind, policy: WaitQueuePolicy, timeout: Duration) -> Arc<Self> {
        let id: QueueId = QUEUE_IDS.next();
        let rank = match kind {
            QueueKind::Plain => LockRank::WaitQueue,
            QueueKind::Set => LockRank::WaitQueueSet,
        };
        // prepost only means something on a set
        let policy = WaitQueuePolicy {
            prepost: policy.prepost && kind == QueueKind::Set,
            ..policy
        };
        Arc::new(Self {
            id,
            kind,
            policy,
            state: Interlock::with_timeout(rank, id.as_u64(), timeout, QueueState::default()),
        })
    }

    /// Release a queue that has no waiters and no links
    pub fn free(self: Arc<Self>) -> KernResult<()> {
        let elements = self.state.lock().elements.len();
        if elements > 0 {
            return Err(WaitQueueError::NotEmpty {
                queue: self.id,
                elements,
            });
        }
        trace!(queue = %self.id, "wait queue freed");
        Ok(())
    }

    #[inline(always)]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[inline(always)]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline(always)]
    pub fn policy(&self) -> WaitQueuePolicy {
        self.policy
    }

    #[inline(always)]
    pub fn is_set(&self) -> bool {
        self.kind == QueueKind::Set
    }

    /// Take the interlock for a sequence of operations
    pub fn lock(self: &Arc<Self>) -> LockedWaitQueue<'_> {
        LockedWaitQueue {
            queue: self,
            state: self.state.lock(),
        }
    }

    /// Threads directly waiting on this queue
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiter_count()
    }

    /// Links from this queue into sets
    pub fn link_count(&self) -> usize {
        self.state.lock().links
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().elements.is_empty()
    }

    /// Enqueue `thread` to wait for `event`
    ///
    /// Returns `Waiting` when the caller should now block. A deadline at or
    /// before the current time yields `TimedOut` without enqueuing.
    ///
    /// # Panics
    /// If the thread is already waiting on a queue.
    pub fn assert_wait(
        self: &Arc<Self>,
        thread: &Arc<Thread>,
        event: Event,
        interruptible: Interruptible,
        deadline: Option<AbsTime>,
    ) -> WaitResult {
        self.lock()
            .assert_wait(thread, event, interruptible, deadline)
    }

    /// Wake the first waiter for `event`
    pub fn wakeup_one(self: &Arc<Self>, event: Event, result: WaitResult) -> WakeResult {
        self.lock().wakeup_one(event, result)
    }

    /// Wake every waiter for `event`
    pub fn wakeup_all(self: &Arc<Self>, event: Event, result: WaitResult) -> WakeResult {
        self.lock().wakeup_all(event, result)
    }

    /// Wake `thread` only if it still waits here for `event`
    pub fn wakeup_thread(
        self: &Arc<Self>,
        event: Event,
        thread: &Arc<Thread>,
        result: WaitResult,
    ) -> WakeResult {
        self.lock().wakeup_thread(event, thread, result)
    }

    /// Wake the first waiter for `event` and return it
    pub fn wakeup_identity(self: &Arc<Self>, event: Event, result: WaitResult) -> Option<Arc<Thread>> {
        self.lock().wakeup_identity(event, result)
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .finish()
    }
}

/// A wait queue with its interlock held
pub struct LockedWaitQueue<'a> {
    queue: &'a Arc<WaitQueue>,
    pub(crate) state: InterlockGuard<'a, QueueState>,
}

impl LockedWaitQueue<'_> {
    pub fn queue(&self) -> &Arc<WaitQueue> {
        self.queue
    }

    pub fn waiter_count(&self) -> usize {
        self.state.waiter_count()
    }

    /// See `WaitQueue::assert_wait`
    pub fn assert_wait(
        &mut self,
        thread: &Arc<Thread>,
        event: Event,
        interruptible: Interruptible,
        deadline: Option<AbsTime>,
    ) -> WaitResult {
        let scheduler = thread.scheduler();
        let mut ctl = thread.lock();

        if let Some(current) = ctl.wait_queue.as_ref() {
            let current = current.upgrade().map(|queue| queue.id());
            panic!(
                "thread {} already waiting on queue {:?}; assert_wait on queue {} rejected",
                thread.id(),
                current,
                self.queue.id
            );
        }

        if deadline.is_some_and(|deadline| deadline <= scheduler.now()) {
            ctl.wait_result = WaitResult::TimedOut;
            return WaitResult::TimedOut;
        }

        if self.queue.policy.prepost && self.state.consume_prepost(event) {
            trace!(thread = %thread.id(), set = %self.queue.id, %event, "prepost consumed");
            ctl.wait_result = WaitResult::Awakened;
            return WaitResult::Awakened;
        }

        self.state.insert_waiter(
            ThreadWaiter {
                thread: Arc::clone(thread),
                event,
                priority: ctl.sched_priority,
            },
            self.queue.policy.order,
        );

        ctl.wait_queue = Some(Arc::downgrade(self.queue));
        ctl.wait_event = event;
        ctl.interruptible = interruptible;
        ctl.wait_result = WaitResult::Waiting;
        ctl.wait_generation = ctl.wait_generation.wrapping_add(1);
        ctl.run_state = RunState::Waiting;
        if let Some(deadline) = deadline {
            ctl.wait_timer = Some(arm_wait_timeout(
                &scheduler,
                thread,
                ctl.wait_generation,
                deadline,
            ));
        }

        trace!(thread = %thread.id(), queue = %self.queue.id, %event, "wait asserted");
        WaitResult::Waiting
    }

    /// See `WaitQueue::wakeup_one`
    pub fn wakeup_one(&mut self, event: Event, result: WaitResult) -> WakeResult {
        match self.wake_first(event, result) {
            Some(_) => WakeResult::Woken(1),
            None => WakeResult::NoWaiters,
        }
    }

    /// See `WaitQueue::wakeup_identity`
    pub fn wakeup_identity(&mut self, event: Event, result: WaitResult) -> Option<Arc<Thread>> {
        self.wake_first(event, result)
    }

    /// See `WaitQueue::wakeup_all`
    pub fn wakeup_all(&mut self, event: Event, result: WaitResult) -> WakeResult {
        WakeResult::from_count(self.wake_all(event, result))
    }

    /// See `WaitQueue::wakeup_thread`
    pub fn wakeup_thread(
        &mut self,
        event: Event,
        thread: &Arc<Thread>,
        result: WaitResult,
    ) -> WakeResult {
        let position = self.state.elements.iter().position(|element| {
            matches!(element, WaitElement::Thread(waiter)
                if Arc::ptr_eq(&waiter.thread, thread) && waiter.event == event)
        });
        let Some(index) = position else {
            return WakeResult::NoWaiters;
        };

        let mut ctl = thread.lock();
        self.state.remove_at(index);
        self.finish_wait(thread, &mut ctl, result);
        WakeResult::Woken(1)
    }

    /// End `thread`'s wait if it is still the wait numbered `generation` on
    /// this queue. Used by timeouts and interruption.
    pub(crate) fn pull_waiter(
        &mut self,
        thread: &Arc<Thread>,
        generation: u64,
        result: WaitResult,
    ) -> bool {
        let mut ctl = thread.lock();
        if !ctl.is_waiting_on(self.queue) || ctl.wait_generation != generation {
            return false;
        }
        let Some(index) = self
            .state
            .elements
            .iter()
            .position(|element| element.is_thread(thread))
        else {
            panic!(
                "thread {} records a wait on queue {} but is not on its element list",
                thread.id(),
                self.queue.id
            );
        };
        self.state.remove_at(index);
        self.finish_wait(thread, &mut ctl, result);
        true
    }

    fn wake_first(&mut self, event: Event, result: WaitResult) -> Option<Arc<Thread>> {
        if !mask_may_contain(self.state.event_mask, event) {
            return None;
        }

        let chosen = self.choose_waiter(event);
        let mut index = 0;
        while index < self.state.elements.len() {
            match &self.state.elements[index] {
                WaitElement::Thread(waiter) if Some(index) == chosen => {
                    let thread = Arc::clone(&waiter.thread);
                    {
                        let mut ctl = thread.lock();
                        self.state.remove_at(index);
                        self.finish_wait(&thread, &mut ctl, result);
                    }
                    return Some(thread);
                }
                WaitElement::Thread(_) => index += 1,
                WaitElement::Link(link) => {
                    let link = Arc::clone(link);
                    if let Some(thread) = propagate_one(&link, event, result) {
                        return Some(thread);
                    }
                    index += 1;
                }
            }
        }
        None
    }

    /// Index of the direct waiter for `event` that a wakeup should take
    ///
    /// FIFO queues take the first match. Priority queues take the highest
    /// current scheduled priority, earliest arrival on ties; the priority
    /// recorded at insertion may be stale after a promotion or depression.
    fn choose_waiter(&self, event: Event) -> Option<usize> {
        let mut matching = self
            .state
            .elements
            .iter()
            .enumerate()
            .filter_map(|(index, element)| match element {
                WaitElement::Thread(waiter) if waiter.event == event => {
                    Some((index, &waiter.thread))
                }
                _ => None,
            });

        match self.queue.policy.order {
            QueueOrder::Fifo => matching.next().map(|(index, _)| index),
            QueueOrder::Priority => {
                let mut best: Option<(usize, Priority)> = None;
                for (index, thread) in matching {
                    let priority = thread.sched_priority();
                    if best.map_or(true, |(_, top)| priority > top) {
                        best = Some((index, priority));
                    }
                }
                best.map(|(index, _)| index)
            }
        }
    }

    fn wake_all(&mut self, event: Event, result: WaitResult) -> usize {
        if !mask_may_contain(self.state.event_mask, event) {
            return 0;
        }

        let mut woken = 0;
        let mut index = 0;
        while index < self.state.elements.len() {
            match &self.state.elements[index] {
                WaitElement::Thread(waiter) if waiter.event == event => {
                    let thread = Arc::clone(&waiter.thread);
                    let mut ctl = thread.lock();
                    self.state.remove_at(index);
                    self.finish_wait(&thread, &mut ctl, result);
                    woken += 1;
                }
                WaitElement::Thread(_) => index += 1,
                WaitElement::Link(link) => {
                    let link = Arc::clone(link);
                    woken += propagate_all(&link, event, result);
                    index += 1;
                }
            }
        }
        woken
    }

    fn finish_wait(&self, thread: &Arc<Thread>, ctl: &mut ThreadControl, result: WaitResult) {
        assert!(
            ctl.is_waiting_on(self.queue),
            "thread {} found on queue {} without a matching wait",
            thread.id(),
            self.queue.id
        );
        thread.scheduler().thread_go(thread, ctl, result);
    }
}

/// Deliver one wakeup through `link` into its set; prepost if no waiter matches
fn propagate_one(link: &Arc<WaitQueueLink>, event: Event, result: WaitResult) -> Option<Arc<Thread>> {
    let set = link.set_queue()?;
    let mut locked = set.lock();
    if let Some(thread) = locked.wake_first(event, result) {
        return Some(thread);
    }
    if set.policy.prepost {
        locked.state.record_prepost(link, event);
        trace!(set = %set.id, link = %link.id(), %event, "prepost recorded");
    }
    None
}

/// Deliver a broadcast through `link` into its set; prepost if no waiter matches
fn propagate_all(link: &Arc<WaitQueueLink>, event: Event, result: WaitResult) -> usize {
    let Some(set) = link.set_queue() else {
        return 0;
    };
    let mut locked = set.lock();
    let woken = locked.wake_all(event, result);
    if woken == 0 && set.policy.prepost {
        locked.state.record_prepost(link, event);
        trace!(set = %set.id, link = %link.id(), %event, "prepost recorded");
    }
    woken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::TaskId;
    use crate::sched::{Scheduler, ThreadSpec};

    fn fixture() -> (Arc<Scheduler>, Arc<WaitQueue>) {
        let scheduler = Scheduler::builder().build().unwrap();
        (scheduler, WaitQueue::new(WaitQueuePolicy::PRIORITY))
    }

    #[test]
    fn test_priority_insert_ties_by_arrival() {
        let (scheduler, queue) = fixture();
        let low = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)).priority(10));
        let high_a = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)).priority(50));
        let high_b = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)).priority(50));
        let event = Event::new(0x40);

        for thread in [&low, &high_a, &high_b] {
            assert_eq!(
                queue.assert_wait(thread, event, Interruptible::Uninterruptible, None),
                WaitResult::Waiting
            );
        }

        let order: Vec<_> = std::iter::from_fn(|| queue.wakeup_identity(event, WaitResult::Awakened))
            .map(|thread| thread.id())
            .collect();
        assert_eq!(order, vec![high_a.id(), high_b.id(), low.id()]);
    }

    #[test]
    fn test_event_mask_resets_when_empty() {
        let (scheduler, queue) = fixture();
        let thread = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)));
        let event = Event::new(0b1010);

        queue.assert_wait(&thread, event, Interruptible::Uninterruptible, None);
        assert_eq!(queue.state.lock().event_mask, event.mask());

        // non-matching event is filtered by the mask
        assert_eq!(
            queue.wakeup_one(Event::new(0b0101), WaitResult::Awakened),
            WakeResult::NoWaiters
        );
        assert_eq!(queue.wakeup_one(event, WaitResult::Awakened), WakeResult::Woken(1));
        assert_eq!(queue.state.lock().event_mask, 0);
    }

    #[test]
    fn test_free_requires_empty() {
        let (scheduler, queue) = fixture();
        let thread = scheduler.create_thread(ThreadSpec::new(TaskId::new(1)));
        queue.assert_wait(&thread, Event::new(1), Interruptible::Uninterruptible, None);

        let err = Arc::clone(&queue).free().unwrap_err();
        assert_eq!(
            err,
            WaitQueueError::NotEmpty {
                queue: queue.id(),
                elements: 1
            }
        );

        queue.wakeup_all(Event::new(1), WaitResult::Awakened);
        assert!(queue.free().is_ok());
    }

    #[test]
    fn test_prepost_flag_ignored_on_plain_queue() {
        let queue = WaitQueue::new(WaitQueuePolicy::FIFO.with_prepost());
        assert!(!queue.policy().prepost);
        assert_eq!(queue.kind(), QueueKind::Plain);
    }
}
