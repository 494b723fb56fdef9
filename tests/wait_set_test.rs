/*!
 * Wait Queue Set Tests
 * Linking, wakeup propagation, preposting and link resource limits
 */

mod common;

use ai_os_sched::waitq::{
    Event, Interruptible, LinkZone, WaitQueue, WaitQueueLink, WaitQueuePolicy, WaitQueueSet,
    WaitResult, WakeResult,
};
use ai_os_sched::WaitQueueError;
use common::Harness;
use pretty_assertions::assert_eq;
use std::sync::Arc;

const EVENT: Event = Event::new(0x40);

fn private_set(policy: WaitQueuePolicy, limit: usize) -> WaitQueueSet {
    WaitQueueSet::with_zone(policy, LinkZone::new(limit))
}

#[test]
fn test_prepost_satisfies_next_wait() {
    let h = Harness::new();
    let set = private_set(WaitQueuePolicy::FIFO.with_prepost(), 4);
    let base = WaitQueue::new(WaitQueuePolicy::FIFO);
    set.link(&base).unwrap();

    // nobody waits on the set: the wakeup is preposted
    assert_eq!(base.wakeup_one(EVENT, WaitResult::Awakened), WakeResult::NoWaiters);
    assert!(set.is_preposted(&base));
    assert_eq!(set.prepost_count(), 1);

    let thread = h.default_thread();
    let result = set.assert_wait(&thread, EVENT, Interruptible::Uninterruptible, None);
    assert_eq!(result, WaitResult::Awakened);
    assert!(!thread.is_waiting());
    assert!(!set.is_preposted(&base));
    assert_eq!(set.prepost_count(), 0);
    assert_eq!(h.scheduler.thread_block(&thread), WaitResult::Awakened);
}

#[test]
fn test_prepost_is_deduplicated_and_event_specific() {
    let h = Harness::new();
    let set = private_set(WaitQueuePolicy::FIFO.with_prepost(), 4);
    let base = WaitQueue::new(WaitQueuePolicy::FIFO);
    set.link(&base).unwrap();

    base.wakeup_one(EVENT, WaitResult::Awakened);
    base.wakeup_all(EVENT, WaitResult::Awakened);
    assert_eq!(set.prepost_count(), 1);

    // a wait for a different event is not satisfied by the prepost
    let thread = h.default_thread();
    let result = set.assert_wait(&thread, Event::new(0x80), Interruptible::Uninterruptible, None);
    assert_eq!(result, WaitResult::Waiting);
    assert_eq!(set.prepost_count(), 1);
}

#[test]
fn test_no_prepost_without_policy() {
    let h = Harness::new();
    let set = private_set(WaitQueuePolicy::FIFO, 4);
    let base = WaitQueue::new(WaitQueuePolicy::FIFO);
    set.link(&base).unwrap();

    base.wakeup_one(EVENT, WaitResult::Awakened);
    assert_eq!(set.prepost_count(), 0);

    let thread = h.default_thread();
    assert_eq!(
        set.assert_wait(&thread, EVENT, Interruptible::Uninterruptible, None),
        WaitResult::Waiting
    );
}

#[test]
fn test_wakeup_propagates_to_set_waiter() {
    let h = Harness::new();
    let set = private_set(WaitQueuePolicy::FIFO.with_prepost(), 4);
    let base_a = WaitQueue::new(WaitQueuePolicy::FIFO);
    let base_b = WaitQueue::new(WaitQueuePolicy::FIFO);
    set.link(&base_a).unwrap();
    set.link(&base_b).unwrap();

    let thread = h.default_thread();
    set.assert_wait(&thread, EVENT, Interruptible::Uninterruptible, None);

    assert_eq!(base_b.wakeup_one(EVENT, WaitResult::Awakened), WakeResult::Woken(1));
    assert!(!thread.is_waiting());
    assert_eq!(thread.lock().wait_result(), WaitResult::Awakened);
    assert_eq!(set.prepost_count(), 0);
}

#[test]
fn test_direct_waiters_before_links() {
    let h = Harness::new();
    let set = private_set(WaitQueuePolicy::FIFO, 4);
    let base = WaitQueue::new(WaitQueuePolicy::FIFO);
    set.link(&base).unwrap();

    let on_set = h.default_thread();
    let on_base = h.default_thread();
    set.assert_wait(&on_set, EVENT, Interruptible::Uninterruptible, None);
    base.assert_wait(&on_base, EVENT, Interruptible::Uninterruptible, None);

    // the link element was queued first, so the set waiter is woken first
    let woken = base.wakeup_identity(EVENT, WaitResult::Awakened).unwrap();
    assert_eq!(woken.id(), on_set.id());
    assert_eq!(base.wakeup_all(EVENT, WaitResult::Awakened), WakeResult::Woken(1));
    assert!(!on_base.is_waiting());
}

#[test]
fn test_link_errors() {
    let set = private_set(WaitQueuePolicy::FIFO, 4);
    let base = WaitQueue::new(WaitQueuePolicy::FIFO);

    assert_eq!(
        set.unlink(&base),
        Err(WaitQueueError::NotInSet {
            queue: base.id(),
            set: set.id()
        })
    );
    set.link(&base).unwrap();
    assert_eq!(
        set.link(&base),
        Err(WaitQueueError::AlreadyInSet {
            queue: base.id(),
            set: set.id()
        })
    );
    assert_eq!(set.zone().live(), 1, "rejected link is released");
}

#[test]
fn test_link_zone_exhaustion() {
    let set = private_set(WaitQueuePolicy::FIFO, 2);
    let bases: Vec<_> = (0..3).map(|_| WaitQueue::new(WaitQueuePolicy::FIFO)).collect();

    set.link(&bases[0]).unwrap();
    set.link(&bases[1]).unwrap();
    assert_eq!(
        set.link(&bases[2]),
        Err(WaitQueueError::ResourceShortage { live: 2, limit: 2 })
    );

    set.unlink(&bases[0]).unwrap();
    set.link(&bases[2]).unwrap();
    assert!(set.member(&bases[2]));
}

#[test]
fn test_unlink_clears_prepost() {
    let set = private_set(WaitQueuePolicy::FIFO.with_prepost(), 4);
    let base = WaitQueue::new(WaitQueuePolicy::FIFO);
    set.link(&base).unwrap();

    base.wakeup_one(EVENT, WaitResult::Awakened);
    assert!(set.is_preposted(&base));

    let link = set.unlink_nofree(&base).unwrap();
    assert!(!set.is_preposted(&base));
    assert_eq!(set.prepost_count(), 0);
    assert!(!link.is_bound());
}

#[test]
fn test_unlink_all_from_base_and_from_set() {
    let zone = LinkZone::new(8);
    let set_a = WaitQueueSet::with_zone(WaitQueuePolicy::FIFO, Arc::clone(&zone));
    let set_b = WaitQueueSet::with_zone(WaitQueuePolicy::FIFO, Arc::clone(&zone));
    let base = WaitQueue::new(WaitQueuePolicy::FIFO);
    let other = WaitQueue::new(WaitQueuePolicy::FIFO);

    set_a.link(&base).unwrap();
    set_b.link(&base).unwrap();
    set_a.link(&other).unwrap();
    assert_eq!(base.link_count(), 2);

    assert_eq!(base.unlink_all(), 2);
    assert_eq!(base.link_count(), 0);
    assert!(!set_a.member(&base));
    assert!(!set_b.member(&base));
    assert_eq!(set_a.link_count(), 1);

    assert_eq!(set_a.unlink_all(), 1);
    assert_eq!(set_a.link_count(), 0);
    assert_eq!(other.link_count(), 0);
    assert_eq!(zone.live(), 0);
}

#[test]
fn test_caller_allocated_link() {
    let zone = LinkZone::new(1);
    let set = WaitQueueSet::with_zone(WaitQueuePolicy::FIFO, LinkZone::new(0));
    let base = WaitQueue::new(WaitQueuePolicy::FIFO);

    // the set's own zone is empty but a caller-supplied link still works
    assert!(matches!(
        set.link(&base),
        Err(WaitQueueError::ResourceShortage { .. })
    ));
    let link = WaitQueueLink::alloc_in(&zone).unwrap();
    set.link_noalloc(&base, &link).unwrap();
    assert!(set.member(&base));
    assert!(Arc::ptr_eq(&link.base_queue().unwrap(), &base));
    assert!(Arc::ptr_eq(&link.set_queue().unwrap(), set.queue()));
}

#[test]
fn test_dropped_base_is_forgotten_by_set() {
    let set = private_set(WaitQueuePolicy::FIFO, 4);
    {
        let base = WaitQueue::new(WaitQueuePolicy::FIFO);
        set.link(&base).unwrap();
    }
    assert_eq!(set.link_count(), 1);
    assert_eq!(set.unlink_all(), 1);
    assert_eq!(set.zone().live(), 0);
    assert!(set.clone().free().is_ok());
}
