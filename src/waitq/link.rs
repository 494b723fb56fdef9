/*!
 * Wait Queue Links
 *
 * A link joins one base queue to one set. While bound it sits on the base
 * queue's element list, on the set's member list, and on the set's prepost
 * list whenever a wakeup through it found nobody waiting.
 *
 * Links come from a bounded zone so a runaway caller gets
 * `ResourceShortage` instead of unbounded growth.
 */

use super::queue::WaitQueue;
use crate::core::errors::{KernResult, WaitQueueError};
use crate::core::id::{LinkId, LINK_IDS};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Default number of live links in the global zone
pub const DEFAULT_LINK_ZONE_LIMIT: usize = 65_536;

/// Bounded allocator accounting for live links
pub struct LinkZone {
    live: AtomicUsize,
    limit: AtomicUsize,
}

impl LinkZone {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        })
    }

    /// Zone used by `WaitQueueLink::alloc` and sets created without a zone
    pub fn global() -> &'static Arc<LinkZone> {
        static GLOBAL: OnceLock<Arc<LinkZone>> = OnceLock::new();
        GLOBAL.get_or_init(|| LinkZone::new(DEFAULT_LINK_ZONE_LIMIT))
    }

    /// Change the limit; existing links are unaffected
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn reserve(&self) -> KernResult<()> {
        let limit = self.limit();
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|live| WaitQueueError::ResourceShortage { live, limit })
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for LinkZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkZone")
            .field("live", &self.live())
            .field("limit", &self.limit())
            .finish()
    }
}

struct LinkBinding {
    base: Weak<WaitQueue>,
    set: Weak<WaitQueue>,
}

/// Join object between a base queue and a set
pub struct WaitQueueLink {
    id: LinkId,
    zone: Arc<LinkZone>,
    binding: Mutex<Option<LinkBinding>>,
}

impl WaitQueueLink {
    /// Allocate an unbound link from the global zone
    pub fn alloc() -> KernResult<Arc<Self>> {
        Self::alloc_in(LinkZone::global())
    }

    /// Allocate an unbound link from `zone`
    pub fn alloc_in(zone: &Arc<LinkZone>) -> KernResult<Arc<Self>> {
        zone.reserve()?;
        Ok(Arc::new(Self {
            id: LINK_IDS.next(),
            zone: Arc::clone(zone),
            binding: Mutex::new(None),
        }))
    }

    #[inline(always)]
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn is_bound(&self) -> bool {
        self.binding.lock().is_some()
    }

    pub fn base_queue(&self) -> Option<Arc<WaitQueue>> {
        self.binding.lock().as_ref().and_then(|b| b.base.upgrade())
    }

    pub fn set_queue(&self) -> Option<Arc<WaitQueue>> {
        self.binding.lock().as_ref().and_then(|b| b.set.upgrade())
    }

    pub(crate) fn joins_set(&self, set: &Arc<WaitQueue>) -> bool {
        self.binding
            .lock()
            .as_ref()
            .is_some_and(|b| std::ptr::eq(b.set.as_ptr(), Arc::as_ptr(set)))
    }

    pub(crate) fn joins_base(&self, base: &Arc<WaitQueue>) -> bool {
        self.binding
            .lock()
            .as_ref()
            .is_some_and(|b| std::ptr::eq(b.base.as_ptr(), Arc::as_ptr(base)))
    }

    /// Caller holds both interlocks
    pub(crate) fn bind(&self, base: &Arc<WaitQueue>, set: &Arc<WaitQueue>) -> KernResult<()> {
        let mut binding = self.binding.lock();
        if binding.is_some() {
            return Err(WaitQueueError::LinkInUse(self.id));
        }
        *binding = Some(LinkBinding {
            base: Arc::downgrade(base),
            set: Arc::downgrade(set),
        });
        Ok(())
    }

    pub(crate) fn unbind(&self) {
        *self.binding.lock() = None;
    }
}

impl Drop for WaitQueueLink {
    fn drop(&mut self) {
        self.zone.release();
    }
}

impl fmt::Debug for WaitQueueLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.binding.lock();
        let (base, set) = match binding.as_ref() {
            Some(b) => (
                b.base.upgrade().map(|q| q.id()),
                b.set.upgrade().map(|q| q.id()),
            ),
            None => (None, None),
        };
        f.debug_struct("WaitQueueLink")
            .field("id", &self.id)
            .field("base", &base)
            .field("set", &set)
            .finish()
    }
}
