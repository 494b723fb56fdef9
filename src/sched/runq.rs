/*!
 * Priority Run Queue
 * One FIFO per priority level; `choose` takes from the highest non-empty level
 */

use super::thread::{Thread, ThreadOptions};
use super::traits::{RunQueue, RunQueueLoad};
use crate::core::id::ThreadId;
use crate::core::types::Priority;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

struct Entry {
    priority: Priority,
    background: bool,
}

#[derive(Default)]
struct Levels {
    levels: BTreeMap<Priority, VecDeque<Arc<Thread>>>,
    index: HashMap<ThreadId, Entry>,
    background: usize,
}

impl Levels {
    fn remove(&mut self, thread: &Arc<Thread>) -> bool {
        let Some(entry) = self.index.remove(&thread.id()) else {
            return false;
        };
        if let Some(level) = self.levels.get_mut(&entry.priority) {
            level.retain(|queued| !Arc::ptr_eq(queued, thread));
            if level.is_empty() {
                self.levels.remove(&entry.priority);
            }
        }
        if entry.background {
            self.background -= 1;
        }
        true
    }

    fn insert(&mut self, thread: &Arc<Thread>, priority: Priority) {
        let background = thread.options().contains(ThreadOptions::BACKGROUND);
        self.levels
            .entry(priority)
            .or_default()
            .push_back(Arc::clone(thread));
        self.index.insert(
            thread.id(),
            Entry {
                priority,
                background,
            },
        );
        if background {
            self.background += 1;
        }
    }
}

/// Reference run queue shared by every processor of a scheduler
#[derive(Default)]
pub struct PriorityRunQueue {
    inner: Mutex<Levels>,
}

impl PriorityRunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        self.inner.lock().index.contains_key(&thread.id())
    }
}

impl RunQueue for PriorityRunQueue {
    fn enqueue(&self, thread: &Arc<Thread>, priority: Priority) {
        let mut inner = self.inner.lock();
        // a thread is queued at most once
        inner.remove(thread);
        inner.insert(thread, priority);
    }

    fn dequeue(&self, thread: &Arc<Thread>) -> bool {
        self.inner.lock().remove(thread)
    }

    fn requeue(&self, thread: &Arc<Thread>, priority: Priority) {
        self.enqueue(thread, priority);
    }

    fn choose(&self) -> Option<Arc<Thread>> {
        let mut inner = self.inner.lock();
        let (&priority, level) = inner.levels.iter_mut().next_back()?;
        let thread = level.pop_front()?;
        if level.is_empty() {
            inner.levels.remove(&priority);
        }
        if let Some(entry) = inner.index.remove(&thread.id()) {
            if entry.background {
                inner.background -= 1;
            }
        }
        Some(thread)
    }

    fn highest_priority(&self) -> Option<Priority> {
        self.inner.lock().levels.keys().next_back().copied()
    }

    fn load(&self) -> RunQueueLoad {
        let inner = self.inner.lock();
        RunQueueLoad {
            total: inner.index.len(),
            background: inner.background,
        }
    }

    fn snapshot(&self) -> Vec<Arc<Thread>> {
        self.inner
            .lock()
            .levels
            .values()
            .rev()
            .flat_map(|level| level.iter().cloned())
            .collect()
    }
}
