/*!
 * Interlock
 *
 * Low-level mutual exclusion for wait queue internals. Acquisition spins
 * briefly, yields, then falls back to a timed park. If the deadline passes
 * the lock is considered deadlocked: indefinite contention on a queue
 * interlock means a lock-ordering bug elsewhere, so the caller is aborted
 * with a diagnostic naming the queue and the CPU tag of the holder.
 *
 * # Backoff
 *
 * 1. **Tight spin** (0-10 iterations): `spin_loop()` hint
 * 2. **Yield** (10-50 iterations): `yield_now()`
 * 3. **Timed park**: `try_lock_for` the remainder of the timeout
 */

use super::lock_rank::{LockRank, RankToken};
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SPIN_ITERATIONS: u32 = 10;
const YIELD_ITERATIONS: u32 = 50;

/// Default acquisition timeout, replaced from `SchedConfig::interlock_timeout_ms`
static DEFAULT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(2_000);

static NEXT_CPU_TAG: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CPU_TAG: Cell<usize> = const { Cell::new(0) };
}

/// Tag identifying the executing CPU (one per OS thread in the hosted kernel)
pub fn current_cpu_tag() -> usize {
    CPU_TAG.with(|tag| {
        if tag.get() == 0 {
            tag.set(NEXT_CPU_TAG.fetch_add(1, Ordering::Relaxed));
        }
        tag.get()
    })
}

/// Set the timeout used by interlocks created afterwards
pub fn set_default_timeout(timeout: Duration) {
    DEFAULT_TIMEOUT_MS.store(timeout.as_millis() as u64, Ordering::Relaxed);
}

/// Current default interlock timeout
pub fn default_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Exclusive lock guarding one wait queue's element list and flags
pub struct Interlock<T> {
    rank: LockRank,
    ident: u64,
    timeout: Duration,
    owner: AtomicUsize,
    inner: Mutex<T>,
}

impl<T> Interlock<T> {
    pub fn new(rank: LockRank, ident: u64, value: T) -> Self {
        Self::with_timeout(rank, ident, default_timeout(), value)
    }

    pub fn with_timeout(rank: LockRank, ident: u64, timeout: Duration, value: T) -> Self {
        Self {
            rank,
            ident,
            timeout,
            owner: AtomicUsize::new(0),
            inner: Mutex::new(value),
        }
    }

    /// Acquire, aborting on timeout
    pub fn lock(&self) -> InterlockGuard<'_, T> {
        let token = RankToken::acquire(self.rank, self.ident);
        let start = Instant::now();
        let mut spins = 0u32;

        loop {
            if let Some(guard) = self.inner.try_lock() {
                return self.held(guard, token);
            }
            if spins < SPIN_ITERATIONS {
                std::hint::spin_loop();
            } else if spins < YIELD_ITERATIONS {
                thread::yield_now();
            } else {
                break;
            }
            spins += 1;
        }

        let remaining = self.timeout.saturating_sub(start.elapsed());
        match self.inner.try_lock_for(remaining) {
            Some(guard) => self.held(guard, token),
            None => self.timed_out(start.elapsed()),
        }
    }

    /// CPU tag of the current holder, 0 when free
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    fn held<'a>(&'a self, guard: MutexGuard<'a, T>, token: RankToken) -> InterlockGuard<'a, T> {
        self.owner.store(current_cpu_tag(), Ordering::Relaxed);
        InterlockGuard {
            lock: self,
            guard,
            _token: token,
        }
    }

    #[cold]
    #[inline(never)]
    fn timed_out(&self, waited: Duration) -> ! {
        let owner = self.owner();
        tracing::error!(
            rank = %self.rank,
            ident = self.ident,
            owner_cpu = owner,
            waited_ms = waited.as_millis() as u64,
            "interlock acquisition timed out"
        );
        panic!(
            "{} {} interlock timeout after {:?}: held by cpu {}, requested by cpu {}",
            self.rank,
            self.ident,
            waited,
            owner,
            current_cpu_tag()
        );
    }
}

/// Held interlock; releases and forgets its rank on drop
pub struct InterlockGuard<'a, T> {
    lock: &'a Interlock<T>,
    guard: MutexGuard<'a, T>,
    _token: RankToken,
}

impl<T> Drop for InterlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Relaxed);
    }
}

impl<T> Deref for InterlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for InterlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_and_owner() {
        let lock = Interlock::new(LockRank::WaitQueue, 1, 5u32);
        assert_eq!(lock.owner(), 0);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert_eq!(lock.owner(), current_cpu_tag());
        }
        assert_eq!(lock.owner(), 0);
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_contended_lock_waits_for_release() {
        let lock = Interlock::new(LockRank::WaitQueue, 2, 0u32);
        let held = lock.lock();
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let mut guard = lock.lock();
                *guard += 1;
            });
            thread::sleep(Duration::from_millis(20));
            drop(held);
            waiter.join().unwrap();
        });
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_timeout_is_fatal() {
        let lock = Arc::new(Interlock::with_timeout(
            LockRank::WaitQueue,
            3,
            Duration::from_millis(50),
            (),
        ));
        let guard = lock.lock();

        let contender = Arc::clone(&lock);
        let result = thread::spawn(move || {
            let _g = contender.lock();
        })
        .join();

        assert!(result.is_err(), "contended interlock must abort after its timeout");
        drop(guard);
    }

    #[test]
    fn test_cpu_tags_differ_per_thread() {
        let here = current_cpu_tag();
        let there = thread::spawn(current_cpu_tag).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, current_cpu_tag());
    }
}
