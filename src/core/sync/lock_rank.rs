/*!
 * Lock Ranking
 *
 * Acquisition-order contract for the scheduler and wait queue locks:
 *
 * ```text
 * WaitQueue (base)  ->  WaitQueueSet  ->  Thread  ->  leaf locks
 * ```
 *
 * An acquisition must have a strictly higher rank than every lock the current
 * OS thread already holds. Paths that start from the other end (a timeout
 * holding the thread lock, a set unlinking its members) drop the first lock,
 * reacquire in order and revalidate.
 *
 * Checked in debug builds only; release builds compile the tracking away.
 */

use std::fmt;

/// Lock ranks, lowest acquired first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    WaitQueue = 10,
    WaitQueueSet = 20,
    Thread = 30,
}

impl fmt::Display for LockRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockRank::WaitQueue => "wait queue",
            LockRank::WaitQueueSet => "wait queue set",
            LockRank::Thread => "thread",
        };
        f.write_str(name)
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: std::cell::RefCell<Vec<(LockRank, u64)>> = const { std::cell::RefCell::new(Vec::new()) };
}

/// Record of one held lock; dropping it forgets the lock
#[must_use]
pub(crate) struct RankToken {
    #[cfg(debug_assertions)]
    rank: LockRank,
    #[cfg(debug_assertions)]
    ident: u64,
}

impl RankToken {
    /// Register a blocking acquisition, panicking on an order violation
    #[inline]
    pub(crate) fn acquire(rank: LockRank, ident: u64) -> Self {
        #[cfg(debug_assertions)]
        HELD.with(|held| {
            let held = held.borrow();
            if let Some(&(top, top_ident)) = held.iter().max_by_key(|(r, _)| *r) {
                if top >= rank {
                    panic!(
                        "lock order violation: acquiring {} #{} while holding {} #{}",
                        rank, ident, top, top_ident
                    );
                }
            }
        });
        #[cfg(debug_assertions)]
        {
            HELD.with(|held| held.borrow_mut().push((rank, ident)));
            Self { rank, ident }
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (rank, ident);
            Self {}
        }
    }
}

impl Drop for RankToken {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held
                .iter()
                .rposition(|&(r, i)| r == self.rank && i == self.ident)
            {
                held.remove(pos);
            }
        });
    }
}

/// Number of ranked locks the current OS thread holds (debug builds)
#[cfg(debug_assertions)]
pub fn held_count() -> usize {
    HELD.with(|held| held.borrow().len())
}

#[cfg(all(test, debug_assertions))]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_acquisition() {
        let a = RankToken::acquire(LockRank::WaitQueue, 1);
        let b = RankToken::acquire(LockRank::WaitQueueSet, 2);
        let c = RankToken::acquire(LockRank::Thread, 3);
        assert_eq!(held_count(), 3);
        drop(b);
        drop(a);
        drop(c);
        assert_eq!(held_count(), 0);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_reverse_order_panics() {
        let _set = RankToken::acquire(LockRank::WaitQueueSet, 7);
        let _base = RankToken::acquire(LockRank::WaitQueue, 8);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_two_threads_panics() {
        let _a = RankToken::acquire(LockRank::Thread, 1);
        let _b = RankToken::acquire(LockRank::Thread, 2);
    }

    #[test]
    fn test_release_allows_lower_rank() {
        let thread = RankToken::acquire(LockRank::Thread, 1);
        drop(thread);
        let _queue = RankToken::acquire(LockRank::WaitQueue, 2);
        let _thread = RankToken::acquire(LockRank::Thread, 1);
        assert_eq!(held_count(), 2);
    }
}
