// ===============================
// src/locks.rs (global lock order)
// ===============================
//
// Every lock-bearing shared resource gets a fixed rank. A thread may only
// acquire a lock whose rank is strictly greater than every rank it already
// holds, so the "A then B" / "B then A" deadlock cannot be written.
// Out-of-order acquisition is a programming error: `lock()` panics,
// `try_lock_ordered()` reports it without touching the mutex.
//
// Guards are `!Send` (parking_lot), so they can never be held across an
// `.await` inside a spawned task; the per-thread bookkeeping stays valid.
//
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use thiserror::Error;

/// Total order over shared resources. Acquire ascending, release descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceRank {
    Cache = 0,
    SecondaryLedger = 1,
}

impl fmt::Display for ResourceRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRank::Cache => f.write_str("cache"),
            ResourceRank::SecondaryLedger => f.write_str("secondary_ledger"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lock order violation: requested {requested} while holding {held}")]
pub struct LockOrderError {
    pub held: ResourceRank,
    pub requested: ResourceRank,
}

thread_local! {
    static HELD: RefCell<Vec<ResourceRank>> = const { RefCell::new(Vec::new()) };
}

fn highest_held() -> Option<ResourceRank> {
    HELD.with(|h| h.borrow().iter().max().copied())
}

/// Ranks held by the current thread, in acquisition order.
pub fn held_ranks() -> Vec<ResourceRank> {
    HELD.with(|h| h.borrow().clone())
}

pub struct RankedMutex<T> {
    rank: ResourceRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub fn new(rank: ResourceRank, value: T) -> Self {
        Self { rank, inner: Mutex::new(value) }
    }

    pub fn rank(&self) -> ResourceRank { self.rank }

    pub fn try_lock_ordered(&self) -> Result<RankedGuard<'_, T>, LockOrderError> {
        if let Some(held) = highest_held() {
            // >= juga menangkap re-entrant lock (parking_lot akan deadlock)
            if held >= self.rank {
                return Err(LockOrderError { held, requested: self.rank });
            }
        }
        let guard = self.inner.lock();
        HELD.with(|h| h.borrow_mut().push(self.rank));
        Ok(RankedGuard { rank: self.rank, guard })
    }

    /// Acquire in global order. Panics on violation: it is a bug, not a runtime condition.
    pub fn lock(&self) -> RankedGuard<'_, T> {
        match self.try_lock_ordered() {
            Ok(g) => g,
            Err(e) => panic!("{e}"),
        }
    }
}

pub struct RankedGuard<'a, T> {
    rank: ResourceRank,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T { &self.guard }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T { &mut self.guard }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        HELD.with(|h| {
            let mut h = h.borrow_mut();
            if let Some(pos) = h.iter().rposition(|r| *r == self.rank) {
                h.remove(pos);
            }
        });
    }
}
