// ===============================
// src/cache.rs (bounded trade cache)
// ===============================
//
// FIFO-bounded store of recently seen trades. All access goes through a
// single ranked mutex (rank = Cache), so insert / snapshot / clear are
// mutually exclusive and readers only ever get a full copy.
//
use ahash::AHashSet as HashSet;
use chrono::Utc;
use std::collections::VecDeque;

use crate::domain::{CacheEntry, TradeEvent};
use crate::locks::{RankedGuard, RankedMutex, ResourceRank};
use crate::metrics::{CACHE_EVICTIONS, CACHE_SIZE};

pub struct CacheState {
    entries: VecDeque<CacheEntry>,
    capacity: usize,
    evicted: u64,
}

impl CacheState {
    /// Append, evicting the oldest entry first when full. Returns the evicted event, if any.
    pub fn insert(&mut self, event: TradeEvent) -> Option<TradeEvent> {
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            evicted = self.entries.pop_front().map(|e| e.event);
            if evicted.is_some() {
                self.evicted += 1;
                CACHE_EVICTIONS.inc();
            }
        }
        self.entries.push_back(CacheEntry { event, inserted_at: Utc::now() });
        CACHE_SIZE.set(self.entries.len() as i64);
        evicted
    }

    /// Most recent entry with this id.
    pub fn find(&self, id: &str) -> Option<&TradeEvent> {
        self.entries.iter().rev().map(|e| &e.event).find(|e| e.id == id)
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

pub struct TradeCache {
    state: RankedMutex<CacheState>,
}

impl TradeCache {
    /// `capacity` is C_max; zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: RankedMutex::new(
                ResourceRank::Cache,
                CacheState { entries: VecDeque::with_capacity(capacity.min(65_536)), capacity, evicted: 0 },
            ),
        }
    }

    /// Hold the cache lock for a multi-step critical section (see `LockCoordinator`).
    pub fn lock(&self) -> RankedGuard<'_, CacheState> { self.state.lock() }

    pub fn insert(&self, event: TradeEvent) { self.state.lock().insert(event); }

    /// Point-in-time copy in insertion order.
    pub fn snapshot(&self) -> Vec<TradeEvent> {
        let st = self.state.lock();
        st.entries.iter().map(|e| e.event.clone()).collect()
    }

    /// Snapshot with timestamps, for reporting.
    pub fn entries(&self) -> Vec<CacheEntry> { self.state.lock().entries.iter().cloned().collect() }

    /// Snapshot with redelivered copies dropped (same partition + sequence, first wins).
    pub fn snapshot_unique(&self) -> Vec<TradeEvent> {
        let mut seen = HashSet::new();
        self.snapshot()
            .into_iter()
            .filter(|e| seen.insert((e.partition, e.sequence)))
            .collect()
    }

    pub fn clear(&self) {
        let mut st = self.state.lock();
        st.entries.clear();
        CACHE_SIZE.set(0);
    }

    pub fn len(&self) -> usize { self.state.lock().len() }
    pub fn is_empty(&self) -> bool { self.state.lock().is_empty() }
    pub fn capacity(&self) -> usize { self.state.lock().capacity }
    pub fn evicted(&self) -> u64 { self.state.lock().evicted }
}

#[cfg(test)]
pub(crate) fn trade(id: &str, side: crate::domain::Side, qty: i64, px: &str, seq: u64) -> TradeEvent {
    TradeEvent {
        id: id.to_string(),
        side,
        symbol: "AAPL".to_string(),
        quantity: qty,
        price: px.parse().unwrap(),
        partition: 0,
        sequence: seq,
    }
}
