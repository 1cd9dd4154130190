// ===============================
// src/coordinator.rs (cache + ledger, fixed lock order)
// ===============================
//
// Both directions of a dual-resource operation (apply / compensate) take
// the cache lock first and the ledger lock second, and release ledger
// before cache. The order lives in `ResourceRank`; never reorder here.
//
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheState, TradeCache};
use crate::domain::{Position, TradeEvent};
use crate::ledger::{Ledger, LedgerError};
use crate::locks::{RankedMutex, ResourceRank};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub evicted: Option<TradeEvent>,
    pub ledger_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReverseOutcome {
    Reversed(TradeEvent),
    AlreadyReversed,
    NotFound,
    Rejected(LedgerError),
}

pub struct LockCoordinator {
    cache: Arc<TradeCache>,
    ledger: RankedMutex<Ledger>,
}

impl LockCoordinator {
    pub fn new(cache: Arc<TradeCache>) -> Self {
        Self { cache, ledger: RankedMutex::new(ResourceRank::SecondaryLedger, Ledger::new()) }
    }

    pub fn cache(&self) -> &Arc<TradeCache> { &self.cache }

    /// Runs `f` with both locks held, acquired ascending and released descending.
    fn with_cache_and_ledger<R>(&self, f: impl FnOnce(&mut CacheState, &mut Ledger) -> R) -> R {
        let mut cache = self.cache.lock();
        let mut ledger = self.ledger.lock();
        let out = f(&mut *cache, &mut *ledger);
        drop(ledger);
        drop(cache);
        out
    }

    /// Cache the trade and post it to the ledger in one critical section.
    /// A trade the ledger cannot hold is rejected and not cached either.
    pub fn process_trade(&self, event: TradeEvent) -> Result<ApplyOutcome, LedgerError> {
        self.with_cache_and_ledger(|cache, ledger| {
            let ledger_applied = ledger.apply(&event)?;
            if !ledger_applied {
                debug!(id = %event.id, partition = event.partition, seq = event.sequence, "redelivered trade, ledger unchanged");
            }
            let evicted = cache.insert(event);
            // marker only matters while reverse_trade can still find the id
            if let Some(old) = &evicted {
                if ledger.is_reversed(&old.id) && cache.find(&old.id).is_none() {
                    ledger.forget_reversal(&old.id);
                }
            }
            Ok(ApplyOutcome { evicted, ledger_applied })
        })
    }

    /// Compensate a cached trade on the ledger. Same lock order as `process_trade`.
    pub fn reverse_trade(&self, trade_id: &str) -> ReverseOutcome {
        self.with_cache_and_ledger(|cache, ledger| match cache.find(trade_id).cloned() {
            None => ReverseOutcome::NotFound,
            Some(ev) => match ledger.reverse(&ev) {
                Ok(true) => ReverseOutcome::Reversed(ev),
                Ok(false) => ReverseOutcome::AlreadyReversed,
                Err(e) => ReverseOutcome::Rejected(e),
            },
        })
    }

    pub fn reversed_len(&self) -> usize { self.ledger.lock().reversed_len() }

    pub fn positions(&self) -> Vec<(String, Position)> { self.ledger.lock().positions() }

    pub fn realized_pnl(&self) -> rust_decimal::Decimal { self.ledger.lock().realized_pnl() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::trade;
    use crate::domain::Side;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn process_then_reverse() {
        let co = LockCoordinator::new(Arc::new(TradeCache::new(10)));
        let out = co.process_trade(trade("T1", Side::Buy, 10, "100", 0)).unwrap();
        assert!(out.ledger_applied);
        assert_eq!(out.evicted, None);
        assert!(matches!(co.reverse_trade("T1"), ReverseOutcome::Reversed(_)));
        assert_eq!(co.reverse_trade("T1"), ReverseOutcome::AlreadyReversed);
        assert_eq!(co.reverse_trade("nope"), ReverseOutcome::NotFound);
        assert_eq!(co.positions()[0].1.qty, 0);
        assert_eq!(co.cache().len(), 1);
    }

    #[test]
    fn redelivery_caches_but_does_not_repost() {
        let co = LockCoordinator::new(Arc::new(TradeCache::new(10)));
        co.process_trade(trade("T1", Side::Buy, 10, "100", 3)).unwrap();
        let again = co.process_trade(trade("T1", Side::Buy, 10, "100", 3)).unwrap();
        assert!(!again.ledger_applied);
        assert_eq!(co.cache().len(), 2);
        assert_eq!(co.positions()[0].1.qty, 10);
    }

    #[test]
    fn opposing_operations_do_not_deadlock() {
        const THREADS: usize = 8;
        const ROUNDS: u64 = 500;
        let co = Arc::new(LockCoordinator::new(Arc::new(TradeCache::new(64))));
        let (done_tx, done_rx) = mpsc::channel();

        for t in 0..THREADS {
            let co = co.clone();
            let done = done_tx.clone();
            std::thread::spawn(move || {
                for i in 0..ROUNDS {
                    let id = format!("T{t}-{i}");
                    let mut ev = trade(&id, Side::Buy, 1, "10", i);
                    ev.partition = t as u32;
                    if t % 2 == 0 {
                        co.process_trade(ev).unwrap();
                        co.reverse_trade(&id);
                    } else {
                        co.reverse_trade(&format!("T{}-{i}", t - 1));
                        co.process_trade(ev).unwrap();
                    }
                    let _ = co.cache().snapshot();
                }
                let _ = done.send(t);
            });
        }
        drop(done_tx);

        for _ in 0..THREADS {
            done_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("worker did not finish: possible deadlock");
        }
        assert!(co.cache().len() <= 64);
    }

    #[test]
    fn overflowing_trade_is_rejected_without_caching() {
        let co = LockCoordinator::new(Arc::new(TradeCache::new(10)));
        co.process_trade(trade("A", Side::Buy, 9_000_000_000_000_000_000, "1", 0)).unwrap();
        let err = co.process_trade(trade("B", Side::Buy, 9_000_000_000_000_000_000, "1", 1));
        assert!(matches!(err, Err(LedgerError::Overflow { .. })));
        assert_eq!(co.cache().len(), 1);
        // locks were released: the next trade goes through
        assert!(co.process_trade(trade("C", Side::Sell, 1, "1", 2)).is_ok());
        assert_eq!(co.cache().len(), 2);
    }

    #[test]
    fn reversal_markers_pruned_on_eviction() {
        let co = LockCoordinator::new(Arc::new(TradeCache::new(2)));
        co.process_trade(trade("T1", Side::Buy, 1, "10", 0)).unwrap();
        co.process_trade(trade("T2", Side::Buy, 1, "10", 1)).unwrap();
        assert!(matches!(co.reverse_trade("T1"), ReverseOutcome::Reversed(_)));
        assert_eq!(co.reversed_len(), 1);
        co.process_trade(trade("T3", Side::Buy, 1, "10", 2)).unwrap();
        assert_eq!(co.reversed_len(), 0);
        assert_eq!(co.reverse_trade("T1"), ReverseOutcome::NotFound);
    }

    #[test]
    fn reversal_marker_kept_while_duplicate_cached() {
        let co = LockCoordinator::new(Arc::new(TradeCache::new(2)));
        co.process_trade(trade("T1", Side::Buy, 1, "10", 0)).unwrap();
        co.process_trade(trade("T1", Side::Buy, 1, "10", 0)).unwrap();
        co.reverse_trade("T1");
        co.process_trade(trade("T2", Side::Buy, 1, "10", 1)).unwrap();
        assert_eq!(co.reversed_len(), 1);
        assert_eq!(co.reverse_trade("T1"), ReverseOutcome::AlreadyReversed);
    }
}
