// End-to-end: producers -> broker -> one loop per partition -> cache/ledger -> commit.
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use trade_ingest_rust::cache::TradeCache;
use trade_ingest_rust::codec::encode;
use trade_ingest_rust::consumer::{merge_positions, ConsumerCfg, ConsumerLoop};
use trade_ingest_rust::coordinator::LockCoordinator;
use trade_ingest_rust::domain::{Event, Side};
use trade_ingest_rust::pnl::match_round_trips;
use trade_ingest_rust::recorder::ErrorSink;
use trade_ingest_rust::retry::RetryPolicy;
use trade_ingest_rust::stream::MemoryBroker;
use trade_ingest_rust::supervisor::{ShutdownOutcome, Supervisor};

fn cfg() -> ConsumerCfg {
    ConsumerCfg {
        poll_timeout: Duration::from_millis(10),
        retry: RetryPolicy { max_retries: 5, base: Duration::from_millis(1), cap: Duration::from_millis(10) },
        high_value_notional: Decimal::from(1_000_000),
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pipeline did not settle in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitions_are_consumed_applied_and_committed() {
    let broker = MemoryBroker::new("trades-topic", 3);
    let per_partition = 40u64;
    for p in 0..3 {
        for i in 0..per_partition {
            let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
            let px = if i % 2 == 0 { "10.10" } else { "10.30" };
            broker.produce(p, None, Some(encode(side, "AAPL", 10, Decimal::from_str(px).unwrap()))).unwrap();
        }
        // satu poison per partisi
        broker.produce(p, None, Some("SELL AAPL ten 1".into())).unwrap();
    }

    let cache = Arc::new(TradeCache::new(1_000));
    let co = Arc::new(LockCoordinator::new(cache.clone()));
    let (tx, mut rx) = mpsc::channel(64);
    let sink = ErrorSink::new(tx);
    let sup = Arc::new(Supervisor::new(2, 256));
    let token = CancellationToken::new();

    let handles: Vec<_> = (0..3)
        .map(|p| {
            let lp = ConsumerLoop::new(broker.subscribe("it", &[p], 16), co.clone(), sink.clone(), cfg())
                .with_supervisor(sup.clone());
            tokio::spawn(lp.run(token.child_token()))
        })
        .collect();

    wait_until(|| (0..3).all(|p| broker.committed("it", p) == Some(per_partition))).await;
    token.cancel();
    let mut reports = Vec::new();
    for h in handles {
        reports.push(h.await.unwrap().unwrap());
    }

    assert_eq!(cache.len(), 120);
    assert_eq!(reports.iter().map(|r| r.poison).sum::<u64>(), 3);
    let merged = merge_positions(&reports);
    assert!((0..3).all(|p| merged.get(&p) == Some(&per_partition)));

    // 60 round trips of 10 @ +0.20
    let summary = match_round_trips(&cache.snapshot()).unwrap();
    assert_eq!(summary.total, Decimal::from(120));
    assert_eq!(co.realized_pnl(), Decimal::from(120));
    assert_eq!(co.positions()[0].1.qty, 0);

    let mut poison = 0;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, Event::Poison(_)) {
            poison += 1;
        }
    }
    assert_eq!(poison, 3);
    assert_eq!(sup.shutdown(Duration::from_secs(2)).await, ShutdownOutcome::Drained);
}

#[tokio::test]
async fn small_cache_keeps_only_newest_trades() {
    let broker = MemoryBroker::new("t", 1);
    for i in 1..=25 {
        broker.produce(0, Some(format!("t{i}")), Some(format!("BUY MSFT {i} 1"))).unwrap();
    }
    let cache = Arc::new(TradeCache::new(10));
    let co = Arc::new(LockCoordinator::new(cache.clone()));
    let token = CancellationToken::new();
    let task = tokio::spawn(
        ConsumerLoop::new(broker.subscribe("g", &[0], 7), co.clone(), ErrorSink::log_only(), cfg()).run(token.clone()),
    );
    wait_until(|| broker.committed("g", 0) == Some(24)).await;
    token.cancel();
    task.await.unwrap().unwrap();

    let ids: Vec<_> = cache.snapshot().into_iter().map(|e| e.id).collect();
    let expected: Vec<_> = (16..=25).map(|i| format!("t{i}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(cache.evicted(), 15);
    // ledger sees every trade, eviction only bounds the cache
    assert_eq!(co.positions()[0].1.qty, (1..=25).sum::<i64>());
}
