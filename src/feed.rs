// ===============================
// src/feed.rs
// ===============================
//
// Mock trade producer:
// - run_mock : random-walk trade generator per partition, writes delimited
//              payloads into the in-memory broker (~1000/MOCK_RATE_MS per second)
// - Sesekali (MOCK_POISON_PCT %) kirim payload rusak supaya jalur poison
//   message ikut teruji.
//
use rand::Rng;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::encode;
use crate::domain::Side;
use crate::stream::MemoryBroker;

const SYMBOLS: [&str; 3] = ["AAPL", "MSFT", "BTCUSDT"];
const BROKEN: [&str; 4] = ["BUY AAPL", "SELL ??? 1 1", "HOLD MSFT 10 1.00", "{\"side\":"];

#[derive(Debug, Clone, Copy)]
pub struct MockFeedCfg {
    pub rate: Duration,
    pub poison_pct: u32,
}

/// Generator trade mock (random walk, harga 2 desimal)
pub async fn run_mock(broker: MemoryBroker, partition: u32, cfg: MockFeedCfg, shutdown: CancellationToken) {
    info!(partition, rate = ?cfg.rate, poison_pct = cfg.poison_pct, "mock feed: started");
    let mut px_cents: i64 = 100_00; // 100.00
    let mut produced: u64 = 0;

    loop {
        // jangan simpan ThreadRng melewati .await
        let payload = {
            let mut rng = rand::thread_rng();
            if rng.gen_range(0..100) < cfg.poison_pct {
                BROKEN[rng.gen_range(0..BROKEN.len())].to_string()
            } else {
                px_cents = (px_cents + rng.gen_range(-3..=3)).max(50_00);
                let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
                let symbol = SYMBOLS[rng.gen_range(0..SYMBOLS.len())];
                encode(side, symbol, rng.gen_range(1..=100), Decimal::new(px_cents, 2))
            }
        };

        if let Err(e) = broker.produce(partition, None, Some(payload)) {
            warn!(?e, partition, "mock feed: produce failed, stopping");
            return;
        }
        produced += 1;

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(cfg.rate) => {}
        }
    }
    info!(partition, produced, "mock feed: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;
    use crate::stream::TradeStream;

    #[tokio::test]
    async fn produces_decodable_trades_until_cancelled() {
        let broker = MemoryBroker::new("t", 1);
        let token = CancellationToken::new();
        let cfg = MockFeedCfg { rate: Duration::from_millis(1), poison_pct: 0 };
        let task = tokio::spawn(run_mock(broker.clone(), 0, cfg, token.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        task.await.unwrap();

        let end = broker.end_offset(0);
        assert!(end > 0);
        let mut c = broker.subscribe("g", &[0], end as usize);
        for m in c.poll(Duration::from_millis(10)).await.unwrap() {
            assert!(decode(&m).is_ok(), "bad payload {:?}", m.payload);
        }
    }
}
