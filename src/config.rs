// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : trade_ingest_rust — async trade-event ingestion engine in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Consumes trade events from a partitioned stream, validates and
          applies them to a bounded FIFO trade cache and a position ledger
          under a global lock order, commits read positions only after a
          batch is applied, exposes Prometheus metrics, and records poison
          messages as JSONL events.
=============================================================================
*/
use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Override dari command line (lebih kuat dari ENV)
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "trade_ingest", about = "Trade-event ingestion engine")]
pub struct Cli {
    #[arg(long)]
    pub topic: Option<String>,
    #[arg(long)]
    pub partitions: Option<u32>,
    #[arg(long)]
    pub cache_capacity: Option<usize>,
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Stop otomatis setelah N detik (default: jalan sampai Ctrl-C)
    #[arg(long)]
    pub run_for_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Args {
    // stream
    pub topic: String,
    pub partitions: u32,
    pub consumer_group: String,
    pub poll_timeout: Duration,
    pub max_batch: usize,

    // cache
    pub cache_capacity: usize,

    // retry
    pub retry: RetryPolicy,

    // background work
    pub bg_workers: usize,
    pub bg_queue: usize,
    pub shutdown_grace: Duration,

    // files/metrics
    pub error_sink_file: Option<String>,
    pub metrics_port: u16,

    // mock feed
    pub mock_rate: Duration,
    pub mock_poison_pct: u32,

    pub high_value_notional: Decimal,
    pub run_for: Option<Duration>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_ms(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_or(key, default))
}

pub fn load(cli: Cli) -> Args {
    // Pastikan .env dibaca (agar ERROR_SINK_FILE, PARTITIONS, dll ter-load)
    let _ = dotenv();
    from_env(cli)
}

/// Sama seperti `load` tapi tanpa membaca `.env` (dipakai test).
pub fn from_env(cli: Cli) -> Args {
    // ===== Stream =====
    let topic = cli
        .topic
        .or_else(|| env::var("TOPIC").ok().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| "trades-topic".to_string());
    let partitions = cli.partitions.unwrap_or_else(|| env_or("PARTITIONS", 2)).max(1);
    let consumer_group = env::var("CONSUMER_GROUP").unwrap_or_else(|_| "trade-ingest".to_string());
    let poll_timeout = env_ms("POLL_TIMEOUT_MS", 100);
    let max_batch = env_or("MAX_BATCH", 256usize).max(1);

    // ===== Cache (C_max, minimal 1) =====
    let cache_capacity = cli.cache_capacity.unwrap_or_else(|| env_or("CACHE_CAPACITY", 10_000)).max(1);

    // ===== Retry =====
    let retry = RetryPolicy {
        max_retries: env_or("RETRY_MAX", 5),
        base: env_ms("RETRY_BASE_MS", 50),
        cap: env_ms("RETRY_CAP_MS", 5_000),
    };

    // ===== Background =====
    let bg_workers = env_or("BG_WORKERS", 4usize).max(1);
    let bg_queue = env_or("BG_QUEUE", 1024usize).max(1);
    let shutdown_grace = env_ms("SHUTDOWN_GRACE_MS", 5_000);

    let error_sink_file = env::var("ERROR_SINK_FILE").ok().filter(|s| !s.trim().is_empty());
    let metrics_port = cli.metrics_port.unwrap_or_else(|| env_or("METRICS_PORT", 9898));

    // ===== Mock feed =====
    let mock_rate = env_ms("MOCK_RATE_MS", 5).max(Duration::from_millis(1));
    let mock_poison_pct = env_or("MOCK_POISON_PCT", 1u32).min(100);

    let high_value_notional = env_or("HIGH_VALUE_NOTIONAL", Decimal::from(1_000_000));
    let run_for = cli.run_for_secs.map(Duration::from_secs);

    Args {
        topic,
        partitions,
        consumer_group,
        poll_timeout,
        max_batch,
        cache_capacity,
        retry,
        bg_workers,
        bg_queue,
        shutdown_grace,
        error_sink_file,
        metrics_port,
        mock_rate,
        mock_poison_pct,
        high_value_notional,
        run_for,
    }
}
