// ===============================
// src/main.rs
// ===============================
/*
 # jalan 30 detik dengan 4 partisi, lalu drain + exit
 RUST_LOG=info cargo run -- --partitions 4 --run-for-secs 30

 # posisi commit & poison per partisi
curl -s localhost:9898/metrics | egrep '^(read_position|poison_messages_total)'

*/
/*
=============================================================================
Project : trade_ingest_rust — async trade-event ingestion engine in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Consumes trade events from a partitioned stream, validates and
          applies them to a bounded FIFO trade cache and a position ledger
          under a global lock order, commits read positions only after a
          batch is applied, exposes Prometheus metrics, and records poison
          messages as JSONL events.
=============================================================================
*/
use chrono::Utc;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trade_ingest_rust::cache::TradeCache;
use trade_ingest_rust::config::{self, Cli};
use trade_ingest_rust::consumer::{merge_positions, ConsumerCfg, ConsumerLoop, LoopError, LoopReport};
use trade_ingest_rust::coordinator::LockCoordinator;
use trade_ingest_rust::domain::Event;
use trade_ingest_rust::feed::{self, MockFeedCfg};
use trade_ingest_rust::metrics;
use trade_ingest_rust::pnl::match_round_trips;
use trade_ingest_rust::recorder::{self, ErrorSink};
use trade_ingest_rust::stream::MemoryBroker;
use trade_ingest_rust::supervisor::{ShutdownOutcome, Supervisor};

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config ----
    let args = config::load(Cli::parse());

    // ---- Metrics ----
    let shutdown = CancellationToken::new();
    metrics::init();
    metrics::CONFIG_PARTITIONS.set(args.partitions as i64);
    metrics::CONFIG_CACHE_CAPACITY.set(args.cache_capacity as i64);
    let metrics_task = tokio::spawn(metrics::serve_metrics(args.metrics_port, shutdown.child_token()));

    info!(
        topic = %args.topic,
        partitions = args.partitions,
        group = %args.consumer_group,
        cache_capacity = args.cache_capacity,
        max_batch = args.max_batch,
        retry = ?args.retry,
        bg_workers = args.bg_workers,
        bg_queue = args.bg_queue,
        error_sink = ?args.error_sink_file,
        "startup config"
    );

    // ---- Error sink (recorder optional) ----
    let (sink, recorder_task) = match args.error_sink_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (ErrorSink::new(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (ErrorSink::log_only(), None),
    };

    // ---- Broker + mock producers (satu per partisi) ----
    let broker = MemoryBroker::new(args.topic.clone(), args.partitions);
    info!(topic = broker.topic(), partitions = broker.partitions(), "in-memory broker ready");
    let feed_cfg = MockFeedCfg { rate: args.mock_rate, poison_pct: args.mock_poison_pct };
    let feeds: Vec<JoinHandle<()>> = (0..broker.partitions())
        .map(|p| tokio::spawn(feed::run_mock(broker.clone(), p, feed_cfg, shutdown.child_token())))
        .collect();

    // ---- Cache, ledger, coordinator ----
    let cache = Arc::new(TradeCache::new(args.cache_capacity));
    let coordinator = Arc::new(LockCoordinator::new(cache.clone()));

    // ---- Background supervisor ----
    let supervisor = Arc::new(Supervisor::new(args.bg_workers, args.bg_queue));

    // ---- Consumer loops (satu task sekuensial per partisi) ----
    let consumer_cfg = ConsumerCfg {
        poll_timeout: args.poll_timeout,
        retry: args.retry,
        high_value_notional: args.high_value_notional,
    };
    let loops: Vec<(u32, JoinHandle<Result<LoopReport, LoopError>>)> = (0..broker.partitions())
        .map(|p| {
            let stream = broker.subscribe(args.consumer_group.clone(), &[p], args.max_batch);
            let lp = ConsumerLoop::new(stream, coordinator.clone(), sink.clone(), consumer_cfg.clone())
                .with_supervisor(supervisor.clone());
            (p, tokio::spawn(lp.run(shutdown.child_token())))
        })
        .collect();

    // ---- Stop trigger: Ctrl-C atau --run-for-secs ----
    tokio::spawn({
        let token = shutdown.clone();
        let run_for = args.run_for;
        async move {
            let deadline = async {
                match run_for {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            select! {
                r = tokio::signal::ctrl_c() => {
                    if let Err(e) = r {
                        error!(?e, "ctrl_c handler failed");
                    }
                    info!("ctrl-c received, draining");
                }
                _ = deadline => info!(?run_for, "run time elapsed, draining"),
                _ = token.cancelled() => {}
            }
            token.cancel();
        }
    });

    // ---- Heartbeat ----
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                // loop yang selesai sebelum shutdown berarti fatal
                if loops.iter().any(|(_, h)| h.is_finished()) {
                    warn!("consumer loop exited early, shutting down");
                    shutdown.cancel();
                    break;
                }
                let snapshot_pnl = match match_round_trips(&cache.snapshot_unique()) {
                    Ok(summary) => summary.total.to_string(),
                    Err(e) => e.to_string(),
                };
                let oldest_age_ms = if cache.is_empty() {
                    0
                } else {
                    cache.entries().first().map_or(0, |e| (Utc::now() - e.inserted_at).num_milliseconds())
                };
                info!(
                    cache = cache.len(),
                    evicted = cache.evicted(),
                    oldest_age_ms,
                    positions = ?coordinator.positions(),
                    ledger_pnl = %coordinator.realized_pnl(),
                    snapshot_pnl = %snapshot_pnl,
                    bg_in_flight = supervisor.in_flight(),
                    "heartbeat"
                );
            }
        }
    }

    // ---- Drain ----
    let mut fatal = false;
    let mut reports = Vec::new();
    for (p, h) in loops {
        match h.await {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => {
                error!(partition = p, error = %e, "consumer loop failed");
                fatal = true;
            }
            Err(e) => {
                error!(partition = p, error = %e, "consumer loop panicked");
                fatal = true;
            }
        }
    }
    for f in feeds {
        let _ = f.await;
    }

    match supervisor.shutdown(args.shutdown_grace).await {
        ShutdownOutcome::Drained => info!("background work drained"),
        ShutdownOutcome::TimedOut { abandoned } => {
            warn!(abandoned, grace = ?args.shutdown_grace, "background work abandoned at shutdown")
        }
    }

    // recorder berhenti setelah semua pengirim di-drop
    drop(sink);
    if let Some(t) = recorder_task {
        let _ = t.await;
    }
    let _ = metrics_task.await;

    info!(
        positions = ?merge_positions(&reports),
        cache = cache.len(),
        realized_pnl = %coordinator.realized_pnl(),
        fatal,
        "stopped"
    );
    if fatal { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}
