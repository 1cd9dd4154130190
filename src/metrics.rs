// ===============================
// src/metrics.rs
// ===============================
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Consumer loop --------
pub static MESSAGES_POLLED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("messages_polled_total", "stream messages received per partition"),
        &["partition"],
    )
    .unwrap()
});

pub static TRADES_APPLIED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trades_applied_total", "trades written to the cache").unwrap());

pub static POISON_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("poison_messages_total", "messages skipped as unparsable"),
        &["partition"],
    )
    .unwrap()
});

pub static HIGH_VALUE_TRADES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("high_value_trades_total", "trades above the notional alert threshold")
        .unwrap()
});

pub static STREAM_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("stream_retries_total", "transient poll errors retried").unwrap()
});

pub static COMMIT_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("commit_retries_total", "offset commits retried").unwrap()
});

pub static COMMITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("commits_total", "successful offset commits"),
        &["partition"],
    )
    .unwrap()
});

pub static READ_POSITION: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("read_position", "last committed offset per partition"),
        &["partition"],
    )
    .unwrap()
});

// -------- Cache --------
pub static CACHE_SIZE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("trade_cache_size", "entries in the trade cache").unwrap());

pub static CACHE_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("trade_cache_evictions_total", "FIFO evictions from the trade cache").unwrap()
});

// -------- Background tasks --------
pub static BG_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("background_tasks_in_flight", "queued + running background tasks").unwrap()
});

pub static BG_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("background_tasks_completed_total", "background tasks finished").unwrap()
});

pub static BG_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("background_tasks_rejected_total", "submissions refused"),
        &["reason"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_PARTITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_partitions", "configured partitions").unwrap());

pub static CONFIG_CACHE_CAPACITY: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_cache_capacity", "trade cache C_max").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(MESSAGES_POLLED.clone())),
        REGISTRY.register(Box::new(TRADES_APPLIED.clone())),
        REGISTRY.register(Box::new(POISON_MESSAGES.clone())),
        REGISTRY.register(Box::new(HIGH_VALUE_TRADES.clone())),
        REGISTRY.register(Box::new(STREAM_RETRIES.clone())),
        REGISTRY.register(Box::new(COMMIT_RETRIES.clone())),
        REGISTRY.register(Box::new(COMMITS.clone())),
        REGISTRY.register(Box::new(READ_POSITION.clone())),
        REGISTRY.register(Box::new(CACHE_SIZE.clone())),
        REGISTRY.register(Box::new(CACHE_EVICTIONS.clone())),
        REGISTRY.register(Box::new(BG_IN_FLIGHT.clone())),
        REGISTRY.register(Box::new(BG_COMPLETED.clone())),
        REGISTRY.register(Box::new(BG_REJECTED.clone())),
        REGISTRY.register(Box::new(CONFIG_PARTITIONS.clone())),
        REGISTRY.register(Box::new(CONFIG_CACHE_CAPACITY.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let body = encode_metrics();
    let rsp = Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("# no metrics\n")));
    Ok(rsp)
}

/// Serve `/metrics` (any path, actually) until `shutdown` fires.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on http://{addr}/metrics");

    let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = graceful.await {
        error!(?e, "metrics server error");
    }
}
