// ===============================
// src/consumer.rs (poll -> validate -> apply -> commit)
// ===============================
//
// One sequential loop per assignment. State machine:
//
//   Idle -> Polling -> Validating -> Applying -> Committing -> Polling ...
//   any state --cancel--> Draining -> Stopped
//
// Cancellation is only observed while Polling (or between batches); a batch
// that has been received is always validated, applied and committed before
// the loop stops. The read position of a partition is committed only after
// every message of the batch up to that offset was applied or recorded as
// poison, so a crash in between means redelivery (at-least-once), never loss.
//
use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::decode;
use crate::coordinator::LockCoordinator;
use crate::domain::{now_ns, Event, PoisonRecord, ReadPosition, TradeEvent};
use crate::metrics::{
    COMMITS, COMMIT_RETRIES, HIGH_VALUE_TRADES, MESSAGES_POLLED, POISON_MESSAGES, READ_POSITION,
    STREAM_RETRIES, TRADES_APPLIED,
};
use crate::notify::{self, BatchSummary};
use crate::recorder::ErrorSink;
use crate::retry::RetryPolicy;
use crate::stream::{StreamError, StreamMessage, TradeStream};
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Validating,
    Applying,
    Committing,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error("poll failed after {attempts} attempts: {last}")]
    PollRetriesExhausted { attempts: u32, last: StreamError },
    #[error("commit partition={partition} offset={offset} failed after {attempts} attempts: {last}")]
    CommitRetriesExhausted { partition: u32, offset: u64, attempts: u32, last: StreamError },
    #[error("stream error: {0}")]
    Stream(StreamError),
}

#[derive(Debug, Clone)]
pub struct ConsumerCfg {
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
    /// Trades with a larger notional are flagged (still applied).
    pub high_value_notional: Decimal,
}

impl Default for ConsumerCfg {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            high_value_notional: Decimal::from(1_000_000),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub batches: u64,
    pub applied: u64,
    pub poison: u64,
    /// Last committed offset per partition.
    pub positions: BTreeMap<u32, u64>,
}

#[derive(Default)]
struct PartitionBatch {
    last_offset: u64,
    applied: usize,
    poison: usize,
    high_value: Vec<String>,
}

pub struct ConsumerLoop<S: TradeStream> {
    stream: S,
    coordinator: Arc<LockCoordinator>,
    sink: ErrorSink,
    supervisor: Option<Arc<Supervisor>>,
    cfg: ConsumerCfg,
    state_tx: watch::Sender<LoopState>,
    report: LoopReport,
}

impl<S: TradeStream> ConsumerLoop<S> {
    pub fn new(stream: S, coordinator: Arc<LockCoordinator>, sink: ErrorSink, cfg: ConsumerCfg) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Self { stream, coordinator, sink, supervisor: None, cfg, state_tx, report: LoopReport::default() }
    }

    /// Post-commit notifications go to this supervisor's pool.
    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn state(&self) -> watch::Receiver<LoopState> { self.state_tx.subscribe() }

    fn set_state(&self, s: LoopState) {
        self.state_tx.send_replace(s);
    }

    /// Run until `shutdown` fires (Ok) or an unrecoverable error (Err).
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<LoopReport, LoopError> {
        let assignment = self.stream.assignment();
        info!(partitions = ?assignment, "consumer: started");

        let res = self.run_batches(&shutdown).await;
        self.set_state(LoopState::Stopped);

        match res {
            Ok(()) => {
                info!(
                    partitions = ?assignment,
                    batches = self.report.batches,
                    applied = self.report.applied,
                    poison = self.report.poison,
                    positions = ?self.report.positions,
                    "consumer: stopped"
                );
                Ok(self.report)
            }
            Err(e) => {
                error!(error = %e, partitions = ?assignment, "consumer: halted");
                self.sink.record(Event::Fatal {
                    ts_ns: now_ns(),
                    partition: assignment.first().copied(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_batches(&mut self, shutdown: &CancellationToken) -> Result<(), LoopError> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.set_state(LoopState::Polling);
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                r = self.poll_with_retry() => Some(r),
            };
            let batch = match polled {
                None => break,
                Some(r) => r?,
            };
            if batch.is_empty() {
                continue;
            }
            self.process_batch(batch).await?;
        }
        self.set_state(LoopState::Draining);
        debug!("consumer: draining, no batch in flight");
        Ok(())
    }

    // Guard against a broker call that ignores its own timeout.
    fn call_timeout(&self) -> Duration {
        self.cfg.poll_timeout.saturating_mul(2).saturating_add(Duration::from_millis(250))
    }

    async fn poll_with_retry(&mut self) -> Result<Vec<StreamMessage>, LoopError> {
        let mut attempt: u32 = 0;
        loop {
            let call_timeout = self.call_timeout();
            let call = self.stream.poll(self.cfg.poll_timeout);
            let res = match tokio::time::timeout(call_timeout, call).await {
                Ok(r) => r,
                Err(_) => Err(StreamError::Timeout),
            };
            match res {
                Ok(batch) => return Ok(batch),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if self.cfg.retry.exhausted(attempt) {
                        return Err(LoopError::PollRetriesExhausted { attempts: attempt, last: e });
                    }
                    STREAM_RETRIES.inc();
                    let delay = self.cfg.retry.delay(attempt);
                    warn!(error = %e, attempt, ?delay, "consumer: poll failed, retrying");
                    sleep(delay).await;
                }
                Err(e) => return Err(LoopError::Stream(e)),
            }
        }
    }

    async fn commit_with_retry(&mut self, partition: u32, offset: u64) -> Result<(), LoopError> {
        let mut attempt: u32 = 0;
        loop {
            let call_timeout = self.call_timeout();
            let call = self.stream.commit(partition, offset);
            let res = match tokio::time::timeout(call_timeout, call).await {
                Ok(r) => r,
                Err(_) => Err(StreamError::Timeout),
            };
            match res {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if self.cfg.retry.exhausted(attempt) {
                        return Err(LoopError::CommitRetriesExhausted { partition, offset, attempts: attempt, last: e });
                    }
                    COMMIT_RETRIES.inc();
                    let delay = self.cfg.retry.delay(attempt);
                    warn!(error = %e, partition, offset, attempt, ?delay, "consumer: commit failed, retrying");
                    sleep(delay).await;
                }
                Err(e) => return Err(LoopError::Stream(e)),
            }
        }
    }

    fn record_poison(&mut self, msg: &StreamMessage, reason: String) {
        POISON_MESSAGES.with_label_values(&[&msg.partition.to_string()]).inc();
        warn!(partition = msg.partition, offset = msg.offset, %reason, "poison message skipped");
        self.sink.record(Event::Poison(PoisonRecord {
            ts_ns: now_ns(),
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            payload: msg.payload.clone(),
            reason,
        }));
        self.report.poison += 1;
    }

    async fn process_batch(&mut self, batch: Vec<StreamMessage>) -> Result<(), LoopError> {
        let mut parts: BTreeMap<u32, PartitionBatch> = BTreeMap::new();

        // Validating
        self.set_state(LoopState::Validating);
        let mut valid: Vec<(&StreamMessage, TradeEvent)> = Vec::with_capacity(batch.len());
        for msg in &batch {
            MESSAGES_POLLED.with_label_values(&[&msg.partition.to_string()]).inc();
            let entry = parts.entry(msg.partition).or_default();
            entry.last_offset = entry.last_offset.max(msg.offset);
            match decode(msg) {
                Ok(ev) => valid.push((msg, ev)),
                Err(reason) => {
                    entry.poison += 1;
                    self.record_poison(msg, reason.to_string());
                }
            }
        }

        // Applying (stream order preserved per partition)
        self.set_state(LoopState::Applying);
        let mut evicted = 0usize;
        for (msg, ev) in valid {
            let entry = parts.entry(ev.partition).or_default();
            let high_value = ev.notional().map_or(true, |n| n > self.cfg.high_value_notional);
            let id = ev.id.clone();
            match self.coordinator.process_trade(ev) {
                Ok(out) => {
                    if out.evicted.is_some() {
                        evicted += 1;
                    }
                    if high_value {
                        HIGH_VALUE_TRADES.inc();
                        entry.high_value.push(id);
                    }
                    entry.applied += 1;
                    TRADES_APPLIED.inc();
                    self.report.applied += 1;
                }
                // ledger cannot hold it: rejected like any other poison message
                Err(e) => {
                    entry.poison += 1;
                    self.record_poison(msg, e.to_string());
                }
            }
        }
        if evicted > 0 {
            debug!(evicted, "cache at capacity, oldest entries evicted");
        }

        // Committing
        self.set_state(LoopState::Committing);
        for (partition, pb) in parts {
            self.commit_with_retry(partition, pb.last_offset).await?;
            self.report.positions.insert(partition, pb.last_offset);
            COMMITS.with_label_values(&[&partition.to_string()]).inc();
            READ_POSITION.with_label_values(&[&partition.to_string()]).set(pb.last_offset as i64);
            self.notify(BatchSummary {
                position: ReadPosition { partition, offset: pb.last_offset },
                applied: pb.applied,
                poison: pb.poison,
                high_value: pb.high_value,
            });
        }
        self.report.batches += 1;
        Ok(())
    }

    // Non-blocking hand-off; a refused submission is recorded, never awaited.
    fn notify(&self, summary: BatchSummary) {
        let Some(sup) = &self.supervisor else { return };
        let name = format!("notify-{}-{}", summary.position.partition, summary.position.offset);
        if let Err(e) = sup.submit(name.clone(), notify::run(summary)) {
            warn!(error = %e, task = %name, "consumer: notification not scheduled");
            self.sink.record(Event::TaskRejected { ts_ns: now_ns(), task: name, reason: e.to_string() });
        }
    }
}

/// Partition -> last committed offset, merged across loop reports.
pub fn merge_positions(reports: &[LoopReport]) -> HashMap<u32, u64> {
    let mut out = HashMap::new();
    for r in reports {
        for (p, o) in &r.positions {
            let e = out.entry(*p).or_insert(*o);
            *e = (*e).max(*o);
        }
    }
    out
}
