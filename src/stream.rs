// ===============================
// src/stream.rs (partitioned stream boundary + in-memory broker)
// ===============================
//
// `TradeStream` is the only thing the consumer loop knows about the broker:
// poll-with-timeout, synchronous commit, assignment. `MemoryBroker` is an
// in-process partitioned log with per-group committed offsets; it backs the
// mock mode and the tests, including fault injection.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("broker call timed out")]
    Timeout,
    #[error("fatal broker error: {0}")]
    Fatal(String),
    #[error("partition {0} is not assigned")]
    NotAssigned(u32),
}

impl StreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Transient(_) | StreamError::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Option<String>,
}

#[async_trait]
pub trait TradeStream: Send {
    /// Zero or more messages; an empty batch means the timeout elapsed.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<StreamMessage>, StreamError>;
    /// Durably record `offset` as the last processed message of `partition`.
    async fn commit(&mut self, partition: u32, offset: u64) -> Result<(), StreamError>;
    fn assignment(&self) -> Vec<u32>;
}

#[derive(Debug, Clone)]
struct Record { key: Option<String>, payload: Option<String> }

struct BrokerState {
    partitions: Vec<Vec<Record>>,
    // (group, partition) -> last committed offset
    committed: HashMap<(String, u32), u64>,
}

struct BrokerInner {
    topic: String,
    state: Mutex<BrokerState>,
    appended: Notify,
    poll_faults: AtomicU32,
    commit_faults: AtomicU32,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new(topic: impl Into<String>, partitions: u32) -> Self {
        let partitions = partitions.max(1) as usize;
        Self {
            inner: Arc::new(BrokerInner {
                topic: topic.into(),
                state: Mutex::new(BrokerState {
                    partitions: vec![Vec::new(); partitions],
                    committed: HashMap::new(),
                }),
                appended: Notify::new(),
                poll_faults: AtomicU32::new(0),
                commit_faults: AtomicU32::new(0),
            }),
        }
    }

    pub fn topic(&self) -> &str { &self.inner.topic }

    pub fn partitions(&self) -> u32 { self.inner.state.lock().partitions.len() as u32 }

    /// Append to a partition; returns the assigned offset.
    pub fn produce(&self, partition: u32, key: Option<String>, payload: Option<String>) -> Result<u64, StreamError> {
        let offset = {
            let mut st = self.inner.state.lock();
            let log = st
                .partitions
                .get_mut(partition as usize)
                .ok_or(StreamError::NotAssigned(partition))?;
            log.push(Record { key, payload });
            (log.len() - 1) as u64
        };
        self.inner.appended.notify_waiters();
        Ok(offset)
    }

    pub fn committed(&self, group: &str, partition: u32) -> Option<u64> {
        self.inner.state.lock().committed.get(&(group.to_string(), partition)).copied()
    }

    pub fn end_offset(&self, partition: u32) -> u64 {
        self.inner.state.lock().partitions.get(partition as usize).map(|p| p.len() as u64).unwrap_or(0)
    }

    /// The next `n` polls fail with a transient error.
    pub fn inject_poll_faults(&self, n: u32) { self.inner.poll_faults.store(n, Ordering::SeqCst); }

    /// The next `n` commits fail with a transient error.
    pub fn inject_commit_faults(&self, n: u32) { self.inner.commit_faults.store(n, Ordering::SeqCst); }

    /// Consumer for `group` over `partitions`, resuming after each committed offset.
    pub fn subscribe(&self, group: impl Into<String>, partitions: &[u32], max_batch: usize) -> MemoryConsumer {
        let group = group.into();
        let cursor = partitions
            .iter()
            .map(|p| (*p, self.committed(&group, *p).map(|o| o + 1).unwrap_or(0)))
            .collect();
        MemoryConsumer {
            broker: self.clone(),
            group,
            partitions: partitions.to_vec(),
            cursor,
            max_batch: max_batch.max(1),
        }
    }
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    group: String,
    partitions: Vec<u32>,
    cursor: HashMap<u32, u64>,
    max_batch: usize,
}

impl MemoryConsumer {
    fn fetch(&mut self) -> Vec<StreamMessage> {
        let st = self.broker.inner.state.lock();
        let mut out = Vec::new();
        for p in &self.partitions {
            let Some(log) = st.partitions.get(*p as usize) else { continue };
            let next = self.cursor.entry(*p).or_insert(0);
            while (*next as usize) < log.len() && out.len() < self.max_batch {
                let r = &log[*next as usize];
                out.push(StreamMessage {
                    topic: self.broker.inner.topic.clone(),
                    partition: *p,
                    offset: *next,
                    key: r.key.clone(),
                    payload: r.payload.clone(),
                });
                *next += 1;
            }
        }
        out
    }
}

#[async_trait]
impl TradeStream for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<StreamMessage>, StreamError> {
        if take_fault(&self.broker.inner.poll_faults) {
            return Err(StreamError::Transient("injected poll fault".into()));
        }
        let inner = self.broker.inner.clone();
        // None: timeout too large to represent, wait for data only
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = inner.appended.notified();
            let batch = self.fetch();
            if !batch.is_empty() {
                return Ok(batch);
            }
            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn commit(&mut self, partition: u32, offset: u64) -> Result<(), StreamError> {
        if !self.partitions.contains(&partition) {
            return Err(StreamError::NotAssigned(partition));
        }
        if take_fault(&self.broker.inner.commit_faults) {
            return Err(StreamError::Transient("injected commit fault".into()));
        }
        let mut st = self.broker.inner.state.lock();
        st.committed.insert((self.group.clone(), partition), offset);
        Ok(())
    }

    fn assignment(&self) -> Vec<u32> { self.partitions.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_returns_in_order_and_respects_batch_cap() {
        let b = MemoryBroker::new("trades-topic", 1);
        for i in 0..5 {
            b.produce(0, None, Some(format!("BUY AAPL {} 1", i + 1))).unwrap();
        }
        let mut c = b.subscribe("g", &[0], 3);
        let first = c.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![0, 1, 2]);
        let second = c.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![3, 4]);
        assert!(c.poll(Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[test]
    fn broker_reports_topic_and_partition_count() {
        let b = MemoryBroker::new("trades-topic", 4);
        assert_eq!(b.topic(), "trades-topic");
        assert_eq!(b.partitions(), 4);
    }

    #[tokio::test]
    async fn resubscribe_resumes_after_commit() {
        let b = MemoryBroker::new("t", 1);
        for _ in 0..4 {
            b.produce(0, None, Some("x".into())).unwrap();
        }
        let mut c = b.subscribe("g", &[0], 10);
        c.poll(Duration::from_millis(10)).await.unwrap();
        c.commit(0, 1).await.unwrap();
        let mut again = b.subscribe("g", &[0], 10);
        let msgs = again.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(msgs[0].offset, 2);
    }

    #[tokio::test]
    async fn poll_wakes_on_produce() {
        let b = MemoryBroker::new("t", 1);
        let mut c = b.subscribe("g", &[0], 10);
        let producer = b.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce(0, None, Some("late".into())).unwrap();
        });
        let msgs = c.poll(Duration::from_secs(2)).await.unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_consumed() {
        let b = MemoryBroker::new("t", 1);
        b.inject_poll_faults(1);
        b.inject_commit_faults(1);
        let mut c = b.subscribe("g", &[0], 10);
        let err = c.poll(Duration::from_millis(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(c.poll(Duration::from_millis(1)).await.is_ok());
        assert!(c.commit(0, 0).await.is_err());
        assert!(c.commit(0, 0).await.is_ok());
        assert_eq!(c.commit(3, 0).await, Err(StreamError::NotAssigned(3)));
    }

    #[tokio::test]
    async fn huge_poll_timeout_does_not_overflow() {
        let b = MemoryBroker::new("t", 1);
        b.produce(0, None, Some("BUY AAPL 1 1".into())).unwrap();
        let mut c = b.subscribe("g", &[0], 10);
        let batch = c.poll(Duration::MAX).await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
