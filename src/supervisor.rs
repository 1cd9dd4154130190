// ===============================
// src/supervisor.rs (background task supervisor)
// ===============================
//
// Fixed pool of worker tasks pulling from one bounded queue. The supervisor
// is the single owner of the pool: `shutdown` closes the queue, waits up to
// the grace timeout, then aborts whatever is still running. Submission never
// blocks; a full queue is reported to the caller instead of growing.
//
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::{BG_COMPLETED, BG_IN_FLIGHT, BG_REJECTED};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error("background queue full (capacity {0})")]
    QueueFull(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Panicked(String),
    /// Dropped or aborted before finishing (shutdown timeout).
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Drained,
    TimedOut { abandoned: usize },
}

struct Job {
    name: String,
    fut: BoxFuture<'static, ()>,
    done: oneshot::Sender<TaskOutcome>,
    _slot: InFlight,
}

// decremented on drop, so aborted or dropped jobs are accounted too
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        BG_IN_FLIGHT.inc();
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        BG_IN_FLIGHT.dec();
    }
}

pub struct TaskHandle {
    pub name: String,
    done: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub async fn wait(self) -> TaskOutcome {
        self.done.await.unwrap_or(TaskOutcome::Abandoned)
    }
}

pub struct Supervisor {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    queue_capacity: usize,
}

impl Supervisor {
    /// Must be called inside a tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|id| {
                let rx = rx.clone();
                tokio::spawn(async move { worker(id, rx).await })
            })
            .collect();

        info!(workers, queue_capacity, "supervisor: started");
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            in_flight: Arc::new(AtomicUsize::new(0)),
            queue_capacity,
        }
    }

    pub fn submit<F>(&self, name: impl Into<String>, fut: F) -> Result<TaskHandle, SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let tx = self.tx.lock().clone().ok_or_else(|| {
            BG_REJECTED.with_label_values(&["shutting_down"]).inc();
            SubmitError::ShuttingDown
        })?;

        let (done_tx, done_rx) = oneshot::channel();
        let job = Job { name: name.clone(), fut: Box::pin(fut), done: done_tx, _slot: InFlight::new(&self.in_flight) };
        match tx.try_send(job) {
            Ok(()) => Ok(TaskHandle { name, done: done_rx }),
            Err(mpsc::error::TrySendError::Full(_)) => {
                BG_REJECTED.with_label_values(&["queue_full"]).inc();
                Err(SubmitError::QueueFull(self.queue_capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                BG_REJECTED.with_label_values(&["shutting_down"]).inc();
                Err(SubmitError::ShuttingDown)
            }
        }
    }

    /// Blocking work runs on the blocking pool so workers never stall the runtime.
    pub fn submit_blocking<F>(&self, name: impl Into<String>, f: F) -> Result<TaskHandle, SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(name, async move {
            if let Err(e) = tokio::task::spawn_blocking(f).await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        })
    }

    /// Queued + running tasks.
    pub fn in_flight(&self) -> usize { self.in_flight.load(Ordering::SeqCst) }

    pub fn is_accepting(&self) -> bool { self.tx.lock().is_some() }

    /// Stop accepting, wait up to `timeout` for outstanding work, abort the rest.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        // closing the sender lets workers exit once the queue is empty
        drop(self.tx.lock().take());
        let mut handles = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now().checked_add(timeout);
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        while let Some(mut h) = handles.pop() {
            tokio::select! {
                _ = &mut h => {}
                _ = &mut expired => {
                    let abandoned = self.in_flight();
                    h.abort();
                    for rest in &handles {
                        rest.abort();
                    }
                    // aborted workers drop their jobs; wait for them so counts settle
                    let _ = h.await;
                    for rest in handles {
                        let _ = rest.await;
                    }
                    warn!(?timeout, abandoned, "supervisor: shutdown timed out, remaining work aborted");
                    return ShutdownOutcome::TimedOut { abandoned };
                }
            }
        }
        info!("supervisor: drained");
        ShutdownOutcome::Drained
    }
}

async fn worker(id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };
        let Job { name, fut, done, _slot } = job;
        debug!(worker = id, task = %name, "supervisor: task started");

        // panic di dalam task tidak boleh mematikan worker
        let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(()) => TaskOutcome::Completed,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(worker = id, task = %name, %msg, "supervisor: task panicked");
                TaskOutcome::Panicked(msg)
            }
        };
        BG_COMPLETED.inc();
        drop(_slot);
        let _ = done.send(outcome);
    }
    debug!(worker = id, "supervisor: worker exit");
}
