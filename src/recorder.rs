// ===============================
// src/recorder.rs
// ===============================
//
// Error sink + JSONL recorder:
// - `ErrorSink` dipegang consumer loop / supervisor; setiap poison message,
//   task yang ditolak, dan kondisi fatal dikirim sebagai `Event`.
// - `run` menulis setiap Event ke file .jsonl (append) dengan BufWriter.
// - Flush periodik tiap 1s dan/atau tiap 1000 event.
// - Jika tulis gagal, coba reopen file dan lanjut.
//
// ENV: set `ERROR_SINK_FILE=/path/to/errors.jsonl` agar aktif (lihat main.rs).
//
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

/// Cheap, clonable handle. Never blocks the caller.
#[derive(Clone)]
pub struct ErrorSink {
    tx: Option<mpsc::Sender<Event>>,
    recorded: Arc<AtomicU64>,
}

impl ErrorSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx: Some(tx), recorded: Arc::new(AtomicU64::new(0)) }
    }

    /// Sink that only logs (no recorder attached).
    pub fn log_only() -> Self {
        Self { tx: None, recorded: Arc::new(AtomicU64::new(0)) }
    }

    pub fn record(&self, ev: Event) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        let Some(tx) = &self.tx else {
            warn!(event = ?ev, "error sink");
            return;
        };
        if let Err(e) = tx.try_send(ev) {
            let ev = match e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            error!(event = ?ev, "error sink unavailable, event logged only");
        }
    }

    /// Events handed to the sink so far.
    pub fn recorded(&self) -> u64 { self.recorded.load(Ordering::Relaxed) }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            // tetap drain channel supaya pengirim tidak tersumbat
            error!(?e, %path, "recorder: open failed, events will be logged only");
            while let Some(ev) = rx.recv().await {
                warn!(event = ?ev, "error sink (no file)");
            }
            return;
        }
    };

    // Flush periodik (tiap 1 detik) + flush berbasis jumlah event
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    Some(ev) => {
                        let line = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, event = ?ev, "recorder: serialize error");
                                continue;
                            }
                        };

                        if let Err(e) = write_line(&mut writer, &line).await {
                            error!(?e, "recorder: write failed, attempting reopen");
                            match open_writer(&path).await {
                                Ok(w) => {
                                    writer = w;
                                    if let Err(e2) = write_line(&mut writer, &line).await {
                                        error!(?e2, %line, "recorder: write failed again after reopen");
                                    }
                                }
                                Err(e2) => error!(?e2, %line, "recorder: reopen failed"),
                            }
                        }

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        // Channel closed: flush dan keluar
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(task: &str) -> Event {
        Event::TaskRejected { ts_ns: 0, task: task.into(), reason: "queue full".into() }
    }

    #[tokio::test]
    async fn sink_forwards_and_counts() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ErrorSink::new(tx);
        sink.record(rejected("hello"));
        assert_eq!(sink.recorded(), 1);
        assert!(matches!(rx.recv().await, Some(Event::TaskRejected { task, .. }) if task == "hello"));
    }

    #[tokio::test]
    async fn full_sink_does_not_block() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = ErrorSink::new(tx);
        sink.record(rejected("a"));
        sink.record(rejected("b"));
        assert_eq!(sink.recorded(), 2);
    }

    #[tokio::test]
    async fn recorder_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        // nested path: parent directory is created by the recorder
        let path = dir.path().join("sink").join("errors.jsonl");
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(rx, path.to_string_lossy().to_string()));
        tx.send(rejected("one")).await.unwrap();
        tx.send(rejected("two")).await.unwrap();
        drop(tx);
        task.await.unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<Event> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert!(matches!(&lines[1], Event::TaskRejected { task, .. } if task == "two"));
    }
}
