use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::DownloadCoordinator;
use crate::error::{Error, Result};
use crate::models::{DownloadKind, DownloadTask, FailureRecord};
use crate::persistence::FailureJournal;
use crate::scheduler::StopSignal;

/// Outcome of a failure-journal retry pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    pub requeued: usize,
    pub kept: usize,
    pub cleared: usize,
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<DownloadTask>>>;

/// Background download workers
///
/// Workers pull tasks, opportunistically batch same-kind tasks, merge results
/// into the cache and journal terminal failures.
pub struct DownloadQueue {
    tx: mpsc::UnboundedSender<DownloadTask>,
    coordinator: Arc<DownloadCoordinator>,
    journal: Arc<FailureJournal>,
    stop: StopSignal,
    pending: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadQueue {
    /// Spawn `settings.workers` workers on the current runtime
    pub fn start(coordinator: Arc<DownloadCoordinator>, journal: Arc<FailureJournal>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));
        let stop = StopSignal::new();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_count = coordinator.settings().workers.max(1);

        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    coordinator.clone(),
                    journal.clone(),
                    rx.clone(),
                    tx.clone(),
                    stop.clone(),
                    pending.clone(),
                ))
            })
            .collect();

        tracing::info!("Started {} download workers", worker_count);

        Self {
            tx,
            coordinator,
            journal,
            stop,
            pending,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a download without waiting
    pub fn enqueue(&self, symbol: &str, kind: DownloadKind) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(Error::ChannelClosed);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(DownloadTask::new(symbol, kind))
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Error::ChannelClosed
            })
    }

    /// Tasks queued or in flight
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn coordinator(&self) -> &Arc<DownloadCoordinator> {
        &self.coordinator
    }

    /// Re-enqueue up to `max_attempts` of the oldest journaled failures
    ///
    /// Records that cannot be enqueued are written back to the journal.
    pub async fn retry_failures(&self, max_attempts: usize) -> Result<RetryStats> {
        if self.stop.is_stopped() {
            return Err(Error::ChannelClosed);
        }

        let (taken, mut kept) = self.journal.take_oldest(max_attempts).await?;
        let mut requeued = 0;
        for record in &taken {
            match self.enqueue(&record.symbol, record.kind) {
                Ok(()) => requeued += 1,
                Err(e) => {
                    tracing::warn!(symbol = %record.symbol, "Retry not queued, keeping record: {}", e);
                    self.journal.record(record).await?;
                    kept += 1;
                }
            }
        }

        tracing::info!("Retry pass: requeued {}, kept {}", requeued, kept);
        Ok(RetryStats {
            requeued,
            kept,
            cleared: requeued,
        })
    }

    /// Signal workers and join them, aborting any that overrun the stop timeout
    pub async fn stop(&self) {
        self.stop.stop();
        let timeout = self.coordinator.settings().stop_timeout();
        let mut workers = self.workers.lock().await;
        for mut handle in workers.drain(..) {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                tracing::warn!("Download worker did not stop within {:?}, aborting", timeout);
                handle.abort();
            }
        }
        tracing::info!("Download workers stopped");
    }
}

async fn worker_loop(
    id: usize,
    coordinator: Arc<DownloadCoordinator>,
    journal: Arc<FailureJournal>,
    rx: SharedReceiver,
    tx: mpsc::UnboundedSender<DownloadTask>,
    stop: StopSignal,
    pending: Arc<AtomicUsize>,
) {
    let poll = coordinator.settings().queue_poll();
    let batch_size = coordinator.settings().batch_size.max(1);

    while !stop.is_stopped() {
        let batch = {
            let mut rx = rx.lock().await;
            let first = match tokio::time::timeout(poll, rx.recv()).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(_) => continue,
            };

            let mut batch = vec![first];
            while batch.len() < batch_size {
                match rx.try_recv() {
                    Ok(task) if task.kind == batch[0].kind => batch.push(task),
                    Ok(other) => {
                        // Different kind goes back for another worker
                        let _ = tx.send(other);
                        break;
                    }
                    Err(_) => break,
                }
            }
            batch
        };

        tracing::debug!(worker = id, "Processing {} {:?} tasks", batch.len(), batch[0].kind);

        for task in batch {
            match coordinator.fetch_and_merge(&task.symbol, task.kind).await {
                Ok(count) => {
                    tracing::debug!(worker = id, symbol = %task.symbol, "Merged {} bars", count);
                }
                Err(e) => {
                    let record = FailureRecord {
                        symbol: task.symbol.clone(),
                        kind: task.kind,
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    };
                    if let Err(journal_err) = journal.record(&record).await {
                        tracing::warn!("Failed to journal download failure: {}", journal_err);
                    }
                }
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    tracing::debug!(worker = id, "Download worker exiting");
}
