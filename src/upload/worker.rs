use super::store::{SharedObjectStore, StoreError};
use crate::batch::partition::object_key;
use crate::buffer::{BufferError, FileState, PendingFile, SharedOfflineBuffer};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Counters shared by every upload worker.
#[derive(Debug, Default)]
pub struct UploadStats {
    uploaded_files: AtomicU64,
    uploaded_bytes: AtomicU64,
    retryable_failures: AtomicU64,
    permanent_failures: AtomicU64,
}

pub type SharedUploadStats = Arc<UploadStats>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadStatsSnapshot {
    pub uploaded_files: u64,
    pub uploaded_bytes: u64,
    pub retryable_failures: u64,
    pub permanent_failures: u64,
}

impl UploadStats {
    pub fn shared() -> SharedUploadStats {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> UploadStatsSnapshot {
        UploadStatsSnapshot {
            uploaded_files: self.uploaded_files.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            retryable_failures: self.retryable_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub prefix: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

/// Drains the offline buffer into the object store, one file at a time.
pub struct UploadWorker {
    id: usize,
    buffer: SharedOfflineBuffer,
    store: SharedObjectStore,
    settings: WorkerSettings,
    stats: SharedUploadStats,
}

impl UploadWorker {
    pub fn new(
        id: usize,
        buffer: SharedOfflineBuffer,
        store: SharedObjectStore,
        settings: WorkerSettings,
        stats: SharedUploadStats,
    ) -> Self {
        Self {
            id,
            buffer,
            store,
            settings,
            stats,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until shutdown is signalled. An upload already in flight is
    /// resolved before the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, store = %self.store.describe(), "Upload worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.buffer.claim_next() {
                Some(file) => self.upload_one(file).await,
                None => {
                    let wait = self.idle_wait();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(worker = self.id, "Upload worker stopped");
    }

    /// Sleep until the next retry comes due, capped by the poll interval so
    /// freshly admitted files are picked up promptly.
    fn idle_wait(&self) -> Duration {
        let poll = self.settings.poll_interval;
        match self.buffer.next_retry_at() {
            Some(at) => (at - Utc::now())
                .to_std()
                .map(|until| until.min(poll))
                .unwrap_or(Duration::from_millis(1)),
            None => poll,
        }
    }

    async fn upload_one(&self, file: PendingFile) {
        let key = object_key(&self.settings.prefix, &file.relative_path);
        debug!(worker = self.id, key = %key, attempt = file.attempt_count + 1, "Uploading batch");

        let put = self.store.put_file(&key, &file.path);
        let result = match tokio::time::timeout(self.settings.request_timeout, put).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Retryable(format!(
                "request timed out after {:?}",
                self.settings.request_timeout
            ))),
        };

        let size_bytes = file.size_bytes;
        let buffer = self.buffer.clone();
        let resolution = match result {
            Ok(()) => {
                self.stats.uploaded_files.fetch_add(1, Ordering::Relaxed);
                self.stats.uploaded_bytes.fetch_add(size_bytes, Ordering::Relaxed);
                info!(worker = self.id, key = %key, size_bytes, "Batch uploaded");
                tokio::task::spawn_blocking(move || buffer.mark_archived(&file)).await
            }
            Err(e) if e.is_retryable() => {
                self.stats.retryable_failures.fetch_add(1, Ordering::Relaxed);
                let reason = e.to_string();
                tokio::task::spawn_blocking(move || buffer.mark_failed_attempt(&file, &reason)).await
            }
            Err(e) => {
                let reason = e.to_string();
                tokio::task::spawn_blocking(move || {
                    buffer.mark_failed(&file, &reason).map(|_| FileState::Failed)
                })
                .await
            }
        };

        match resolution {
            Ok(Ok(FileState::Failed)) => {
                self.stats.permanent_failures.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log_resolution_error(self.id, &key, &e),
            Err(e) => error!(worker = self.id, key = %key, error = %e, "Buffer update task failed"),
        }
    }
}

fn log_resolution_error(worker: usize, key: &str, e: &BufferError) {
    error!(worker, key, error = %e, "Failed to record upload outcome");
}
