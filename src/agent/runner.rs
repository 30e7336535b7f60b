use super::capture::{
    CaptureLoop, CaptureSummary, DecodeFrames, FrameConsumer, LogFrames, PersistFrames, StopReason,
};
use super::decode::CatalogDecoder;
use crate::batch::{BatchError, Batcher, ParquetBatchWriter};
use crate::buffer::{BufferError, BufferSettings, OfflineBuffer, SharedOfflineBuffer};
use crate::config::types::Config;
use crate::health::HealthMonitor;
use crate::source::{
    BusDriver, BusSettings, CaptureClock, FrameSource, HardwareSource, OpenPolicy,
    SharedSourceStats, SimulatedSource, SourceError, SourceStats,
};
use crate::upload::{build_store, UploadStats, UploadWorker, WorkerSettings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("batch writer error: {0}")]
    Batch(#[from] BatchError),

    #[error("offline buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("hardware capture unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("uploads are enabled but no store is configured")]
    NoStore,

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Hardware source, batching, buffering and upload.
    Full,
    /// Hardware source, frames logged only. The bus must open on the first try.
    DryRun,
    /// Hardware source, frames decoded to stdout. Nothing is persisted.
    DecodeLive,
    /// Full pipeline fed by the drive-cycle simulator.
    Simulate,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::DryRun => "dry-run",
            RunMode::DecodeLive => "decode-live",
            RunMode::Simulate => "simulate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub mode: RunMode,
    pub capture: CaptureSummary,
    pub batches_queued: u64,
    pub frames_lost: u64,
    /// Health reports emitted during the session.
    pub health_reports: u64,
}

/// Owns startup wiring and the shutdown sequence for one agent session.
pub struct AgentRunner {
    config: Config,
    mode: RunMode,
    source: Option<Box<dyn FrameSource>>,
}

impl AgentRunner {
    pub fn new(config: Config, mode: RunMode) -> Self {
        Self {
            config,
            mode,
            source: None,
        }
    }

    /// Use `source` instead of building one from the config.
    pub fn with_source(mut self, source: Box<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Run until SIGINT/SIGTERM or until the source ends.
    pub async fn run(self) -> Result<RunSummary, AgentError> {
        self.run_until(termination_signal()).await
    }

    /// Run until `stop` resolves or until the source ends.
    ///
    /// Shutdown order: stop reading, seal the open batch, let in-flight
    /// uploads resolve, then stop the workers and the health monitor.
    pub async fn run_until<F>(mut self, stop: F) -> Result<RunSummary, AgentError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let vehicle_id: Arc<str> = Arc::from(self.config.resolved_vehicle_id());
        info!(
            mode = self.mode.as_str(),
            vehicle_id = %vehicle_id,
            data_dir = %self.config.data_dir.display(),
            "Starting edge agent"
        );

        let clock = CaptureClock::new();
        let source = match self.source.take() {
            Some(source) => source,
            None => {
                let stats = SourceStats::shared(self.config.health.fps_window);
                self.build_source(clock, stats, vehicle_id.clone())?
            }
        };
        let stats = source.stats();

        let (stop_tx, stop_rx) = watch::channel(false);
        let signal_task = tokio::spawn(async move {
            stop.await;
            let _ = stop_tx.send(true);
        });

        let result = match self.mode {
            RunMode::DryRun => {
                self.run_transient(source, LogFrames::default(), stats, clock, stop_rx)
                    .await
            }
            RunMode::DecodeLive => {
                let consumer = DecodeFrames::new(Box::new(CatalogDecoder), std::io::stdout());
                self.run_transient(source, consumer, stats, clock, stop_rx).await
            }
            RunMode::Full | RunMode::Simulate => {
                self.run_pipeline(source, stats, clock, vehicle_id, stop_rx).await
            }
        };

        signal_task.abort();
        if let Ok(summary) = &result {
            info!(
                mode = summary.mode.as_str(),
                frames = summary.capture.frames,
                batches = summary.batches_queued,
                frames_lost = summary.frames_lost,
                stop = ?summary.capture.stop,
                "Edge agent stopped"
            );
        }
        result
    }

    /// Capture into a consumer that persists nothing, with health reports.
    async fn run_transient<C: FrameConsumer + 'static>(
        &self,
        source: Box<dyn FrameSource>,
        consumer: C,
        stats: SharedSourceStats,
        clock: CaptureClock,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<RunSummary, AgentError> {
        let (services_tx, services_rx) = watch::channel(false);
        let health = self.spawn_health(stats, None, None, services_rx);

        let capture = CaptureLoop::new(source, consumer, clock, self.config.can.read_timeout);
        let (summary, _) = capture_until(capture, stop_rx).await?;

        let _ = services_tx.send(true);
        Ok(RunSummary {
            mode: self.mode,
            capture: summary,
            batches_queued: 0,
            frames_lost: 0,
            health_reports: join_health(health).await,
        })
    }

    async fn run_pipeline(
        &self,
        source: Box<dyn FrameSource>,
        stats: SharedSourceStats,
        clock: CaptureClock,
        vehicle_id: Arc<str>,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<RunSummary, AgentError> {
        let settings = BufferSettings::from_config(&self.config.buffer, &self.config.upload);
        let buffer: SharedOfflineBuffer = Arc::new(OfflineBuffer::open(&self.config.data_dir, settings)?);
        let writer = ParquetBatchWriter::new(
            buffer.layout().staging.clone(),
            self.config.batch.compression,
            self.config.batch.zstd_level,
        )?;
        let batcher = Batcher::new(
            writer,
            self.config.batch.window,
            self.config.batch.max_frames,
            vehicle_id,
        );

        // Workers and the health monitor outlive capture so the final batch
        // is queued before they are told to stop.
        let (services_tx, services_rx) = watch::channel(false);
        let upload_stats = UploadStats::shared();
        let workers = self.spawn_workers(&buffer, &upload_stats, services_rx.clone()).await?;
        let health = self.spawn_health(
            stats,
            Some(buffer.clone()),
            Some(upload_stats.clone()),
            services_rx,
        );

        let capture = CaptureLoop::new(
            source,
            PersistFrames::new(batcher, buffer.clone()),
            clock,
            self.config.can.read_timeout,
        );
        let (summary, persisted) = capture_until(capture, stop_rx.clone()).await?;

        if summary.stop == StopReason::EndOfStream && !workers.is_empty() {
            drain_queue(&buffer, self.config.upload.poll_interval, stop_rx).await;
        }

        let _ = services_tx.send(true);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Upload worker panicked");
            }
        }
        let health_reports = join_health(health).await;

        let buffer_stats = buffer.stats();
        info!(
            pending_files = buffer_stats.pending_files,
            failed_files = buffer_stats.failed_files,
            archived_files = buffer_stats.archived_files,
            uploaded_files = upload_stats.snapshot().uploaded_files,
            "Offline buffer at shutdown"
        );

        Ok(RunSummary {
            mode: self.mode,
            capture: summary,
            batches_queued: persisted.batches_queued(),
            frames_lost: persisted.frames_lost(),
            health_reports,
        })
    }

    async fn spawn_workers(
        &self,
        buffer: &SharedOfflineBuffer,
        stats: &crate::upload::SharedUploadStats,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, AgentError> {
        let upload = &self.config.upload;
        if !upload.enabled {
            info!("Uploads disabled, batches stay in the local queue");
            return Ok(Vec::new());
        }
        let store_config = upload.store.as_ref().ok_or(AgentError::NoStore)?;
        let store = build_store(store_config).await;
        let settings = WorkerSettings {
            prefix: upload.prefix.clone(),
            request_timeout: upload.request_timeout,
            poll_interval: upload.poll_interval,
        };

        info!(workers = upload.workers, store = %store.describe(), "Starting upload workers");
        Ok((0..upload.workers)
            .map(|id| {
                UploadWorker::new(
                    id,
                    buffer.clone(),
                    store.clone(),
                    settings.clone(),
                    stats.clone(),
                )
                .spawn(shutdown.clone())
            })
            .collect())
    }

    fn spawn_health(
        &self,
        stats: SharedSourceStats,
        buffer: Option<SharedOfflineBuffer>,
        uploads: Option<crate::upload::SharedUploadStats>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<u64> {
        let mut monitor = HealthMonitor::new(self.config.health.interval, stats, &self.config.data_dir);
        if let Some(buffer) = buffer {
            monitor = monitor.with_buffer(buffer);
        }
        if let Some(uploads) = uploads {
            monitor = monitor.with_uploads(uploads);
        }
        monitor.spawn(shutdown)
    }

    fn build_source(
        &self,
        clock: CaptureClock,
        stats: SharedSourceStats,
        vehicle_id: Arc<str>,
    ) -> Result<Box<dyn FrameSource>, AgentError> {
        if self.mode == RunMode::Simulate {
            return Ok(Box::new(SimulatedSource::new(
                &self.config.simulation,
                stats,
                clock,
                vehicle_id,
            )));
        }

        let can = &self.config.can;
        let settings = BusSettings {
            interface: can.interface.clone(),
            bitrate: can.bitrate,
            fd: can.fd,
            filters: can.filters.clone(),
        };
        let policy = if self.mode == RunMode::DryRun {
            OpenPolicy::Strict
        } else {
            OpenPolicy::Retry
        };
        let source = HardwareSource::open(
            hardware_driver()?,
            settings,
            can.reconnect,
            policy,
            stats,
            clock,
            vehicle_id,
        )?;
        Ok(Box::new(source))
    }
}

async fn join_health(health: JoinHandle<u64>) -> u64 {
    health.await.unwrap_or_else(|e| {
        error!(error = %e, "Health monitor panicked");
        0
    })
}

/// Run the capture loop on the blocking pool until it ends or `stop` fires.
async fn capture_until<C: FrameConsumer + 'static>(
    capture: CaptureLoop<Box<dyn FrameSource>, C>,
    mut stop: watch::Receiver<bool>,
) -> Result<(CaptureSummary, C), AgentError> {
    let (capture_tx, capture_rx) = watch::channel(false);
    let mut handle = capture.spawn(capture_rx);

    tokio::select! {
        result = &mut handle => return Ok(result?),
        _ = wait_for_stop(&mut stop) => {
            info!("Shutdown requested, stopping capture");
        }
    }
    let _ = capture_tx.send(true);
    Ok(handle.await?)
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// After a finite source ends, wait for the upload queue to empty (or for a
/// stop request) so a bounded session leaves nothing behind.
async fn drain_queue(buffer: &SharedOfflineBuffer, poll: Duration, mut stop: watch::Receiver<bool>) {
    info!("Source finished, draining upload queue");
    loop {
        let stats = buffer.stats();
        if stats.pending_files == 0 && stats.uploading_files == 0 {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = wait_for_stop(&mut stop) => {
                warn!(pending_files = stats.pending_files, "Stop requested while draining");
                break;
            }
        }
    }
}

#[cfg(all(target_os = "linux", feature = "hardware-socketcan"))]
fn hardware_driver() -> Result<Box<dyn BusDriver>, AgentError> {
    Ok(Box::new(crate::source::socketcan::SocketCanDriver))
}

#[cfg(not(all(target_os = "linux", feature = "hardware-socketcan")))]
fn hardware_driver() -> Result<Box<dyn BusDriver>, AgentError> {
    Err(AgentError::HardwareUnavailable(
        "built without the `hardware-socketcan` feature; use --simulate".to_string(),
    ))
}

/// Resolves on SIGINT or SIGTERM.
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler, only Ctrl+C will stop the agent");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}
