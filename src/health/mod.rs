//! Periodic health report for unattended deployments.
//!
//! The monitor only reads shared counters and snapshots; it never mutates
//! capture, buffer or upload state.

use crate::buffer::{BufferStats, SharedOfflineBuffer};
use crate::source::stats::{SharedSourceStats, SourceStatsSnapshot};
use crate::upload::{SharedUploadStats, UploadStatsSnapshot};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Components, Disks};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub source: SourceStatsSnapshot,
    /// Frames captured since the previous report.
    pub frames_in_interval: u64,
    pub buffer: Option<BufferStats>,
    pub uploads: Option<UploadStatsSnapshot>,
    pub disk: Option<DiskUsage>,
    /// Hottest component reading, when the platform exposes sensors.
    pub temperature_c: Option<f32>,
}

/// Host readings that need filesystem and sysfs I/O.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSample {
    pub disk: Option<DiskUsage>,
    pub temperature_c: Option<f32>,
}

impl HostSample {
    /// Blocking: statvfs on every mount and a sysfs walk for sensors.
    pub fn take(data_dir: &Path) -> Self {
        Self {
            disk: disk_usage_for(data_dir),
            temperature_c: max_temperature(),
        }
    }

    /// [`HostSample::take`] on the blocking pool.
    pub async fn take_blocking(data_dir: PathBuf) -> Self {
        tokio::task::spawn_blocking(move || Self::take(&data_dir))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Host sampling task failed");
                Self::default()
            })
    }
}

pub struct HealthMonitor {
    interval: Duration,
    source: SharedSourceStats,
    buffer: Option<SharedOfflineBuffer>,
    uploads: Option<SharedUploadStats>,
    data_dir: PathBuf,
    last_frames: u64,
}

impl HealthMonitor {
    pub fn new(interval: Duration, source: SharedSourceStats, data_dir: impl Into<PathBuf>) -> Self {
        let last_frames = source.frames();
        Self {
            interval,
            source,
            buffer: None,
            uploads: None,
            data_dir: data_dir.into(),
            last_frames,
        }
    }

    pub fn with_buffer(mut self, buffer: SharedOfflineBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn with_uploads(mut self, uploads: SharedUploadStats) -> Self {
        self.uploads = Some(uploads);
        self
    }

    /// Take one report, sampling the host on the calling thread. Advances
    /// the per-interval frame baseline.
    pub fn report(&mut self) -> HealthReport {
        let host = HostSample::take(&self.data_dir);
        self.report_with(host)
    }

    /// Assemble a report around an already taken host sample.
    pub fn report_with(&mut self, host: HostSample) -> HealthReport {
        let source = self.source.snapshot();
        let frames_in_interval = source.frames.saturating_sub(self.last_frames);
        self.last_frames = source.frames;

        HealthReport {
            source,
            frames_in_interval,
            buffer: self.buffer.as_ref().map(|b| b.stats()),
            uploads: self.uploads.as_ref().map(|u| u.snapshot()),
            disk: host.disk,
            temperature_c: host.temperature_c,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
        tokio::spawn(self.run(shutdown))
    }

    /// Report every interval until shutdown. Returns the number of reports.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        interval.tick().await;
        let mut reports = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let host = HostSample::take_blocking(self.data_dir.clone()).await;
                    let report = self.report_with(host);
                    log_report(&report, self.interval);
                    reports += 1;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        reports
    }
}

pub fn log_report(report: &HealthReport, interval: Duration) {
    let buffer = report.buffer.clone().unwrap_or_default();
    let uploads = report.uploads.unwrap_or_default();
    let (disk_total, disk_available) = report
        .disk
        .as_ref()
        .map_or((0, 0), |d| (d.total_bytes, d.available_bytes));

    info!(
        target: "edge_agent::health",
        frames_per_sec = report.source.frames_per_sec,
        frames_total = report.source.frames,
        frames_in_interval = report.frames_in_interval,
        connected = report.source.connected,
        bus_errors = report.source.bus_errors,
        read_errors = report.source.read_errors,
        reconnects = report.source.reconnects,
        pending_files = buffer.pending_files,
        uploading_files = buffer.uploading_files,
        failed_files = buffer.failed_files,
        tracked_bytes = buffer.tracked_bytes,
        headroom_bytes = buffer.headroom_bytes,
        evicted_files = buffer.evicted_files,
        uploaded_files = uploads.uploaded_files,
        upload_failures = uploads.retryable_failures + uploads.permanent_failures,
        disk_total_bytes = disk_total,
        disk_available_bytes = disk_available,
        temperature_c = ?report.temperature_c,
        "Health report"
    );

    // Empty windows write no file, so silence is only visible here.
    if report.frames_in_interval == 0 {
        warn!(
            target: "edge_agent::health",
            event = "bus_silent",
            interval_secs = interval.as_secs(),
            connected = report.source.connected,
            "No frames captured during the last reporting interval"
        );
    }
}

/// Usage of the filesystem holding `path` (the mount with the longest
/// matching prefix).
pub fn disk_usage_for(path: &Path) -> Option<DiskUsage> {
    let target = existing_ancestor(path);
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count())
        .map(|disk| DiskUsage {
            mount_point: disk.mount_point().to_path_buf(),
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        })
}

fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}

pub fn max_temperature() -> Option<f32> {
    let components = Components::new_with_refreshed_list();
    components
        .list()
        .iter()
        .filter_map(|c| c.temperature())
        .filter(|t| t.is_finite())
        .reduce(f32::max)
}
