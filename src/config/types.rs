use crate::backoff::Backoff;
use crate::source::FrameFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Falls back to the host name when omitted.
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/edge-agent")
}

impl Config {
    pub fn resolved_vehicle_id(&self) -> String {
        if let Some(id) = self.vehicle_id.as_deref().filter(|id| !id.trim().is_empty()) {
            return id.trim().to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown-vehicle".to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vehicle_id: None,
            data_dir: default_data_dir(),
            can: CanConfig::default(),
            simulation: SimulationConfig::default(),
            batch: BatchConfig::default(),
            buffer: BufferConfig::default(),
            upload: UploadConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default)]
    pub fd: bool,
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(default)]
    pub filters: Vec<FrameFilter>,
    #[serde(default = "Backoff::reconnect_default")]
    pub reconnect: Backoff,
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(100)
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bitrate: default_bitrate(),
            fd: false,
            read_timeout: default_read_timeout(),
            filters: Vec::new(),
            reconnect: Backoff::reconnect_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrivePhase {
    Idle,
    Acceleration,
    Cruise,
    Deceleration,
}

impl DrivePhase {
    /// Value carried in the `DrivePhase` signal of the speed message.
    pub fn code(self) -> u8 {
        match self {
            DrivePhase::Idle => 0,
            DrivePhase::Acceleration => 1,
            DrivePhase::Cruise => 2,
            DrivePhase::Deceleration => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpan {
    pub phase: DrivePhase,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_frame_rate")]
    pub frame_rate_hz: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Run length; the simulator reports end-of-stream afterwards.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
    #[serde(default = "SimulationConfig::default_cycle")]
    pub cycle: Vec<PhaseSpan>,
}

fn default_frame_rate() -> u32 {
    1000
}

fn default_seed() -> u64 {
    42
}

impl SimulationConfig {
    pub fn default_cycle() -> Vec<PhaseSpan> {
        let span = |phase, secs| PhaseSpan {
            phase,
            duration: Duration::from_secs(secs),
        };
        vec![
            span(DrivePhase::Idle, 30),
            span(DrivePhase::Acceleration, 60),
            span(DrivePhase::Cruise, 240),
            span(DrivePhase::Deceleration, 60),
        ]
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: default_frame_rate(),
            seed: default_seed(),
            duration: None,
            cycle: Self::default_cycle(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
    Snappy,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    #[serde(default = "default_compression")]
    pub compression: Compression,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_max_frames() -> usize {
    100_000
}

fn default_compression() -> Compression {
    Compression::Zstd
}

fn default_zstd_level() -> i32 {
    3
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            max_frames: default_max_frames(),
            compression: default_compression(),
            zstd_level: default_zstd_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Move uploaded files under `archive/`.
    Archive,
    /// Remove uploaded files.
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_max_disk_mb")]
    pub max_disk_mb: u64,
    /// Cap on queued files (pending + failed); unbounded when unset.
    #[serde(default)]
    pub max_files: Option<usize>,
    #[serde(default = "default_retention")]
    pub retention: Retention,
    /// Oldest archived files are pruned beyond this size. Unbounded when unset.
    #[serde(default)]
    pub archive_max_mb: Option<u64>,
}

fn default_max_disk_mb() -> u64 {
    5000
}

fn default_retention() -> Retention {
    Retention::Archive
}

impl BufferConfig {
    pub fn quota_bytes(&self) -> u64 {
        self.max_disk_mb.saturating_mul(1024 * 1024)
    }

    pub fn archive_limit_bytes(&self) -> Option<u64> {
        self.archive_max_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_disk_mb: default_max_disk_mb(),
            max_files: None,
            retention: default_retention(),
            archive_max_mb: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    S3(S3Config),
    Local(LocalStoreConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint (MinIO, localstack). Enables path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_upload_backoff")]
    pub backoff: Backoff,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Idle sleep between queue polls when nothing is eligible.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    2
}

fn default_prefix() -> String {
    "raw".to_string()
}

fn default_upload_backoff() -> Backoff {
    Backoff::new(Duration::from_secs(2), Duration::from_secs(300))
}

fn default_max_attempts() -> u32 {
    5
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            store: None,
            prefix: default_prefix(),
            backoff: default_upload_backoff(),
            max_attempts: default_max_attempts(),
            request_timeout: default_request_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_fps_window", with = "humantime_serde")]
    pub fps_window: Duration,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_fps_window() -> Duration {
    Duration::from_secs(10)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            fps_window: default_fps_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily-rolling JSON logs. Stderr only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}
