//! Hive-style partition paths shared by the on-disk queue and the object store.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const BATCH_FILE_SUFFIX: &str = "_raw.parquet";

/// Vehicle and UTC calendar date of a batch's `window_start`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub vehicle_id: Arc<str>,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn for_window(vehicle_id: Arc<str>, window_start_ns: i64) -> Self {
        Self {
            vehicle_id,
            date: DateTime::<Utc>::from_timestamp_nanos(window_start_ns).date_naive(),
        }
    }

    /// `vehicle_id=<id>/year=<Y>/month=<MM>/day=<DD>`
    pub fn directory(&self) -> PathBuf {
        PathBuf::from(format!("vehicle_id={}", self.vehicle_id))
            .join(format!("year={}", self.date.year()))
            .join(format!("month={:02}", self.date.month()))
            .join(format!("day={:02}", self.date.day()))
    }

    /// Path of the batch file relative to a queue directory or bucket prefix.
    pub fn relative_path(&self, window_start_ns: i64) -> PathBuf {
        self.directory().join(batch_file_name(window_start_ns))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vehicle_id, self.date)
    }
}

/// `<YYYYmmddTHHMMSS>_<nanos>Z_raw.parquet`; sorts lexically by window start.
pub fn batch_file_name(window_start_ns: i64) -> String {
    let start = DateTime::<Utc>::from_timestamp_nanos(window_start_ns);
    format!(
        "{}_{:09}Z{}",
        start.format("%Y%m%dT%H%M%S"),
        start.timestamp_subsec_nanos(),
        BATCH_FILE_SUFFIX
    )
}

pub fn is_batch_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(BATCH_FILE_SUFFIX))
}

/// Object key for a file at `relative` under the queue root: `<prefix>/<relative>`.
pub fn object_key(prefix: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        relative
    } else {
        format!("{}/{}", prefix, relative)
    }
}
