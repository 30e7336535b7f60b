use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const META_VERSION: u32 = 1;
pub const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Pending,
    Uploading,
    Archived,
    Failed,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Uploading => "uploading",
            FileState::Archived => "archived",
            FileState::Failed => "failed",
        }
    }
}

/// One serialized batch tracked by the offline buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingFile {
    /// Current location on disk (under `pending/` or `failed/`).
    pub path: PathBuf,
    /// Partition path; identifies the file across state directories.
    pub relative_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub state: FileState,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PendingFile {
    pub fn new(path: PathBuf, relative_path: PathBuf, size_bytes: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            path,
            relative_path,
            size_bytes,
            created_at,
            state: FileState::Pending,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == FileState::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Sort key for claiming: earliest retry time, then creation.
    pub fn claim_order(&self) -> (DateTime<Utc>, DateTime<Utc>, &Path) {
        (
            self.next_retry_at.unwrap_or(self.created_at),
            self.created_at,
            &self.relative_path,
        )
    }

    /// Restore retry state persisted by a previous run.
    pub fn apply_meta(&mut self, meta: RetryMeta) {
        self.attempt_count = meta.attempt_count;
        self.next_retry_at = meta.next_retry_at;
        self.last_error = meta.last_error;
    }

    pub fn meta(&self) -> RetryMeta {
        RetryMeta {
            version: META_VERSION,
            attempt_count: self.attempt_count,
            next_retry_at: self.next_retry_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Retry state kept in `<file>.meta.json` beside the batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMeta {
    pub version: u32,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub fn meta_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

/// Load the sidecar for `file`. Missing, unreadable or foreign-version
/// sidecars yield `None` and the file restarts with zero attempts.
pub fn load_meta(file: &Path) -> Option<RetryMeta> {
    let path = meta_path(file);
    let text = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<RetryMeta>(&text) {
        Ok(meta) if meta.version == META_VERSION => Some(meta),
        Ok(meta) => {
            tracing::warn!(
                path = %path.display(),
                version = meta.version,
                expected = META_VERSION,
                "Retry sidecar version mismatch, ignoring"
            );
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable retry sidecar, ignoring");
            None
        }
    }
}

pub fn save_meta(file: &Path, meta: &RetryMeta) -> io::Result<()> {
    let path = meta_path(file);
    let json = serde_json::to_vec_pretty(meta).map_err(io::Error::other)?;
    let tmp = crate::batch::writer::staging_name(&path);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)
}

pub fn remove_meta(file: &Path) -> io::Result<()> {
    match fs::remove_file(meta_path(file)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_meta_round_trip_and_version_guard() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a_raw.parquet");
        fs::write(&file, b"x").unwrap();

        let mut pending = PendingFile::new(file.clone(), PathBuf::from("a_raw.parquet"), 1, Utc::now());
        pending.attempt_count = 3;
        pending.next_retry_at = Some(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
        pending.last_error = Some("timeout".to_string());
        save_meta(&file, &pending.meta()).unwrap();

        assert_eq!(load_meta(&file), Some(pending.meta()));

        let mut foreign = pending.meta();
        foreign.version = 99;
        fs::write(meta_path(&file), serde_json::to_string(&foreign).unwrap()).unwrap();
        assert_eq!(load_meta(&file), None);

        remove_meta(&file).unwrap();
        remove_meta(&file).unwrap();
        assert!(!meta_path(&file).exists());
    }

    #[test]
    fn test_eligibility_respects_retry_time() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let mut f = PendingFile::new(PathBuf::from("p"), PathBuf::from("p"), 1, now);
        assert!(f.is_eligible(now));
        f.next_retry_at = Some(now + chrono::Duration::seconds(4));
        assert!(!f.is_eligible(now));
        assert!(f.is_eligible(now + chrono::Duration::seconds(4)));
        f.state = FileState::Uploading;
        assert!(!f.is_eligible(now + chrono::Duration::seconds(10)));
    }
}
