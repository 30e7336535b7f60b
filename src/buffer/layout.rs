//! On-disk queue layout. The directory tree is the ground truth; the
//! in-memory registry is rebuilt from it at startup.

use crate::batch::partition::is_batch_file;
use crate::batch::writer::STAGING_SUFFIX;
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::pending::META_SUFFIX;

#[derive(Debug, Clone)]
pub struct BufferLayout {
    pub root: PathBuf,
    pub staging: PathBuf,
    pub pending: PathBuf,
    pub archive: PathBuf,
    pub failed: PathBuf,
}

/// A batch file found during a scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

impl BufferLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            staging: root.join("staging"),
            pending: root.join("pending"),
            archive: root.join("archive"),
            failed: root.join("failed"),
            root,
        }
    }

    pub fn create_all(&self) -> io::Result<()> {
        for dir in [&self.staging, &self.pending, &self.archive, &self.failed] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Delete partially written files (`*.tmp`) left by a crash.
    pub fn remove_stale_temp_files(&self) -> io::Result<usize> {
        let mut removed = 0;
        for dir in [&self.staging, &self.pending, &self.archive, &self.failed] {
            for path in walk_files(dir)? {
                if path.to_string_lossy().ends_with(STAGING_SUFFIX) {
                    warn!(path = %path.display(), "Removing partially written file");
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Delete sidecars whose batch file no longer exists.
    pub fn remove_orphan_sidecars(&self) -> io::Result<usize> {
        let mut removed = 0;
        for dir in [&self.pending, &self.failed, &self.archive] {
            for path in walk_files(dir)? {
                let name = path.to_string_lossy();
                if let Some(batch) = name.strip_suffix(META_SUFFIX) {
                    if !Path::new(batch).exists() {
                        debug!(path = %path.display(), "Removing orphan retry sidecar");
                        fs::remove_file(&path)?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Batch files under `dir`, oldest name first.
    pub fn scan(&self, dir: &Path) -> io::Result<Vec<ScannedFile>> {
        let mut files = Vec::new();
        for path in walk_files(dir)? {
            if !is_batch_file(&path) {
                continue;
            }
            let metadata = fs::metadata(&path)?;
            let relative_path = path.strip_prefix(dir).unwrap_or(&path).to_path_buf();
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(ScannedFile {
                path,
                relative_path,
                size_bytes: metadata.len(),
                modified,
            });
        }
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(files)
    }

    /// Remove empty partition directories under `dir`, keeping `dir` itself.
    pub fn prune_empty_dirs(&self, dir: &Path) {
        fn prune(path: &Path, keep: bool) -> bool {
            let Ok(entries) = fs::read_dir(path) else {
                return false;
            };
            let mut empty = true;
            for entry in entries.flatten() {
                let child = entry.path();
                if child.is_dir() {
                    if !prune(&child, false) {
                        empty = false;
                    }
                } else {
                    empty = false;
                }
            }
            if empty && !keep {
                return fs::remove_dir(path).is_ok();
            }
            empty
        }
        prune(dir, true);
    }
}

/// Every regular file under `dir`, recursively. A missing `dir` is empty.
pub fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

/// Move `from` to `to`, creating parent directories.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
}

/// Remove now-empty partition directories above `file`, stopping at `stop`.
pub fn remove_empty_parents(file: &Path, stop: &Path) {
    let mut current = file.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) || fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
