use super::layout::{move_file, remove_empty_parents, BufferLayout};
use super::lock::DataDirLock;
use super::pending::{load_meta, remove_meta, save_meta, FileState, PendingFile};
use super::BufferError;
use crate::backoff::Backoff;
use crate::batch::partition::BATCH_FILE_SUFFIX;
use crate::batch::SerializedBatch;
use crate::config::types::{BufferConfig, Retention, UploadConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Shared reference to the offline buffer
pub type SharedOfflineBuffer = Arc<OfflineBuffer>;

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub quota_bytes: u64,
    /// Cap on tracked files, enforced with the same eviction as the byte quota.
    pub max_files: Option<usize>,
    pub retention: Retention,
    pub archive_limit_bytes: Option<u64>,
    pub backoff: Backoff,
    /// Retries after the first failure before a file is marked Failed.
    pub max_attempts: u32,
}

impl BufferSettings {
    pub fn from_config(buffer: &BufferConfig, upload: &UploadConfig) -> Self {
        Self {
            quota_bytes: buffer.quota_bytes(),
            max_files: buffer.max_files,
            retention: buffer.retention,
            archive_limit_bytes: buffer.archive_limit_bytes(),
            backoff: upload.backoff,
            max_attempts: upload.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferStats {
    pub pending_files: usize,
    pub pending_bytes: u64,
    pub uploading_files: usize,
    pub failed_files: usize,
    pub failed_bytes: u64,
    pub tracked_bytes: u64,
    pub quota_bytes: u64,
    pub headroom_bytes: u64,
    pub archived_files: usize,
    pub archived_bytes: u64,
    pub evicted_files: u64,
    pub evicted_bytes: u64,
}

/// A file deleted to respect the quota.
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub size_bytes: u64,
    pub state: FileState,
}

#[derive(Default)]
struct Registry {
    files: HashMap<PathBuf, PendingFile>,
    /// Bytes of Pending, Uploading and Failed files, plus admissions in flight.
    tracked_bytes: u64,
    /// Most recent admission; `enforce_quota` never evicts it, so capture
    /// always makes progress.
    newest: Option<PathBuf>,
    archive: VecDeque<(PathBuf, u64)>,
    archived_bytes: u64,
    evicted_files: u64,
    evicted_bytes: u64,
}

impl Registry {
    /// Remove the oldest evictable entries until one more file of `incoming`
    /// bytes fits both limits (`None` checks the current contents).
    fn plan_evictions(
        &mut self,
        incoming: Option<u64>,
        limits: &BufferSettings,
        protect: Option<&Path>,
    ) -> Vec<Eviction> {
        let (incoming_bytes, incoming_files) = incoming.map_or((0, 0), |bytes| (bytes, 1));
        let mut evicted = Vec::new();
        loop {
            let over_bytes = self.tracked_bytes.saturating_add(incoming_bytes) > limits.quota_bytes;
            let over_files = limits
                .max_files
                .is_some_and(|max| self.files.len() + incoming_files > max);
            if !over_bytes && !over_files {
                break;
            }
            match self.evict_oldest(protect) {
                Some(eviction) => evicted.push(eviction),
                None => break,
            }
        }
        evicted
    }

    /// Drop the oldest Pending/Failed entry. Uploading files belong to their
    /// claimant and are never chosen.
    fn evict_oldest(&mut self, protect: Option<&Path>) -> Option<Eviction> {
        let relative_path = self
            .files
            .values()
            .filter(|f| matches!(f.state, FileState::Pending | FileState::Failed))
            .filter(|f| protect != Some(f.relative_path.as_path()))
            .min_by(|a, b| (a.created_at, &a.relative_path).cmp(&(b.created_at, &b.relative_path)))
            .map(|f| f.relative_path.clone())?;

        let file = self.files.remove(&relative_path)?;
        self.tracked_bytes = self.tracked_bytes.saturating_sub(file.size_bytes);
        self.evicted_files += 1;
        self.evicted_bytes += file.size_bytes;
        Some(Eviction {
            path: file.path,
            relative_path,
            size_bytes: file.size_bytes,
            state: file.state,
        })
    }

    fn claimed(&mut self, relative_path: &Path) -> Result<&mut PendingFile, BufferError> {
        match self.files.get_mut(relative_path) {
            Some(file) if file.state == FileState::Uploading => Ok(file),
            Some(_) => Err(BufferError::NotClaimed(relative_path.to_path_buf())),
            None => Err(BufferError::NotTracked(relative_path.to_path_buf())),
        }
    }
}

/// Durable queue of batch files awaiting upload.
///
/// Claims and state changes are short critical sections on the registry;
/// renames, deletes and sidecar writes happen outside the lock. A claimed
/// (Uploading) file is owned by its claimant, so nothing else moves or
/// evicts it while the lock is released.
///
/// An open buffer holds the data directory lock: one process mutates a
/// queue at a time.
pub struct OfflineBuffer {
    layout: BufferLayout,
    settings: BufferSettings,
    registry: Mutex<Registry>,
    _lock: DataDirLock,
}

impl OfflineBuffer {
    /// Open the queue under `root`, rebuilding the registry from disk.
    ///
    /// Fails with [`BufferError::Locked`] while another process has it open.
    pub fn open(root: impl Into<PathBuf>, settings: BufferSettings) -> Result<Self, BufferError> {
        let layout = BufferLayout::new(root);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| BufferError::Io { path, source }
        };

        let lock = DataDirLock::acquire(&layout.root)?;
        layout.create_all().map_err(io_err(&layout.root))?;
        let stale = layout
            .remove_stale_temp_files()
            .map_err(io_err(&layout.root))?;
        layout
            .remove_orphan_sidecars()
            .map_err(io_err(&layout.root))?;

        let mut registry = Registry::default();

        for scanned in layout.scan(&layout.pending).map_err(io_err(&layout.pending))? {
            let mut file = PendingFile::new(
                scanned.path,
                scanned.relative_path.clone(),
                scanned.size_bytes,
                scanned.modified,
            );
            if let Some(meta) = load_meta(&file.path) {
                file.apply_meta(meta);
            }
            registry.tracked_bytes += file.size_bytes;
            registry.files.insert(scanned.relative_path, file);
        }

        for scanned in layout.scan(&layout.failed).map_err(io_err(&layout.failed))? {
            let mut file = PendingFile::new(
                scanned.path,
                scanned.relative_path.clone(),
                scanned.size_bytes,
                scanned.modified,
            );
            if let Some(meta) = load_meta(&file.path) {
                file.apply_meta(meta);
            }
            file.state = FileState::Failed;
            file.next_retry_at = None;
            registry.tracked_bytes += file.size_bytes;
            registry.files.insert(scanned.relative_path, file);
        }

        for scanned in layout.scan(&layout.archive).map_err(io_err(&layout.archive))? {
            registry.archived_bytes += scanned.size_bytes;
            registry.archive.push_back((scanned.path, scanned.size_bytes));
        }

        let pending = registry
            .files
            .values()
            .filter(|f| f.state == FileState::Pending)
            .count();
        info!(
            root = %layout.root.display(),
            pending,
            failed = registry.files.len() - pending,
            archived = registry.archive.len(),
            tracked_bytes = registry.tracked_bytes,
            quota_bytes = settings.quota_bytes,
            stale_temp_files = stale,
            "Offline buffer recovered from disk"
        );

        let buffer = Self {
            layout,
            settings,
            registry: Mutex::new(registry),
            _lock: lock,
        };
        buffer.recover_staged()?;
        buffer.enforce_quota();
        buffer.prune_archive();
        Ok(buffer)
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Complete batches left in staging by a crash are admitted, not lost.
    fn recover_staged(&self) -> Result<(), BufferError> {
        let staged = self
            .layout
            .scan(&self.layout.staging)
            .map_err(|source| BufferError::Io {
                path: self.layout.staging.clone(),
                source,
            })?;
        for scanned in staged {
            warn!(path = %scanned.relative_path.display(), "Admitting batch left in staging");
            self.admit_file(&scanned.path, &scanned.relative_path, scanned.size_bytes)?;
        }
        self.layout.prune_empty_dirs(&self.layout.staging);
        Ok(())
    }

    /// Register a batch file that already lives under `pending/`.
    ///
    /// Re-registering the same path returns the existing entry.
    pub fn register(&self, path: &Path, size_bytes: u64) -> Result<PendingFile, BufferError> {
        let relative_path = path
            .strip_prefix(&self.layout.pending)
            .map_err(|_| BufferError::OutsideQueue(path.to_path_buf()))?
            .to_path_buf();

        let file = {
            let mut registry = self.registry();
            if let Some(existing) = registry.files.get(&relative_path) {
                debug!(path = %relative_path.display(), "File already registered");
                return Ok(existing.clone());
            }
            let file = PendingFile::new(path.to_path_buf(), relative_path.clone(), size_bytes, Utc::now());
            registry.tracked_bytes += size_bytes;
            registry.newest = Some(relative_path.clone());
            registry.files.insert(relative_path, file.clone());
            file
        };

        self.enforce_quota();
        Ok(file)
    }

    /// Move a staged batch into `pending/` after making room for it.
    pub fn admit(&self, batch: &SerializedBatch) -> Result<PendingFile, BufferError> {
        self.admit_file(&batch.path, &batch.relative_path, batch.size_bytes)
    }

    fn admit_file(&self, staged: &Path, relative_path: &Path, size_bytes: u64) -> Result<PendingFile, BufferError> {
        let quota = self.settings.quota_bytes;

        let (relative_path, evicted) = {
            let mut registry = self.registry();
            let mut relative_path = relative_path.to_path_buf();
            if registry.files.contains_key(&relative_path)
                || self.layout.pending.join(&relative_path).exists()
            {
                let renamed = disambiguate(&relative_path);
                warn!(
                    path = %relative_path.display(),
                    renamed = %renamed.display(),
                    "Batch name collision, renaming"
                );
                relative_path = renamed;
            }
            let evicted = registry.plan_evictions(Some(size_bytes), &self.settings, None);
            registry.tracked_bytes += size_bytes;
            (relative_path, evicted)
        };

        self.delete_evicted(&evicted, "Buffer limit reached, evicting oldest buffered batch");
        if size_bytes > quota {
            error!(
                path = %relative_path.display(),
                size_bytes,
                quota_bytes = quota,
                "Batch larger than the whole disk quota, admitting anyway"
            );
        }

        let dest = self.layout.pending.join(&relative_path);
        if let Err(source) = move_file(staged, &dest) {
            let mut registry = self.registry();
            registry.tracked_bytes = registry.tracked_bytes.saturating_sub(size_bytes);
            return Err(BufferError::Io { path: dest, source });
        }
        remove_empty_parents(staged, &self.layout.staging);

        let file = PendingFile::new(dest, relative_path.clone(), size_bytes, Utc::now());
        {
            let mut registry = self.registry();
            registry.newest = Some(relative_path.clone());
            registry.files.insert(relative_path, file.clone());
        }
        debug!(path = %file.relative_path.display(), size_bytes, "Batch queued for upload");
        Ok(file)
    }

    /// Evict the oldest Pending/Failed files until the queue fits the byte
    /// quota and the file cap.
    pub fn enforce_quota(&self) -> Vec<Eviction> {
        let evicted = {
            let mut registry = self.registry();
            let newest = registry.newest.clone();
            registry.plan_evictions(None, &self.settings, newest.as_deref())
        };
        self.delete_evicted(&evicted, "Buffer limit reached, evicting oldest buffered batch");
        evicted
    }

    /// Evict the single oldest Pending/Failed file regardless of the quota,
    /// to free space when the disk itself is full. `None` when nothing is
    /// evictable.
    pub fn evict_oldest(&self) -> Option<Eviction> {
        let eviction = self.registry().evict_oldest(None)?;
        self.delete_evicted(
            std::slice::from_ref(&eviction),
            "Disk full, evicting oldest buffered batch",
        );
        Some(eviction)
    }

    fn delete_evicted(&self, evicted: &[Eviction], message: &str) {
        for eviction in evicted {
            warn!(
                event = "data_loss",
                path = %eviction.relative_path.display(),
                size_bytes = eviction.size_bytes,
                state = eviction.state.as_str(),
                quota_bytes = self.settings.quota_bytes,
                max_files = ?self.settings.max_files,
                "{}",
                message
            );
            if let Err(e) = fs::remove_file(&eviction.path) {
                error!(path = %eviction.path.display(), error = %e, "Failed to delete evicted batch");
            }
            let _ = remove_meta(&eviction.path);
            let root = match eviction.state {
                FileState::Failed => &self.layout.failed,
                _ => &self.layout.pending,
            };
            remove_empty_parents(&eviction.path, root);
        }
    }

    pub fn claim_next(&self) -> Option<PendingFile> {
        self.claim_next_at(Utc::now())
    }

    /// Claim the eligible file with the earliest retry time. The returned file
    /// is Uploading until the claimant resolves it.
    pub fn claim_next_at(&self, now: DateTime<Utc>) -> Option<PendingFile> {
        let mut registry = self.registry();
        let relative_path = registry
            .files
            .values()
            .filter(|f| f.is_eligible(now))
            .min_by(|a, b| a.claim_order().cmp(&b.claim_order()))
            .map(|f| f.relative_path.clone())?;
        let file = registry.files.get_mut(&relative_path)?;
        file.state = FileState::Uploading;
        Some(file.clone())
    }

    /// Earliest `next_retry_at` among waiting files, for idle sleeps.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.registry()
            .files
            .values()
            .filter(|f| f.state == FileState::Pending)
            .map(|f| f.next_retry_at.unwrap_or(f.created_at))
            .min()
    }

    /// Upload confirmed: retire the file per the retention policy.
    pub fn mark_archived(&self, file: &PendingFile) -> Result<FileState, BufferError> {
        let path = {
            let mut registry = self.registry();
            registry.claimed(&file.relative_path)?.path.clone()
        };

        let outcome = match self.settings.retention {
            Retention::Archive => {
                let dest = self.layout.archive.join(&file.relative_path);
                move_file(&path, &dest).map(|_| Some(dest))
            }
            Retention::Delete => fs::remove_file(&path).map(|_| None),
        };

        let archived_to = match outcome {
            Ok(dest) => dest,
            Err(source) => {
                let mut registry = self.registry();
                if let Ok(entry) = registry.claimed(&file.relative_path) {
                    entry.state = FileState::Pending;
                }
                return Err(BufferError::Io { path, source });
            }
        };
        let _ = remove_meta(&path);
        remove_empty_parents(&path, &self.layout.pending);

        {
            let mut registry = self.registry();
            if let Some(entry) = registry.files.remove(&file.relative_path) {
                registry.tracked_bytes = registry.tracked_bytes.saturating_sub(entry.size_bytes);
            }
            if let Some(dest) = archived_to {
                registry.archived_bytes += file.size_bytes;
                registry.archive.push_back((dest, file.size_bytes));
            }
        }
        self.prune_archive();
        Ok(FileState::Archived)
    }

    pub fn mark_failed_attempt(&self, file: &PendingFile, reason: &str) -> Result<FileState, BufferError> {
        self.mark_failed_attempt_at(file, reason, Utc::now())
    }

    /// Retryable failure: back to Pending with a delayed retry, or Failed once
    /// the retry ceiling is exceeded.
    pub fn mark_failed_attempt_at(
        &self,
        file: &PendingFile,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FileState, BufferError> {
        let (attempt, path) = {
            let mut registry = self.registry();
            let entry = registry.claimed(&file.relative_path)?;
            (entry.attempt_count.saturating_add(1), entry.path.clone())
        };

        if attempt > self.settings.max_attempts {
            self.fail(file, &path, attempt, reason, now)?;
            return Ok(FileState::Failed);
        }

        let delay = self.settings.backoff.delay(attempt);
        let next_retry_at = self.retry_time(attempt, now);

        let meta = {
            let mut registry = self.registry();
            let entry = registry.claimed(&file.relative_path)?;
            entry.attempt_count = attempt;
            entry.next_retry_at = Some(next_retry_at);
            entry.last_error = Some(reason.to_string());
            entry.meta()
        };
        if let Err(e) = save_meta(&path, &meta) {
            warn!(path = %path.display(), error = %e, "Failed to persist retry state");
        }

        {
            let mut registry = self.registry();
            let entry = registry.claimed(&file.relative_path)?;
            entry.state = FileState::Pending;
        }

        warn!(
            path = %file.relative_path.display(),
            attempt,
            max_attempts = self.settings.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = reason,
            "Upload failed, will retry"
        );
        Ok(FileState::Pending)
    }

    fn retry_time(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.settings.backoff.delay(attempt))
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Non-retryable failure: straight to Failed.
    pub fn mark_failed(&self, file: &PendingFile, reason: &str) -> Result<(), BufferError> {
        self.mark_failed_at(file, reason, Utc::now())
    }

    pub fn mark_failed_at(&self, file: &PendingFile, reason: &str, now: DateTime<Utc>) -> Result<(), BufferError> {
        let (attempt, path) = {
            let mut registry = self.registry();
            let entry = registry.claimed(&file.relative_path)?;
            (entry.attempt_count.saturating_add(1), entry.path.clone())
        };
        self.fail(file, &path, attempt, reason, now)
    }

    fn fail(
        &self,
        file: &PendingFile,
        path: &Path,
        attempt: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BufferError> {
        let dest = self.layout.failed.join(&file.relative_path);
        if let Err(source) = move_file(path, &dest) {
            // Stays queued, but waits out a backoff before the next claim.
            let next_retry_at = self.retry_time(attempt, now);
            let mut registry = self.registry();
            if let Ok(entry) = registry.claimed(&file.relative_path) {
                entry.state = FileState::Pending;
                entry.attempt_count = attempt;
                entry.next_retry_at = Some(next_retry_at);
                entry.last_error = Some(reason.to_string());
            }
            return Err(BufferError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        let _ = remove_meta(path);
        remove_empty_parents(path, &self.layout.pending);

        let meta = {
            let mut registry = self.registry();
            let entry = registry.claimed(&file.relative_path)?;
            entry.path = dest.clone();
            entry.state = FileState::Failed;
            entry.attempt_count = attempt;
            entry.next_retry_at = None;
            entry.last_error = Some(reason.to_string());
            entry.meta()
        };
        if let Err(e) = save_meta(&dest, &meta) {
            warn!(path = %dest.display(), error = %e, "Failed to persist failure state");
        }

        error!(
            path = %file.relative_path.display(),
            attempts = attempt,
            error = reason,
            "Upload failed permanently, file moved to failed/"
        );
        Ok(())
    }

    /// Failed files, oldest first.
    pub fn failed_files(&self) -> Vec<PendingFile> {
        let mut failed: Vec<PendingFile> = self
            .registry()
            .files
            .values()
            .filter(|f| f.state == FileState::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| (a.created_at, &a.relative_path).cmp(&(b.created_at, &b.relative_path)));
        failed
    }

    /// Every tracked file, oldest first.
    pub fn files(&self) -> Vec<PendingFile> {
        let mut files: Vec<PendingFile> = self.registry().files.values().cloned().collect();
        files.sort_by(|a, b| (a.created_at, &a.relative_path).cmp(&(b.created_at, &b.relative_path)));
        files
    }

    /// Move every Failed file back to Pending with a fresh attempt budget.
    pub fn requeue_failed(&self) -> Result<usize, BufferError> {
        let claimed: Vec<(PathBuf, PathBuf)> = {
            let mut registry = self.registry();
            registry
                .files
                .values_mut()
                .filter(|f| f.state == FileState::Failed)
                .map(|f| {
                    f.state = FileState::Uploading;
                    (f.relative_path.clone(), f.path.clone())
                })
                .collect()
        };

        let mut requeued = 0;
        for (relative_path, path) in claimed {
            let dest = self.layout.pending.join(&relative_path);
            let moved = move_file(&path, &dest);

            let mut registry = self.registry();
            let Some(entry) = registry.files.get_mut(&relative_path) else {
                continue;
            };
            match moved {
                Ok(()) => {
                    let _ = remove_meta(&path);
                    remove_empty_parents(&path, &self.layout.failed);
                    entry.path = dest;
                    entry.state = FileState::Pending;
                    entry.attempt_count = 0;
                    entry.next_retry_at = None;
                    entry.last_error = None;
                    requeued += 1;
                    info!(path = %relative_path.display(), "Failed batch requeued");
                }
                Err(source) => {
                    entry.state = FileState::Failed;
                    return Err(BufferError::Io { path, source });
                }
            }
        }
        Ok(requeued)
    }

    /// Copy Failed files (and their sidecars) under `dest`, keeping partition paths.
    pub fn export_failed(&self, dest: &Path) -> Result<usize, BufferError> {
        export_failed_files(&self.failed_files(), dest)
    }

    fn prune_archive(&self) {
        let Some(limit) = self.settings.archive_limit_bytes else {
            return;
        };
        let victims: Vec<(PathBuf, u64)> = {
            let mut registry = self.registry();
            let mut victims = Vec::new();
            while registry.archived_bytes > limit {
                let Some((path, size)) = registry.archive.pop_front() else {
                    break;
                };
                registry.archived_bytes = registry.archived_bytes.saturating_sub(size);
                victims.push((path, size));
            }
            victims
        };
        for (path, size) in victims {
            debug!(path = %path.display(), size_bytes = size, "Pruning archived batch");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to prune archived batch");
            }
            remove_empty_parents(&path, &self.layout.archive);
        }
    }

    pub fn stats(&self) -> BufferStats {
        let registry = self.registry();
        let mut stats = BufferStats {
            tracked_bytes: registry.tracked_bytes,
            quota_bytes: self.settings.quota_bytes,
            headroom_bytes: self.settings.quota_bytes.saturating_sub(registry.tracked_bytes),
            archived_files: registry.archive.len(),
            archived_bytes: registry.archived_bytes,
            evicted_files: registry.evicted_files,
            evicted_bytes: registry.evicted_bytes,
            ..BufferStats::default()
        };
        for file in registry.files.values() {
            match file.state {
                FileState::Pending => {
                    stats.pending_files += 1;
                    stats.pending_bytes += file.size_bytes;
                }
                FileState::Uploading => stats.uploading_files += 1,
                FileState::Failed => {
                    stats.failed_files += 1;
                    stats.failed_bytes += file.size_bytes;
                }
                FileState::Archived => {}
            }
        }
        stats
    }
}

/// Failed files under `root`, oldest first, read straight from `failed/`
/// and the retry sidecars.
///
/// Takes no lock and changes nothing on disk, so it is safe while an agent
/// owns the queue.
pub fn read_failed_files(root: &Path) -> Result<Vec<PendingFile>, BufferError> {
    let layout = BufferLayout::new(root);
    let scanned = layout.scan(&layout.failed).map_err(|source| BufferError::Io {
        path: layout.failed.clone(),
        source,
    })?;

    let mut failed: Vec<PendingFile> = scanned
        .into_iter()
        .map(|scanned| {
            let mut file = PendingFile::new(
                scanned.path,
                scanned.relative_path,
                scanned.size_bytes,
                scanned.modified,
            );
            if let Some(meta) = load_meta(&file.path) {
                file.apply_meta(meta);
            }
            file.state = FileState::Failed;
            file.next_retry_at = None;
            file
        })
        .collect();
    failed.sort_by(|a, b| (a.created_at, &a.relative_path).cmp(&(b.created_at, &b.relative_path)));
    Ok(failed)
}

/// Copy `files` (and their sidecars) under `dest`, keeping partition paths.
/// Files that vanished since they were listed are skipped.
pub fn export_failed_files(files: &[PendingFile], dest: &Path) -> Result<usize, BufferError> {
    let mut exported = 0;
    for file in files {
        let target = dest.join(&file.relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| BufferError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        match fs::copy(&file.path, &target) {
            Ok(_) => exported += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %file.relative_path.display(), "Failed batch disappeared before export");
                continue;
            }
            Err(source) => {
                return Err(BufferError::Io {
                    path: file.path.clone(),
                    source,
                })
            }
        }
        let meta = super::pending::meta_path(&file.path);
        if meta.exists() {
            let _ = fs::copy(&meta, super::pending::meta_path(&target));
        }
    }
    Ok(exported)
}

/// `<stamp>Z_raw.parquet` → `<stamp>Z-<id>_raw.parquet`
fn disambiguate(relative_path: &Path) -> PathBuf {
    let name = relative_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(BATCH_FILE_SUFFIX).unwrap_or(&name);
    let tag = uuid::Uuid::new_v4().simple().to_string();
    relative_path.with_file_name(format!("{}-{}{}", stem, &tag[..8], BATCH_FILE_SUFFIX))
}
