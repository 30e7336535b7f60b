//! Exclusive ownership of a data directory.
//!
//! Only the process holding the lock may mutate the queue. Readers such as
//! `failed list` never take it.

use super::BufferError;
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE_NAME: &str = ".edge-agent.lock";

/// Advisory lock on `<data_dir>/.edge-agent.lock`. Unlocks on drop; the OS
/// releases it if the process dies.
#[derive(Debug)]
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Take the lock without waiting.
    pub fn acquire(root: &Path) -> Result<Self, BufferError> {
        fs::create_dir_all(root).map_err(|source| BufferError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let path = root.join(LOCK_FILE_NAME);
        let io_err = |source| BufferError::Io {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        if !FileExt::try_lock_exclusive(&file).map_err(io_err)? {
            return Err(BufferError::Locked(root.to_path_buf()));
        }

        // Owner pid, for operators inspecting the directory.
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;

        debug!(path = %path.display(), "Data directory locked");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_holder_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let first = DataDirLock::acquire(dir.path()).unwrap();
        assert!(first.path().ends_with(LOCK_FILE_NAME));

        let err = DataDirLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, BufferError::Locked(ref root) if root == dir.path()));

        drop(first);
        DataDirLock::acquire(dir.path()).unwrap();
    }
}
