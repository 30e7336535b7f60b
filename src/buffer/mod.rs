//! Offline buffer: the on-disk queue of batch files between capture and upload.

pub mod layout;
pub mod lock;
pub mod offline;
pub mod pending;

use std::path::PathBuf;
use thiserror::Error;

pub use layout::BufferLayout;
pub use lock::DataDirLock;
pub use offline::{
    export_failed_files, read_failed_files, BufferSettings, BufferStats, Eviction, OfflineBuffer,
    SharedOfflineBuffer,
};
pub use pending::{FileState, PendingFile};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file is not tracked by the buffer: {0}")]
    NotTracked(PathBuf),

    #[error("file is not claimed for upload: {0}")]
    NotClaimed(PathBuf),

    #[error("path is outside the pending queue: {0}")]
    OutsideQueue(PathBuf),

    #[error("data directory {0} is in use by another edge-agent process; stop it first")]
    Locked(PathBuf),
}
