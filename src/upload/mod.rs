//! Uploader: moves buffered batch files to the object store.

pub mod store;
pub mod worker;

pub use store::{build_store, LocalDirStore, ObjectStore, S3Store, SharedObjectStore, StoreError};
pub use worker::{SharedUploadStats, UploadStats, UploadStatsSnapshot, UploadWorker, WorkerSettings};
