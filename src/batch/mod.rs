//! Time-windowed batching of captured frames and their columnar serialization.

pub mod batcher;
pub mod partition;
pub mod writer;

use std::path::PathBuf;
use thiserror::Error;

pub use batcher::{BatchSink, Batcher, SealReason, SealResult, SealedBatch, DEFAULT_HELD_LIMIT};
pub use partition::PartitionKey;
pub use writer::{ParquetBatchWriter, SerializedBatch};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to prepare staging directory {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write batch of {frames} frames to {path}: {reason}")]
    Write {
        path: PathBuf,
        frames: usize,
        reason: String,
        /// The filesystem reported ENOSPC or EDQUOT.
        out_of_space: bool,
    },

    #[error("invalid compression setting: {0}")]
    Compression(String),
}

impl BatchError {
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, BatchError::Write { out_of_space: true, .. })
    }
}
