use super::batcher::{BatchSink, SealResult, SealedBatch};
use super::BatchError;
use crate::config::types::Compression;
use arrow::array::{ArrayRef, BinaryArray, StringArray, TimestampNanosecondArray, UInt32Array, UInt8Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, ZstdLevel};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const STAGING_SUFFIX: &str = ".tmp";

/// A batch file that has been fully written and renamed into its staged name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedBatch {
    pub path: PathBuf,
    /// Partition path, relative to the queue root and the bucket prefix.
    pub relative_path: PathBuf,
    pub size_bytes: u64,
    pub frame_count: usize,
    pub window_start_ns: i64,
    pub window_end_ns: i64,
}

/// Why a batch file could not be written.
struct WriteFailure {
    reason: String,
    out_of_space: bool,
}

/// ENOSPC or EDQUOT.
fn is_out_of_space(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(28) | Some(122))
}

impl From<io::Error> for WriteFailure {
    fn from(e: io::Error) -> Self {
        Self {
            out_of_space: is_out_of_space(&e),
            reason: e.to_string(),
        }
    }
}

impl From<ParquetError> for WriteFailure {
    fn from(e: ParquetError) -> Self {
        let out_of_space = match &e {
            ParquetError::External(inner) => inner
                .downcast_ref::<io::Error>()
                .is_some_and(is_out_of_space),
            _ => false,
        };
        Self {
            reason: e.to_string(),
            out_of_space,
        }
    }
}

impl From<arrow::error::ArrowError> for WriteFailure {
    fn from(e: arrow::error::ArrowError) -> Self {
        Self {
            reason: e.to_string(),
            out_of_space: false,
        }
    }
}

/// Fixed batch schema consumed by the downstream decoder.
pub fn batch_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
            false,
        ),
        Field::new("arbitration_id", DataType::UInt32, false),
        Field::new("data_length_code", DataType::UInt8, false),
        Field::new("payload", DataType::Binary, false),
        Field::new("vehicle_id", DataType::Utf8, false),
    ]))
}

/// Writes sealed batches as Parquet files under a staging directory.
///
/// Each file is written to `<name>.tmp`, synced, and renamed, so a reader of
/// the staging directory never sees a truncated batch.
pub struct ParquetBatchWriter {
    staging_dir: PathBuf,
    schema: SchemaRef,
    properties: WriterProperties,
}

impl ParquetBatchWriter {
    pub fn new(
        staging_dir: impl Into<PathBuf>,
        compression: Compression,
        zstd_level: i32,
    ) -> Result<Self, BatchError> {
        let staging_dir = staging_dir.into();
        fs::create_dir_all(&staging_dir).map_err(|source| BatchError::Staging {
            path: staging_dir.clone(),
            source,
        })?;

        let codec = match compression {
            Compression::Zstd => ParquetCompression::ZSTD(
                ZstdLevel::try_new(zstd_level).map_err(|e| BatchError::Compression(e.to_string()))?,
            ),
            Compression::Snappy => ParquetCompression::SNAPPY,
            Compression::None => ParquetCompression::UNCOMPRESSED,
        };
        let properties = WriterProperties::builder().set_compression(codec).build();

        info!(
            staging_dir = %staging_dir.display(),
            compression = ?compression,
            "Initializing Parquet batch writer"
        );

        Ok(Self {
            staging_dir,
            schema: batch_schema(),
            properties,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn record_batch(&self, batch: &SealedBatch) -> Result<RecordBatch, arrow::error::ArrowError> {
        let frames = &batch.frames;
        let columns: Vec<ArrayRef> = vec![
            Arc::new(
                TimestampNanosecondArray::from_iter_values(frames.iter().map(|f| f.timestamp_ns))
                    .with_timezone("UTC"),
            ),
            Arc::new(UInt32Array::from_iter_values(
                frames.iter().map(|f| f.arbitration_id),
            )),
            Arc::new(UInt8Array::from_iter_values(
                frames.iter().map(|f| f.data_length_code),
            )),
            Arc::new(BinaryArray::from_iter_values(
                frames.iter().map(|f| f.payload.as_slice()),
            )),
            Arc::new(StringArray::from_iter_values(
                frames.iter().map(|f| f.vehicle_id.as_ref()),
            )),
        ];
        RecordBatch::try_new(self.schema.clone(), columns)
    }

    fn write_file(&self, batch: &SealedBatch, tmp: &Path, path: &Path) -> Result<u64, WriteFailure> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let record_batch = self.record_batch(batch)?;
        let file = File::create(tmp)?;
        let mut writer = ArrowWriter::try_new(file, self.schema.clone(), Some(self.properties.clone()))?;
        writer.write(&record_batch)?;
        let file = writer.into_inner()?;
        file.sync_all()?;
        drop(file);

        fs::rename(tmp, path)?;
        Ok(fs::metadata(path)?.len())
    }
}

/// `<path>.tmp`
pub fn staging_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

impl BatchSink for ParquetBatchWriter {
    fn write(&mut self, batch: &SealedBatch) -> SealResult {
        let relative_path = batch.partition.relative_path(batch.window_start_ns);
        let path = self.staging_dir.join(&relative_path);
        let tmp = staging_name(&path);

        match self.write_file(batch, &tmp, &path) {
            Ok(size_bytes) => {
                info!(
                    path = %relative_path.display(),
                    frames = batch.frames.len(),
                    size_bytes,
                    reason = batch.reason.as_str(),
                    "Batch written"
                );
                Ok(SerializedBatch {
                    path,
                    relative_path,
                    size_bytes,
                    frame_count: batch.frames.len(),
                    window_start_ns: batch.window_start_ns,
                    window_end_ns: batch.window_end_ns,
                })
            }
            Err(failure) => {
                let _ = fs::remove_file(&tmp);
                Err(BatchError::Write {
                    path,
                    frames: batch.frames.len(),
                    reason: failure.reason,
                    out_of_space: failure.out_of_space,
                })
            }
        }
    }
}
