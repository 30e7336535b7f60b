//! Full pipeline runs against the simulator and a directory-backed store.

use arrow::array::{StringArray, TimestampNanosecondArray};
use edge_agent::agent::{AgentRunner, RunMode, StopReason};
use edge_agent::batch::partition::is_batch_file;
use edge_agent::buffer::layout::walk_files;
use edge_agent::config::{load_config, Config};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_config(dir: &TempDir, duration: &str, uploads: bool) -> Config {
    let config_yaml = format!(
        r#"
vehicle_id: truck-7
data_dir: {data}
can:
  read_timeout: 10ms
simulation:
  frame_rate_hz: 1000
  seed: 11
  duration: {duration}
batch:
  window: 50ms
upload:
  enabled: {uploads}
  workers: 2
  prefix: raw/can
  poll_interval: 10ms
  store:
    type: local
    path: {bucket}
"#,
        data = dir.path().join("data").display(),
        bucket = dir.path().join("bucket").display(),
        duration = duration,
        uploads = uploads,
    );
    let path = dir.path().join("config.yml");
    fs::write(&path, config_yaml).unwrap();
    load_config(&path).unwrap()
}

fn batch_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    walk_files(dir)
        .unwrap()
        .into_iter()
        .filter(|p| is_batch_file(p))
        .collect()
}

/// Row count and vehicle ids of one uploaded object, checking timestamp order.
fn read_rows(path: &Path) -> (usize, Vec<String>) {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
        .unwrap()
        .build()
        .unwrap();

    let mut rows = 0;
    let mut vehicles = Vec::new();
    let mut last_ts = i64::MIN;
    for batch in reader {
        let batch = batch.unwrap();
        rows += batch.num_rows();

        let ts = batch
            .column(0)
            .as_any()
            .downcast_ref::<TimestampNanosecondArray>()
            .unwrap();
        for i in 0..ts.len() {
            assert!(ts.value(i) >= last_ts, "timestamps out of order in {}", path.display());
            last_ts = ts.value(i);
        }

        let ids = batch
            .column(4)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        vehicles.extend(ids.iter().flatten().map(str::to_string));
    }
    (rows, vehicles)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_captured_frame_reaches_the_store() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "300ms", true);

    let summary = AgentRunner::new(config, RunMode::Simulate)
        .run_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(summary.capture.stop, StopReason::EndOfStream);
    assert_eq!(summary.capture.frames, 300);
    assert_eq!(summary.frames_lost, 0);

    let objects = batch_files(&dir.path().join("bucket/raw/can/vehicle_id=truck-7"));
    assert_eq!(objects.len() as u64, summary.batches_queued);

    let mut total = 0;
    for object in &objects {
        let key = object.strip_prefix(dir.path().join("bucket")).unwrap();
        assert!(key.to_string_lossy().contains("/year="), "{}", key.display());
        let (rows, vehicles) = read_rows(object);
        assert!(rows > 0);
        assert!(vehicles.iter().all(|v| v == "truck-7"));
        total += rows;
    }
    assert_eq!(total as u64, summary.capture.frames);

    assert!(batch_files(&dir.path().join("data/pending")).is_empty());
    assert!(batch_files(&dir.path().join("data/failed")).is_empty());
    assert!(batch_files(&dir.path().join("data/staging")).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batches_buffered_offline_upload_after_restart() {
    let dir = TempDir::new().unwrap();

    // First drive: no connectivity, everything stays queued.
    let offline = write_config(&dir, "150ms", false);
    let first = AgentRunner::new(offline, RunMode::Simulate)
        .run_until(std::future::pending())
        .await
        .unwrap();
    assert!(first.batches_queued >= 1);
    assert_eq!(
        batch_files(&dir.path().join("data/pending")).len() as u64,
        first.batches_queued
    );
    assert!(batch_files(&dir.path().join("bucket")).is_empty());

    // Second drive: the backlog is recovered from disk and drained with the new batches.
    let online = write_config(&dir, "50ms", true);
    let second = AgentRunner::new(online, RunMode::Simulate)
        .run_until(std::future::pending())
        .await
        .unwrap();

    let uploaded = batch_files(&dir.path().join("bucket/raw/can"));
    assert_eq!(
        uploaded.len() as u64,
        first.batches_queued + second.batches_queued
    );
    let rows: usize = uploaded.iter().map(|p| read_rows(p).0).sum();
    assert_eq!(rows as u64, first.capture.frames + second.capture.frames);
    assert!(batch_files(&dir.path().join("data/pending")).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_retention_leaves_no_local_copy() {
    let dir = TempDir::new().unwrap();
    let mut config = write_config(&dir, "100ms", true);
    config.buffer.retention = edge_agent::config::types::Retention::Delete;

    let summary = AgentRunner::new(config, RunMode::Simulate)
        .run_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(
        batch_files(&dir.path().join("bucket")).len() as u64,
        summary.batches_queued
    );
    assert!(batch_files(&dir.path().join("data/archive")).is_empty());
    assert!(batch_files(&dir.path().join("data/pending")).is_empty());
}
