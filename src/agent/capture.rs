//! The capture thread: one blocking loop from frame source to consumer.

use super::decode::{format_signal, FrameDecoder};
use crate::batch::{BatchSink, Batcher, SealResult};
use crate::buffer::SharedOfflineBuffer;
use crate::source::{CaptureClock, CanFrame, FrameSource, ReadOutcome};
use std::io::Write;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the capture loop does with each frame.
pub trait FrameConsumer: Send {
    fn consume(&mut self, frame: CanFrame);

    /// Called after every read, whether or not a frame arrived.
    fn tick(&mut self, _now_ns: i64) {}

    /// Called once after the last read.
    fn finish(&mut self) {}
}

/// Full capture: batch frames to files and queue them for upload.
///
/// A batch that cannot be written stays in the batcher and is retried on
/// later ticks. When the disk is full, the oldest queued file is evicted to
/// make room first.
pub struct PersistFrames<B: BatchSink> {
    batcher: Batcher<B>,
    buffer: SharedOfflineBuffer,
    batches_queued: u64,
}

impl<B: BatchSink> PersistFrames<B> {
    pub fn new(batcher: Batcher<B>, buffer: SharedOfflineBuffer) -> Self {
        Self {
            batcher,
            buffer,
            batches_queued: 0,
        }
    }

    pub fn batches_queued(&self) -> u64 {
        self.batches_queued
    }

    /// Frames dropped because their batch could never be written.
    pub fn frames_lost(&self) -> u64 {
        self.batcher.frames_dropped()
    }

    pub fn batcher(&self) -> &Batcher<B> {
        &self.batcher
    }

    fn queue(&mut self, result: SealResult) {
        match result {
            Ok(batch) => match self.buffer.admit(&batch) {
                Ok(_) => self.batches_queued += 1,
                // The file is complete in staging and is admitted on restart.
                Err(e) => error!(
                    path = %batch.path.display(),
                    error = %e,
                    "Failed to queue batch for upload"
                ),
            },
            Err(e) => {
                warn!(
                    error = %e,
                    held_batches = self.batcher.held_batches(),
                    "Batch write failed, will retry"
                );
                if e.is_out_of_space() && self.buffer.evict_oldest().is_none() {
                    warn!("Disk full and no buffered batch left to evict");
                }
            }
        }
    }
}

impl<B: BatchSink> FrameConsumer for PersistFrames<B> {
    fn consume(&mut self, frame: CanFrame) {
        for result in self.batcher.ingest(frame) {
            self.queue(result);
        }
    }

    fn tick(&mut self, now_ns: i64) {
        if let Some(result) = self.batcher.tick(now_ns) {
            self.queue(result);
        }
        for result in self.batcher.retry_held(now_ns) {
            self.queue(result);
        }
    }

    fn finish(&mut self) {
        if let Some(result) = self.batcher.seal() {
            self.queue(result);
        }
        for result in self.batcher.retry_held(i64::MAX) {
            self.queue(result);
        }
        self.batcher.abandon_held();
    }
}

/// Dry-run: log every frame, write nothing.
#[derive(Debug, Default)]
pub struct LogFrames {
    frames: u64,
    length_mismatches: u64,
}

impl LogFrames {
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn length_mismatches(&self) -> u64 {
        self.length_mismatches
    }
}

impl FrameConsumer for LogFrames {
    fn consume(&mut self, frame: CanFrame) {
        self.frames += 1;
        if !frame.length_consistent() {
            self.length_mismatches += 1;
        }
        info!(frame = %frame, "Frame");
    }

    fn finish(&mut self) {
        info!(
            frames = self.frames,
            length_mismatches = self.length_mismatches,
            "Dry run finished"
        );
    }
}

/// Decode-live: print decoded signals, one line each.
pub struct DecodeFrames<W: Write + Send> {
    decoder: Box<dyn FrameDecoder>,
    out: W,
    frames: u64,
    decoded: u64,
    unknown: u64,
}

impl<W: Write + Send> DecodeFrames<W> {
    pub fn new(decoder: Box<dyn FrameDecoder>, out: W) -> Self {
        info!(decoder = decoder.name(), "Decoding live frames");
        Self {
            decoder,
            out,
            frames: 0,
            decoded: 0,
            unknown: 0,
        }
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn unknown(&self) -> u64 {
        self.unknown
    }

    pub fn into_output(self) -> W {
        self.out
    }
}

impl<W: Write + Send> FrameConsumer for DecodeFrames<W> {
    fn consume(&mut self, frame: CanFrame) {
        self.frames += 1;
        let Some(signals) = self.decoder.decode(&frame) else {
            self.unknown += 1;
            debug!(
                arbitration_id = %format_args!("0x{:03X}", frame.arbitration_id),
                payload = %frame.payload_hex(),
                "Unknown frame"
            );
            return;
        };

        self.decoded += 1;
        for signal in &signals {
            if let Err(e) = writeln!(self.out, "{}", format_signal(&frame, signal)) {
                warn!(error = %e, "Failed to write decoded signal");
                return;
            }
        }
    }

    fn finish(&mut self) {
        let _ = self.out.flush();
        info!(
            frames = self.frames,
            decoded = self.decoded,
            unknown = self.unknown,
            "Decode-live finished"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    EndOfStream,
    SourceFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: u64,
    pub stop: StopReason,
}

/// Reads frames until shutdown, end of stream or a fatal source error, then
/// finishes the consumer (sealing any open batch) and closes the source.
///
/// Shutdown is checked between reads, so it is observed within one read
/// timeout.
pub struct CaptureLoop<S: FrameSource, C: FrameConsumer> {
    source: S,
    consumer: C,
    clock: CaptureClock,
    read_timeout: Duration,
}

impl<S: FrameSource, C: FrameConsumer> CaptureLoop<S, C> {
    pub fn new(source: S, consumer: C, clock: CaptureClock, read_timeout: Duration) -> Self {
        Self {
            source,
            consumer,
            clock,
            read_timeout,
        }
    }

    pub fn run(mut self, shutdown: watch::Receiver<bool>) -> (CaptureSummary, C) {
        info!(source = %self.source.describe(), "Capture started");
        let mut frames = 0u64;

        let stop = loop {
            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }

            match self.source.read(self.read_timeout) {
                Ok(ReadOutcome::Frame(frame)) => {
                    frames += 1;
                    self.consumer.consume(frame);
                }
                Ok(ReadOutcome::Timeout) => {}
                Ok(ReadOutcome::EndOfStream) => break StopReason::EndOfStream,
                Err(e) => {
                    error!(source = %self.source.describe(), error = %e, "Frame source failed");
                    break StopReason::SourceFailed(e.to_string());
                }
            }
            self.consumer.tick(self.clock.now_ns());
        };

        self.consumer.finish();
        self.source.close();
        info!(frames, stop = ?stop, "Capture stopped");
        (CaptureSummary { frames, stop }, self.consumer)
    }
}

impl<S, C> CaptureLoop<S, C>
where
    S: FrameSource + 'static,
    C: FrameConsumer + 'static,
{
    /// Run on the blocking pool; reads block the thread.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<(CaptureSummary, C)> {
        tokio::task::spawn_blocking(move || self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::decode::CatalogDecoder;
    use crate::batch::{BatchError, ParquetBatchWriter, SealedBatch, SerializedBatch};
    use crate::buffer::{BufferSettings, OfflineBuffer};
    use crate::config::types::{Compression, Retention, SimulationConfig};
    use crate::source::{SharedSourceStats, SimulatedSource, SourceError, SourceStats};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    const NS: i64 = 1_000_000_000;
    const T0: i64 = 1_777_636_800 * NS;

    /// Replays a fixed script of read outcomes.
    struct ScriptedSource {
        script: VecDeque<Result<ReadOutcome, SourceError>>,
        stats: SharedSourceStats,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<ReadOutcome, SourceError>>) -> Self {
            Self {
                script: script.into(),
                stats: SourceStats::shared(Duration::from_secs(10)),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self, _timeout: Duration) -> Result<ReadOutcome, SourceError> {
            self.script.pop_front().unwrap_or(Ok(ReadOutcome::EndOfStream))
        }

        fn close(&mut self) {}

        fn stats(&self) -> SharedSourceStats {
            self.stats.clone()
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Writes each sealed batch as a small file in `dir`.
    struct FileSink {
        dir: PathBuf,
    }

    impl BatchSink for FileSink {
        fn write(&mut self, batch: &SealedBatch) -> SealResult {
            let relative_path = batch.partition.relative_path(batch.window_start_ns);
            let path = self.dir.join(&relative_path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![0u8; batch.frames.len()]).unwrap();
            Ok(SerializedBatch {
                path,
                relative_path,
                size_bytes: batch.frames.len() as u64,
                frame_count: batch.frames.len(),
                window_start_ns: batch.window_start_ns,
                window_end_ns: batch.window_end_ns,
            })
        }
    }

    /// Reports a full disk for the first `failures` writes.
    struct FullDiskSink {
        failures: usize,
        inner: FileSink,
    }

    impl BatchSink for FullDiskSink {
        fn write(&mut self, batch: &SealedBatch) -> SealResult {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(BatchError::Write {
                    path: self.inner.dir.clone(),
                    frames: batch.frames.len(),
                    reason: "No space left on device (os error 28)".to_string(),
                    out_of_space: true,
                });
            }
            self.inner.write(batch)
        }
    }

    fn can_frame(offset_ms: i64) -> CanFrame {
        CanFrame::new(T0 + offset_ms * 1_000_000, 0x100, 1, vec![0xAA], Arc::from("v"))
    }

    fn frame(offset_ms: i64) -> Result<ReadOutcome, SourceError> {
        Ok(ReadOutcome::Frame(CanFrame::new(
            T0 + offset_ms * 1_000_000,
            0x100,
            1,
            vec![0xAA],
            Arc::from("veh-1"),
        )))
    }

    fn buffer(dir: &TempDir) -> SharedOfflineBuffer {
        let settings = BufferSettings {
            quota_bytes: 1 << 20,
            max_files: None,
            retention: Retention::Archive,
            archive_limit_bytes: None,
            backoff: crate::backoff::Backoff::default(),
            max_attempts: 5,
        };
        Arc::new(OfflineBuffer::open(dir.path(), settings).unwrap())
    }

    #[test]
    fn test_end_of_stream_seals_open_batch() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir);
        let sink = FileSink {
            dir: buffer.layout().staging.clone(),
        };
        let batcher = Batcher::new(sink, Duration::from_secs(60), 1000, Arc::from("veh-1"));
        let source = ScriptedSource::new(vec![frame(0), Ok(ReadOutcome::Timeout), frame(5), frame(10)]);
        let (_tx, rx) = watch::channel(false);

        let capture = CaptureLoop::new(
            source,
            PersistFrames::new(batcher, buffer.clone()),
            CaptureClock::anchored_at(T0),
            Duration::from_millis(10),
        );
        let (summary, consumer) = capture.run(rx);

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.stop, StopReason::EndOfStream);
        assert_eq!(consumer.batches_queued(), 1);
        assert_eq!(consumer.frames_lost(), 0);
        let stats = buffer.stats();
        assert_eq!(stats.pending_files, 1);
        assert_eq!(stats.pending_bytes, 3);
    }

    #[test]
    fn test_blocked_staging_is_retried_not_lost() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir);
        let staging = buffer.layout().staging.clone();
        let writer = ParquetBatchWriter::new(&staging, Compression::Zstd, 3).unwrap();
        let batcher = Batcher::new(writer, Duration::from_secs(60), 5, Arc::from("v"));
        let blocker = staging.join("vehicle_id=v");
        std::fs::write(&blocker, b"").unwrap();

        let mut persist = PersistFrames::new(batcher, buffer.clone());
        for i in 0..5 {
            persist.consume(can_frame(i));
        }
        assert_eq!(persist.batcher().held_batches(), 1);
        persist.tick(T0 + NS);
        assert_eq!(persist.batcher().held_batches(), 1);
        assert_eq!(persist.batches_queued(), 0);

        std::fs::remove_file(&blocker).unwrap();
        persist.finish();

        assert_eq!(persist.frames_lost(), 0);
        assert_eq!(persist.batches_queued(), 1);
        assert_eq!(persist.batcher().held_batches(), 0);
        assert_eq!(buffer.stats().pending_files, 1);
    }

    #[test]
    fn test_full_disk_evicts_oldest_and_retries() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir);
        let staging = buffer.layout().staging.clone();

        // An older batch already waiting for upload
        let mut seed = Batcher::new(
            FileSink { dir: staging.clone() },
            Duration::from_secs(60),
            1,
            Arc::from("old"),
        );
        let old = seed.ingest(can_frame(0)).remove(0).unwrap();
        buffer.admit(&old).unwrap();

        let sink = FullDiskSink {
            failures: 1,
            inner: FileSink { dir: staging },
        };
        let mut persist = PersistFrames::new(
            Batcher::new(sink, Duration::from_secs(60), 2, Arc::from("v")),
            buffer.clone(),
        );
        persist.consume(can_frame(1));
        persist.consume(can_frame(2));
        assert_eq!(buffer.stats().evicted_files, 1);
        assert_eq!(persist.batcher().held_batches(), 1);

        persist.tick(T0 + NS);
        assert_eq!(persist.batches_queued(), 1);
        assert_eq!(persist.frames_lost(), 0);
        let files = buffer.files();
        assert_eq!(files.len(), 1);
        assert!(files[0].relative_path.starts_with("vehicle_id=v"));
    }

    #[test]
    fn test_shutdown_before_first_read() {
        let source = ScriptedSource::new(vec![frame(0)]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let capture = CaptureLoop::new(
            source,
            LogFrames::default(),
            CaptureClock::anchored_at(T0),
            Duration::from_millis(10),
        );
        let (summary, consumer) = capture.run(rx);
        assert_eq!(summary.stop, StopReason::Shutdown);
        assert_eq!(consumer.frames(), 0);
    }

    #[test]
    fn test_source_failure_stops_capture() {
        let source = ScriptedSource::new(vec![frame(0), Err(SourceError::Closed), frame(1)]);
        let (_tx, rx) = watch::channel(false);

        let (summary, consumer) = CaptureLoop::new(
            source,
            LogFrames::default(),
            CaptureClock::anchored_at(T0),
            Duration::from_millis(10),
        )
        .run(rx);
        assert_eq!(consumer.frames(), 1);
        assert!(matches!(summary.stop, StopReason::SourceFailed(_)));
    }

    #[test]
    fn test_mismatched_length_is_logged_not_dropped() {
        let bad = CanFrame::new(T0, 0x200, 8, vec![1, 2], Arc::from("veh-1"));
        let source = ScriptedSource::new(vec![Ok(ReadOutcome::Frame(bad)), frame(1)]);
        let (_tx, rx) = watch::channel(false);

        let (summary, consumer) = CaptureLoop::new(
            source,
            LogFrames::default(),
            CaptureClock::anchored_at(T0),
            Duration::from_millis(10),
        )
        .run(rx);
        assert_eq!(summary.frames, 2);
        assert_eq!(consumer.frames(), 2);
        assert_eq!(consumer.length_mismatches(), 1);
    }

    #[test]
    fn test_decode_live_prints_simulated_signals() {
        let config = SimulationConfig {
            frame_rate_hz: 1000,
            seed: 7,
            duration: Some(Duration::from_millis(6)),
            cycle: Vec::new(),
        };
        let stats = SourceStats::shared(Duration::from_secs(10));
        let clock = CaptureClock::new();
        let source = SimulatedSource::new(&config, stats, clock, Arc::from("veh-1"));
        let (_tx, rx) = watch::channel(false);

        let consumer = DecodeFrames::new(Box::new(CatalogDecoder), Vec::new());
        let (summary, consumer) =
            CaptureLoop::new(source, consumer, clock, Duration::from_millis(50)).run(rx);

        assert_eq!(summary.frames, 6);
        assert_eq!(consumer.decoded(), 6);
        assert_eq!(consumer.unknown(), 0);
        let text = String::from_utf8(consumer.into_output()).unwrap();
        assert!(text.lines().any(|l| l.contains("EngineStatus.EngineRPM = ")));
        assert!(text.lines().any(|l| l.contains("BatteryStatus.PackVoltage = ")));
        assert!(text.lines().all(|l| l.starts_with('[')));
    }
}
