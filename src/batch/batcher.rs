use super::partition::PartitionKey;
use super::writer::SerializedBatch;
use super::BatchError;
use crate::source::CanFrame;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of one write attempt: the written file, or the error that kept
/// the batch in memory for another attempt.
pub type SealResult = Result<SerializedBatch, BatchError>;

/// Unwritten batches kept in memory by default before the oldest is dropped.
pub const DEFAULT_HELD_LIMIT: usize = 16;

/// Capture time between write retries of held batches.
const HELD_RETRY_INTERVAL_NS: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    /// `window_duration` elapsed since `window_start`.
    WindowElapsed,
    /// The batch reached `max_frames`.
    MaxFrames,
    /// Forced by the owner (shutdown).
    Flush,
}

impl SealReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SealReason::WindowElapsed => "window",
            SealReason::MaxFrames => "max_frames",
            SealReason::Flush => "flush",
        }
    }
}

/// A closed batch. Handed to the sink until one write succeeds.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    pub window_start_ns: i64,
    /// Exclusive end of the batch interval.
    pub window_end_ns: i64,
    /// Arrival order.
    pub frames: Vec<CanFrame>,
    pub partition: PartitionKey,
    pub reason: SealReason,
}

/// Serializes sealed batches. Implemented by the Parquet writer and test sinks.
pub trait BatchSink: Send {
    /// A failed write leaves the batch with the caller, which may retry it.
    fn write(&mut self, batch: &SealedBatch) -> SealResult;
}

struct OpenBatch {
    window_start_ns: i64,
    last_ts_ns: i64,
    frames: Vec<CanFrame>,
}

/// Groups frames into windows and seals them into files through a [`BatchSink`].
///
/// At most one batch is open. Every frame lands in exactly one sealed batch:
/// a frame at or past the open window's end seals that window first and then
/// opens the next one with `window_start` = the frame's timestamp. The
/// batcher is owned by the capture thread, so sealing is atomic with respect
/// to ingestion.
///
/// A batch the sink fails to write is held in memory and retried from
/// [`Batcher::retry_held`]. Only when more than `held_limit` batches are
/// waiting is the oldest one dropped.
pub struct Batcher<S: BatchSink> {
    sink: S,
    window_ns: i64,
    max_frames: usize,
    vehicle_id: Arc<str>,
    open: Option<OpenBatch>,
    sealed: u64,
    held: VecDeque<SealedBatch>,
    held_limit: usize,
    next_retry_ns: i64,
    frames_dropped: u64,
}

impl<S: BatchSink> Batcher<S> {
    pub fn new(sink: S, window: Duration, max_frames: usize, vehicle_id: Arc<str>) -> Self {
        let window_ns = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX).max(1);
        info!(
            window_ms = window.as_millis() as u64,
            max_frames,
            vehicle_id = %vehicle_id,
            "Initializing batcher"
        );
        Self {
            sink,
            window_ns,
            max_frames: max_frames.max(1),
            vehicle_id,
            open: None,
            sealed: 0,
            held: VecDeque::new(),
            held_limit: DEFAULT_HELD_LIMIT,
            next_retry_ns: i64::MIN,
            frames_dropped: 0,
        }
    }

    pub fn with_held_limit(mut self, limit: usize) -> Self {
        self.held_limit = limit.max(1);
        self
    }

    /// Frames in the open batch.
    pub fn open_frames(&self) -> usize {
        self.open.as_ref().map_or(0, |b| b.frames.len())
    }

    /// Window start of the open batch, if any.
    pub fn open_window_start(&self) -> Option<i64> {
        self.open.as_ref().map(|b| b.window_start_ns)
    }

    pub fn sealed_count(&self) -> u64 {
        self.sealed
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Sealed batches waiting for a successful write.
    pub fn held_batches(&self) -> usize {
        self.held.len()
    }

    /// Frames dropped with unwritten batches.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    fn window_end(&self, start: i64) -> i64 {
        start.saturating_add(self.window_ns)
    }

    /// Append one frame. Returns the batches this frame caused to seal:
    /// none, the expired previous window, and/or the batch it filled.
    pub fn ingest(&mut self, frame: CanFrame) -> Vec<SealResult> {
        let mut results = Vec::new();
        let ts = frame.timestamp_ns;

        let expired = self
            .open
            .as_ref()
            .is_some_and(|open| ts >= self.window_end(open.window_start_ns));
        if expired {
            results.extend(self.seal_open(SealReason::WindowElapsed));
        }

        let open = self.open.get_or_insert_with(|| OpenBatch {
            window_start_ns: ts,
            last_ts_ns: ts,
            frames: Vec::new(),
        });
        open.last_ts_ns = open.last_ts_ns.max(ts);
        open.frames.push(frame);

        if open.frames.len() >= self.max_frames {
            results.extend(self.seal_open(SealReason::MaxFrames));
        }
        results
    }

    /// Seal the open batch if its window has elapsed at `now_ns`, independent of
    /// frame arrival so an idle bus still flushes a stale window.
    pub fn tick(&mut self, now_ns: i64) -> Option<SealResult> {
        let window_start_ns = self.open.as_ref()?.window_start_ns;
        if now_ns.saturating_sub(window_start_ns) >= self.window_ns {
            self.seal_open(SealReason::WindowElapsed)
        } else {
            None
        }
    }

    /// Seal whatever is open. `None` when nothing was buffered.
    pub fn seal(&mut self) -> Option<SealResult> {
        self.seal_open(SealReason::Flush)
    }

    fn seal_open(&mut self, reason: SealReason) -> Option<SealResult> {
        let open = self.open.take()?;
        let window_end_ns = match reason {
            SealReason::WindowElapsed => self.window_end(open.window_start_ns),
            SealReason::MaxFrames | SealReason::Flush => open.last_ts_ns.saturating_add(1),
        };

        let batch = SealedBatch {
            window_start_ns: open.window_start_ns,
            window_end_ns,
            partition: PartitionKey::for_window(Arc::clone(&self.vehicle_id), open.window_start_ns),
            frames: open.frames,
            reason,
        };
        debug!(
            frames = batch.frames.len(),
            reason = reason.as_str(),
            partition = %batch.partition,
            "Sealing batch"
        );

        self.sealed += 1;
        let result = self.sink.write(&batch);
        if result.is_err() {
            self.hold(batch);
        }
        Some(result)
    }

    fn hold(&mut self, batch: SealedBatch) {
        if self.held.len() >= self.held_limit {
            if let Some(dropped) = self.held.pop_front() {
                self.frames_dropped += dropped.frames.len() as u64;
                error!(
                    event = "data_loss",
                    frames = dropped.frames.len(),
                    partition = %dropped.partition,
                    held_limit = self.held_limit,
                    "Too many unwritten batches, dropping the oldest"
                );
            }
        }
        warn!(
            frames = batch.frames.len(),
            held = self.held.len() + 1,
            "Batch kept in memory until it can be written"
        );
        self.held.push_back(batch);
    }

    /// Write held batches again, oldest first, at most once per second of
    /// capture time. Stops at the first failure.
    pub fn retry_held(&mut self, now_ns: i64) -> Vec<SealResult> {
        if self.held.is_empty() || now_ns < self.next_retry_ns {
            return Vec::new();
        }
        self.next_retry_ns = now_ns.saturating_add(HELD_RETRY_INTERVAL_NS);

        let mut results = Vec::new();
        while let Some(batch) = self.held.pop_front() {
            match self.sink.write(&batch) {
                Ok(written) => {
                    info!(frames = written.frame_count, "Held batch written");
                    results.push(Ok(written));
                }
                Err(e) => {
                    self.held.push_front(batch);
                    results.push(Err(e));
                    break;
                }
            }
        }
        results
    }

    /// Give up on every held batch. Returns the frames dropped.
    pub fn abandon_held(&mut self) -> usize {
        let frames: usize = self.held.iter().map(|b| b.frames.len()).sum();
        if !self.held.is_empty() {
            error!(
                event = "data_loss",
                batches = self.held.len(),
                frames,
                "Unwritten batches dropped"
            );
        }
        self.frames_dropped += frames as u64;
        self.held.clear();
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Keeps every sealed batch in memory.
    #[derive(Default)]
    struct MemorySink {
        batches: Vec<SealedBatch>,
    }

    impl BatchSink for MemorySink {
        fn write(&mut self, batch: &SealedBatch) -> SealResult {
            let serialized = SerializedBatch {
                path: PathBuf::from(format!("mem/{}", batch.window_start_ns)),
                relative_path: batch.partition.relative_path(batch.window_start_ns),
                size_bytes: batch.frames.len() as u64,
                frame_count: batch.frames.len(),
                window_start_ns: batch.window_start_ns,
                window_end_ns: batch.window_end_ns,
            };
            self.batches.push(batch.clone());
            Ok(serialized)
        }
    }

    const SEC: i64 = 1_000_000_000;
    const BASE: i64 = 1_767_225_600 * SEC; // 2026-01-01T00:00:00Z

    fn frame(ts: i64, id: u32) -> CanFrame {
        CanFrame::new(ts, id, 2, vec![0xAB, 0xCD], Arc::from("veh-1"))
    }

    fn batcher(window: Duration, max_frames: usize) -> Batcher<MemorySink> {
        Batcher::new(MemorySink::default(), window, max_frames, Arc::from("veh-1"))
    }

    #[test]
    fn test_idle_tick_flushes_stale_window() {
        let mut b = batcher(Duration::from_secs(60), 50_000);
        for i in 0..10 {
            assert!(b.ingest(frame(BASE + i * 1_000_000, i as u32)).is_empty());
        }
        assert!(b.tick(BASE + 30 * SEC).is_none());

        let sealed = b.tick(BASE + 61 * SEC).unwrap().unwrap();
        assert_eq!(sealed.frame_count, 10);
        assert_eq!(sealed.window_start_ns, BASE);
        assert_eq!(sealed.window_end_ns, BASE + 60 * SEC);
        assert_eq!(b.sink().batches.len(), 1);
        assert_eq!(b.open_frames(), 0);

        // Empty windows never produce a file
        assert!(b.tick(BASE + 200 * SEC).is_none());
        assert!(b.seal().is_none());
    }

    #[test]
    fn test_max_frames_seals_immediately() {
        let mut b = batcher(Duration::from_secs(60), 3);
        assert!(b.ingest(frame(BASE, 1)).is_empty());
        assert!(b.ingest(frame(BASE + 1, 2)).is_empty());
        let sealed = b.ingest(frame(BASE + 2, 3));
        assert_eq!(sealed.len(), 1);
        let batch = sealed.into_iter().next().unwrap().unwrap();
        assert_eq!(batch.frame_count, 3);
        assert_eq!(batch.window_end_ns, BASE + 3);
        assert_eq!(b.sink().batches[0].reason, SealReason::MaxFrames);
    }

    #[test]
    fn test_late_frame_opens_next_window() {
        let mut b = batcher(Duration::from_secs(10), 100);
        b.ingest(frame(BASE, 1));
        b.ingest(frame(BASE + 9 * SEC, 2));
        let sealed = b.ingest(frame(BASE + 10 * SEC, 3));
        assert_eq!(sealed.len(), 1);
        assert_eq!(b.open_window_start(), Some(BASE + 10 * SEC));
        assert_eq!(b.open_frames(), 1);

        let first = &b.sink().batches[0];
        let ids: Vec<u32> = first.frames.iter().map(|f| f.arbitration_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_window_crossing_and_ceiling_on_same_frame() {
        let mut b = batcher(Duration::from_secs(1), 1);
        assert_eq!(b.ingest(frame(BASE, 1)).len(), 1);
        assert_eq!(b.ingest(frame(BASE + 5 * SEC, 2)).len(), 1);
        assert_eq!(b.sealed_count(), 2);
    }

    #[test]
    fn test_flush_keeps_mismatched_payload() {
        let mut b = batcher(Duration::from_secs(60), 100);
        let odd = CanFrame::new(BASE, 0x10, 8, vec![1], Arc::from("veh-1"));
        b.ingest(odd.clone());
        let sealed = b.seal().unwrap().unwrap();
        assert_eq!(sealed.frame_count, 1);
        assert_eq!(b.sink().batches[0].frames[0], odd);
        assert_eq!(b.sink().batches[0].reason, SealReason::Flush);
    }

    /// Fails the first `failures` writes, then delegates to a [`MemorySink`].
    struct FlakySink {
        failures: usize,
        inner: MemorySink,
    }

    impl BatchSink for FlakySink {
        fn write(&mut self, batch: &SealedBatch) -> SealResult {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(BatchError::Write {
                    path: PathBuf::from("staging/blocked"),
                    frames: batch.frames.len(),
                    reason: "Not a directory (os error 20)".to_string(),
                    out_of_space: false,
                });
            }
            self.inner.write(batch)
        }
    }

    fn flaky(failures: usize, max_frames: usize) -> Batcher<FlakySink> {
        let sink = FlakySink {
            failures,
            inner: MemorySink::default(),
        };
        Batcher::new(sink, Duration::from_secs(60), max_frames, Arc::from("veh-1"))
    }

    #[test]
    fn test_failed_write_is_held_and_retried() {
        let mut b = flaky(2, 3);
        b.ingest(frame(BASE, 1));
        b.ingest(frame(BASE + 1, 2));
        let sealed = b.ingest(frame(BASE + 2, 3));
        assert!(sealed[0].is_err());
        assert_eq!(b.held_batches(), 1);

        let retried = b.retry_held(BASE + SEC);
        assert_eq!(retried.len(), 1);
        assert!(retried[0].is_err());
        // Throttled until a second of capture time has passed
        assert!(b.retry_held(BASE + SEC + SEC / 2).is_empty());

        let retried = b.retry_held(BASE + 2 * SEC);
        assert_eq!(retried.len(), 1);
        let written = retried.into_iter().next().unwrap().unwrap();
        assert_eq!(written.frame_count, 3);
        assert_eq!(b.held_batches(), 0);
        assert_eq!(b.frames_dropped(), 0);

        let ids: Vec<u32> = b.sink().inner.batches[0].frames.iter().map(|f| f.arbitration_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_held_limit_drops_oldest() {
        let mut b = flaky(usize::MAX, 1).with_held_limit(2);
        for i in 0..3 {
            assert!(b.ingest(frame(BASE + i, i as u32))[0].is_err());
        }
        assert_eq!(b.held_batches(), 2);
        assert_eq!(b.frames_dropped(), 1);

        assert_eq!(b.abandon_held(), 2);
        assert_eq!(b.held_batches(), 0);
        assert_eq!(b.frames_dropped(), 3);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn batches_partition_the_stream(
                gaps in prop::collection::vec(0i64..3 * SEC, 1..400),
                window_secs in 1u64..20,
                max_frames in 1usize..50,
                ticks in prop::collection::vec(any::<bool>(), 1..400),
            ) {
                let window = Duration::from_secs(window_secs);
                let mut b = batcher(window, max_frames);
                let mut ts = BASE;
                for (i, gap) in gaps.iter().enumerate() {
                    ts += gap;
                    for result in b.ingest(frame(ts, i as u32)) {
                        prop_assert!(result.is_ok());
                    }
                    if ticks.get(i).copied().unwrap_or(false) {
                        if let Some(result) = b.tick(ts + gap / 2) {
                            prop_assert!(result.is_ok());
                        }
                    }
                }
                if let Some(result) = b.seal() {
                    prop_assert!(result.is_ok());
                }

                let window_ns = window.as_nanos() as i64;
                let mut seen = Vec::new();
                for batch in &b.sink().batches {
                    prop_assert!(!batch.frames.is_empty());
                    prop_assert!(batch.frames.len() <= max_frames);
                    for f in &batch.frames {
                        prop_assert!(f.timestamp_ns >= batch.window_start_ns);
                        prop_assert!(f.timestamp_ns < batch.window_start_ns + window_ns);
                        prop_assert!(f.timestamp_ns < batch.window_end_ns);
                        seen.push(f.arbitration_id);
                    }
                }
                let expected: Vec<u32> = (0..gaps.len() as u32).collect();
                prop_assert_eq!(seen, expected);
            }
        }
    }
}
