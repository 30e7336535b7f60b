use edge_agent::batch::{BatchSink, Batcher, SealResult, SealedBatch, SerializedBatch};
use edge_agent::source::CanFrame;
use proptest::prelude::*;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BASE_NS: i64 = 1_780_000_000_000_000_000;

#[derive(Clone, Default)]
struct CollectSink {
    batches: Arc<Mutex<Vec<SealedBatch>>>,
}

impl BatchSink for CollectSink {
    fn write(&mut self, batch: &SealedBatch) -> SealResult {
        let serialized = SerializedBatch {
            path: PathBuf::from("mem"),
            relative_path: batch.partition.relative_path(batch.window_start_ns),
            size_bytes: 0,
            frame_count: batch.frames.len(),
            window_start_ns: batch.window_start_ns,
            window_end_ns: batch.window_end_ns,
        };
        self.batches.lock().unwrap().push(batch.clone());
        Ok(serialized)
    }
}

#[derive(Debug, Clone)]
enum Step {
    /// Frame arriving this many ms after the previous event.
    Frame(u16),
    /// Timer tick this many ms after the previous event.
    Tick(u16),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u16..120).prop_map(Step::Frame),
        1 => (0u16..300).prop_map(Step::Tick),
    ]
}

proptest! {
    #[test]
    fn batches_partition_the_stream_within_bounds(
        steps in prop::collection::vec(step(), 1..200),
        window_ms in 50u64..500,
        max_frames in 1usize..20,
    ) {
        let sink = CollectSink::default();
        let batches = Arc::clone(&sink.batches);
        let window_ns = window_ms as i64 * 1_000_000;
        let mut batcher = Batcher::new(sink, Duration::from_millis(window_ms), max_frames, Arc::from("prop"));

        let mut now = BASE_NS;
        let mut sent = 0u32;
        for step in steps {
            match step {
                Step::Frame(gap) => {
                    now += gap as i64 * 1_000_000;
                    let frame = CanFrame::new(now, sent, 1, vec![0], Arc::from("prop"));
                    for result in batcher.ingest(frame) {
                        prop_assert!(result.is_ok());
                    }
                    sent += 1;
                }
                Step::Tick(gap) => {
                    now += gap as i64 * 1_000_000;
                    if let Some(result) = batcher.tick(now) {
                        prop_assert!(result.is_ok());
                    }
                }
            }
        }
        if let Some(result) = batcher.seal() {
            prop_assert!(result.is_ok());
        }

        let batches = batches.lock().unwrap();
        let ids: Vec<u32> = batches
            .iter()
            .flat_map(|b| b.frames.iter().map(|f| f.arbitration_id))
            .collect();
        prop_assert_eq!(ids, (0..sent).collect::<Vec<_>>());

        for batch in batches.iter() {
            prop_assert!(!batch.frames.is_empty());
            prop_assert!(batch.frames.len() <= max_frames);
            prop_assert!(batch.window_end_ns - batch.window_start_ns <= window_ns);
            for frame in &batch.frames {
                prop_assert!(frame.timestamp_ns >= batch.window_start_ns);
                prop_assert!(frame.timestamp_ns < batch.window_end_ns);
            }
        }
    }
}

#[test]
fn test_idle_bus_flushes_after_window() {
    let sink = CollectSink::default();
    let batches = Arc::clone(&sink.batches);
    let mut batcher = Batcher::new(sink, Duration::from_secs(60), 50_000, Arc::from("veh"));

    for i in 0..10 {
        assert!(batcher.ingest(CanFrame::new(BASE_NS + i, 0x100, 0, Vec::new(), Arc::from("veh"))).is_empty());
    }
    assert!(batcher.tick(BASE_NS + 59 * 1_000_000_000).is_none());
    let sealed = batcher.tick(BASE_NS + 61 * 1_000_000_000).unwrap().unwrap();

    assert_eq!(sealed.frame_count, 10);
    assert_eq!(batches.lock().unwrap().len(), 1);
    assert!(batcher.tick(BASE_NS + 200 * 1_000_000_000).is_none());
    assert!(batcher.seal().is_none());
}
