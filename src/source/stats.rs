use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Counters maintained by a frame source and read by the health monitor.
///
/// Writers are the capture thread only; readers take snapshots without
/// blocking capture for longer than one bucket update.
#[derive(Debug)]
pub struct SourceStats {
    frames: AtomicU64,
    bus_errors: AtomicU64,
    read_errors: AtomicU64,
    reconnects: AtomicU64,
    connected: AtomicBool,
    rate: Mutex<RateWindow>,
}

/// Shared reference to a source's counters
pub type SharedSourceStats = Arc<SourceStats>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStatsSnapshot {
    pub frames: u64,
    pub bus_errors: u64,
    pub read_errors: u64,
    pub reconnects: u64,
    pub connected: bool,
    pub frames_per_sec: f64,
}

impl SourceStats {
    pub fn new(fps_window: Duration) -> Self {
        Self {
            frames: AtomicU64::new(0),
            bus_errors: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            rate: Mutex::new(RateWindow::new(fps_window)),
        }
    }

    pub fn shared(fps_window: Duration) -> SharedSourceStats {
        Arc::new(Self::new(fps_window))
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut rate) = self.rate.lock() {
            rate.record(Instant::now());
        }
    }

    pub fn record_bus_error(&self) {
        self.bus_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SourceStatsSnapshot {
        let frames_per_sec = self
            .rate
            .lock()
            .map(|rate| rate.per_second(Instant::now()))
            .unwrap_or(0.0);

        SourceStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            frames_per_sec,
        }
    }
}

/// Rolling frame rate over a fixed window, bucketed per second so the cost
/// stays constant at high frame rates.
#[derive(Debug)]
struct RateWindow {
    origin: Instant,
    window_secs: u64,
    buckets: VecDeque<(u64, u64)>,
}

impl RateWindow {
    fn new(window: Duration) -> Self {
        Self {
            origin: Instant::now(),
            window_secs: window.as_secs().max(1),
            buckets: VecDeque::new(),
        }
    }

    fn second_of(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_secs()
    }

    fn record(&mut self, at: Instant) {
        let second = self.second_of(at);
        self.record_at(second);
    }

    fn record_at(&mut self, second: u64) {
        match self.buckets.back_mut() {
            Some((s, count)) if *s == second => *count += 1,
            _ => self.buckets.push_back((second, 1)),
        }
        self.prune(second);
    }

    fn prune(&mut self, now_second: u64) {
        while let Some((s, _)) = self.buckets.front() {
            if !self.in_window(*s, now_second) {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_window(&self, second: u64, now_second: u64) -> bool {
        second + self.window_secs > now_second
    }

    fn per_second(&self, at: Instant) -> f64 {
        self.per_second_at(self.second_of(at))
    }

    fn per_second_at(&self, now_second: u64) -> f64 {
        let recent: u64 = self
            .buckets
            .iter()
            .filter(|(s, _)| self.in_window(*s, now_second))
            .map(|(_, c)| *c)
            .sum();
        recent as f64 / self.window_secs as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = SourceStats::new(Duration::from_secs(10));
        stats.record_frame();
        stats.record_frame();
        stats.record_bus_error();
        stats.record_read_error();
        stats.record_reconnect();
        stats.set_connected(true);

        let snap = stats.snapshot();
        assert_eq!(snap.frames, 2);
        assert_eq!(snap.bus_errors, 1);
        assert_eq!(snap.read_errors, 1);
        assert_eq!(snap.reconnects, 1);
        assert!(snap.connected);
        assert!(snap.frames_per_sec > 0.0);
    }

    #[test]
    fn test_rate_window_averages_over_window() {
        let mut window = RateWindow::new(Duration::from_secs(10));
        for second in 20..30 {
            for _ in 0..100 {
                window.record_at(second);
            }
        }
        assert_eq!(window.per_second_at(29), 100.0);
    }

    #[test]
    fn test_rate_window_drops_stale_buckets() {
        let mut window = RateWindow::new(Duration::from_secs(10));
        for _ in 0..500 {
            window.record_at(12);
        }
        // 30s later nothing inside the window
        assert_eq!(window.per_second_at(42), 0.0);

        window.record_at(42);
        assert_eq!(window.buckets.len(), 1);
    }
}
