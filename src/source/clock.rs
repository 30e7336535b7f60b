use chrono::Utc;
use std::time::Instant;

/// Monotonic capture clock aligned to the calendar.
///
/// The wall clock is sampled once at construction; afterwards time advances
/// only with [`Instant`], so NTP steps or RTC corrections on the vehicle never
/// move timestamps backwards inside a session.
#[derive(Debug, Clone, Copy)]
pub struct CaptureClock {
    wall_anchor_ns: i64,
    started: Instant,
}

impl CaptureClock {
    pub fn new() -> Self {
        let wall_anchor_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self::anchored_at(wall_anchor_ns)
    }

    /// Clock whose first reading is `wall_anchor_ns`.
    pub fn anchored_at(wall_anchor_ns: i64) -> Self {
        Self {
            wall_anchor_ns,
            started: Instant::now(),
        }
    }

    /// Current capture instant in UNIX nanoseconds.
    pub fn now_ns(&self) -> i64 {
        let elapsed = self.started.elapsed().as_nanos();
        self.wall_anchor_ns
            .saturating_add(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }
}

impl Default for CaptureClock {
    fn default() -> Self {
        Self::new()
    }
}
