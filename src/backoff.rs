use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Doubling retry delay with a ceiling.
///
/// Attempt numbers start at 1: `delay(1) == initial`, `delay(2) == 2 * initial`,
/// and so on until `max` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Bus reconnect schedule: 1s doubling to 30s.
    pub const fn reconnect_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::reconnect_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_ceiling() {
        let backoff = Backoff::reconnect_default();
        let delays: Vec<u64> = (1..=7).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_large_attempts_do_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(300));
        assert_eq!(backoff.delay(1_000), Duration::from_secs(300));
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }
}
