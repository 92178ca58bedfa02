use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bulwark_domain::Clock;

/// 2023-11-14T22:13:20Z
pub const DEFAULT_START_MILLIS: i64 = 1_700_000_000_000;

/// 手动推进的时钟
///
/// 熔断超时、限流窗口、TTL和重试截止时间在测试中无需真实等待。
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at_millis(DEFAULT_START_MILLIS)
    }

    pub fn starting_at_millis(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, seconds: u64) {
        self.advance(Duration::from_secs(seconds));
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        self.millis
            .store(instant.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_default()
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_moves_both_views() {
        let clock = ManualClock::new();
        let before = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_millis(), DEFAULT_START_MILLIS + 1500);
        assert_eq!((clock.now() - before).num_milliseconds(), 1500);
    }

    #[test]
    fn test_set() {
        let clock = ManualClock::new();
        let target = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
