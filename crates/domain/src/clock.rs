use chrono::{DateTime, Utc};

/// 时间来源
///
/// 熔断超时、限流窗口、重试截止时间和TTL都以它为准，测试中可替换为手动时钟。
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_millis_match_now() {
        let clock = SystemClock::new();
        let before = Utc::now().timestamp_millis();
        let millis = clock.now_millis();
        assert!(millis >= before);
    }
}
