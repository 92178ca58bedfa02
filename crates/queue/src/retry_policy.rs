use std::time::Duration;

use bulwark_config::DeadLetterConfig;

/// 失败后的退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: DeadLetterConfig,
}

impl RetryPolicy {
    pub fn new(config: DeadLetterConfig) -> Self {
        Self { config }
    }

    /// 第`attempts`次尝试失败后的延迟
    ///
    /// 配置了抖动比例时在基础延迟上叠加`±ratio`的随机偏移，避免大量任务同时到期。
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base = self.config.backoff_for(attempts);
        let ratio = self.config.jitter_ratio;
        if ratio <= 0.0 {
            return base;
        }
        let base_secs = base.as_secs_f64();
        let jitter = base_secs * ratio * (rand::random::<f64>() - 0.5) * 2.0;
        Duration::from_secs_f64((base_secs + jitter).max(0.0))
    }
}
