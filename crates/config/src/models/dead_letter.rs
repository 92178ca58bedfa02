use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

/// 死信队列与重试调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// 第n次失败后的重试延迟（秒），超出长度时取最后一项
    pub backoff_seconds: Vec<u64>,
    /// 在延迟上叠加的随机抖动比例，0表示不抖动
    pub jitter_ratio: f64,
    pub default_max_retries: u32,
    pub idempotency_ttl_seconds: u64,
    pub completed_ttl_seconds: u64,
    pub retention_days: u64,
    pub scheduler_poll_interval_ms: u64,
    pub scheduler_batch_size: usize,
    pub worker_concurrency: usize,
    pub worker_poll_interval_ms: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            backoff_seconds: vec![5, 30, 120, 300],
            jitter_ratio: 0.0,
            default_max_retries: 3,
            idempotency_ttl_seconds: 3600,
            completed_ttl_seconds: 3600,
            retention_days: 7,
            scheduler_poll_interval_ms: 1000,
            scheduler_batch_size: 100,
            worker_concurrency: 4,
            worker_poll_interval_ms: 500,
        }
    }
}

impl DeadLetterConfig {
    /// 第`attempts`次尝试失败后的基础延迟
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let last = self.backoff_seconds.len().saturating_sub(1);
        let index = (attempts.saturating_sub(1) as usize).min(last);
        Duration::from_secs(self.backoff_seconds.get(index).copied().unwrap_or(0))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }
}

impl ConfigValidator for DeadLetterConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.backoff_seconds.is_empty() {
            return Err(ConfigError::Validation(
                "dead_letter.backoff_seconds cannot be empty".to_string(),
            ));
        }
        ValidationUtils::validate_ratio(self.jitter_ratio, "dead_letter.jitter_ratio")?;
        ValidationUtils::validate_positive(
            self.idempotency_ttl_seconds,
            "dead_letter.idempotency_ttl_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.completed_ttl_seconds,
            "dead_letter.completed_ttl_seconds",
        )?;
        ValidationUtils::validate_positive(self.retention_days, "dead_letter.retention_days")?;
        ValidationUtils::validate_positive(
            self.scheduler_poll_interval_ms,
            "dead_letter.scheduler_poll_interval_ms",
        )?;
        ValidationUtils::validate_positive(
            self.scheduler_batch_size as u64,
            "dead_letter.scheduler_batch_size",
        )?;
        ValidationUtils::validate_positive(
            self.worker_concurrency as u64,
            "dead_letter.worker_concurrency",
        )?;
        ValidationUtils::validate_positive(
            self.worker_poll_interval_ms,
            "dead_letter.worker_poll_interval_ms",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let config = DeadLetterConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_secs(5));
        assert_eq!(config.backoff_for(2), Duration::from_secs(30));
        assert_eq!(config.backoff_for(4), Duration::from_secs(300));
        assert_eq!(config.backoff_for(9), Duration::from_secs(300));
    }

    #[test]
    fn test_empty_backoff_rejected() {
        let config = DeadLetterConfig {
            backoff_seconds: vec![],
            ..DeadLetterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention() {
        let config = DeadLetterConfig::default();
        assert_eq!(config.retention(), Duration::from_secs(7 * 24 * 3600));
    }
}
