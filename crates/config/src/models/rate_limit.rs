use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

/// 限流算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
    Adaptive,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitStrategy::FixedWindow => "fixed_window",
            RateLimitStrategy::SlidingWindow => "sliding_window",
            RateLimitStrategy::TokenBucket => "token_bucket",
            RateLimitStrategy::LeakyBucket => "leaky_bucket",
            RateLimitStrategy::Adaptive => "adaptive",
        }
    }
}

impl std::fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 自适应限流的负载阈值与缩放系数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    /// CPU负载高于该值时收紧配额
    pub high_load_threshold: f64,
    /// CPU负载低于该值时放宽配额
    pub low_load_threshold: f64,
    /// 错误率高于该值时收紧配额
    pub high_error_rate: f64,
    pub low_error_rate: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            high_load_threshold: 0.8,
            low_load_threshold: 0.3,
            high_error_rate: 0.1,
            low_error_rate: 0.01,
            min_factor: 0.5,
            max_factor: 1.5,
        }
    }
}

/// 命名限流配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 加载时由所在的映射键填充
    #[serde(default)]
    pub name: String,
    pub max_requests: u64,
    pub window_seconds: u64,
    pub strategy: RateLimitStrategy,
    /// 桶容量；未配置时等于max_requests
    #[serde(default)]
    pub burst_size: Option<u64>,
    #[serde(default = "default_cost")]
    pub cost_per_request: u64,
    /// 违规后的封禁时长（秒）
    #[serde(default)]
    pub penalty_duration: Option<u64>,
    #[serde(default)]
    pub whitelist: BTreeSet<String>,
    #[serde(default)]
    pub blacklist: BTreeSet<String>,
    #[serde(default)]
    pub adaptive: AdaptiveSettings,
}

fn default_cost() -> u64 {
    1
}

impl RateLimitConfig {
    pub fn new(
        name: impl Into<String>,
        strategy: RateLimitStrategy,
        max_requests: u64,
        window_seconds: u64,
    ) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window_seconds,
            strategy,
            burst_size: None,
            cost_per_request: 1,
            penalty_duration: None,
            whitelist: BTreeSet::new(),
            blacklist: BTreeSet::new(),
            adaptive: AdaptiveSettings::default(),
        }
    }

    pub fn with_burst(mut self, burst_size: u64) -> Self {
        self.burst_size = Some(burst_size);
        self
    }

    pub fn with_penalty(mut self, seconds: u64) -> Self {
        self.penalty_duration = Some(seconds);
        self
    }

    pub fn effective_burst(&self) -> u64 {
        self.burst_size.unwrap_or(self.max_requests)
    }

    /// 每秒补充（或漏出）的配额
    pub fn refill_rate(&self) -> f64 {
        self.max_requests as f64 / self.window_seconds as f64
    }

    pub fn default_configs() -> BTreeMap<String, RateLimitConfig> {
        let configs = vec![
            Self::new("api", RateLimitStrategy::SlidingWindow, 100, 60),
            Self::new("auth", RateLimitStrategy::FixedWindow, 5, 300).with_penalty(900),
            Self::new("ai_assistant", RateLimitStrategy::TokenBucket, 20, 60).with_burst(30),
            Self::new("webhooks", RateLimitStrategy::LeakyBucket, 50, 60).with_burst(100),
            Self::new("scraping", RateLimitStrategy::Adaptive, 30, 60),
            Self::new("management_api", RateLimitStrategy::SlidingWindow, 600, 60),
        ];
        configs
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect()
    }
}

impl ConfigValidator for RateLimitConfig {
    fn validate(&self) -> ConfigResult<()> {
        let field = |f: &str| format!("rate_limits.{}.{}", self.name, f);

        ValidationUtils::validate_positive(self.max_requests, &field("max_requests"))?;
        ValidationUtils::validate_positive(self.window_seconds, &field("window_seconds"))?;
        ValidationUtils::validate_positive(self.cost_per_request, &field("cost_per_request"))?;
        if let Some(burst) = self.burst_size {
            ValidationUtils::validate_positive(burst, &field("burst_size"))?;
        }
        if self.cost_per_request > self.effective_burst().max(self.max_requests) {
            return Err(ConfigError::Validation(format!(
                "{} exceeds capacity, no request could ever be admitted",
                field("cost_per_request")
            )));
        }
        if let Some(overlap) = self.whitelist.intersection(&self.blacklist).next() {
            return Err(ConfigError::Validation(format!(
                "{overlap} is both whitelisted and blacklisted in rate_limits.{}",
                self.name
            )));
        }
        if self.strategy == RateLimitStrategy::Adaptive {
            let a = &self.adaptive;
            ValidationUtils::validate_ratio(a.high_load_threshold, &field("adaptive.high_load_threshold"))?;
            ValidationUtils::validate_ratio(a.low_load_threshold, &field("adaptive.low_load_threshold"))?;
            if a.low_load_threshold >= a.high_load_threshold {
                return Err(ConfigError::Validation(format!(
                    "{} must be below high_load_threshold",
                    field("adaptive.low_load_threshold")
                )));
            }
            if !(a.min_factor > 0.0 && a.min_factor <= 1.0 && a.max_factor >= 1.0) {
                return Err(ConfigError::Validation(format!(
                    "{} requires 0 < min_factor <= 1 <= max_factor",
                    field("adaptive")
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        let configs = RateLimitConfig::default_configs();
        assert_eq!(configs["api"].strategy, RateLimitStrategy::SlidingWindow);
        assert_eq!(configs["auth"].penalty_duration, Some(900));
        assert_eq!(configs["ai_assistant"].effective_burst(), 30);
        for config in configs.values() {
            assert!(config.validate().is_ok(), "{} should be valid", config.name);
        }
    }

    #[test]
    fn test_refill_rate() {
        let config = RateLimitConfig::new("t", RateLimitStrategy::TokenBucket, 60, 60);
        assert!((config.refill_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_overlapping_lists_rejected() {
        let mut config = RateLimitConfig::new("t", RateLimitStrategy::FixedWindow, 5, 60);
        config.whitelist.insert("10.0.0.1".to_string());
        config.blacklist.insert("10.0.0.1".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_deserializes_snake_case() {
        let strategy: RateLimitStrategy = serde_json::from_str("\"leaky_bucket\"").unwrap();
        assert_eq!(strategy, RateLimitStrategy::LeakyBucket);
        assert_eq!(strategy.to_string(), "leaky_bucket");
    }
}
