use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::validation::ConfigValidator;
use crate::{ConfigError, ConfigResult};

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// 单个下游依赖的熔断参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 连续失败达到该值时打开熔断器
    pub fail_max: u32,
    /// 打开后经过该时长进入半开状态
    #[serde(with = "duration_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(fail_max: u32, reset_timeout: Duration) -> Self {
        Self {
            fail_max,
            reset_timeout,
        }
    }

    /// 默认受保护的下游依赖
    pub fn default_breakers() -> Vec<(&'static str, CircuitBreakerConfig)> {
        vec![
            ("control_api", Self::new(5, Duration::from_secs(60))),
            ("analytics", Self::new(5, Duration::from_secs(60))),
            ("ai_assistant", Self::new(3, Duration::from_secs(120))),
            ("database", Self::new(5, Duration::from_secs(30))),
            ("task_queue", Self::new(10, Duration::from_secs(60))),
        ]
    }
}

impl ConfigValidator for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.fail_max == 0 {
            return Err(ConfigError::Validation(
                "fail_max must be greater than 0".to_string(),
            ));
        }

        if self.reset_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "reset_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.fail_max, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_circuit_breaker_config_validation() {
        let config = CircuitBreakerConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = config.clone();
        invalid_config.fail_max = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config;
        invalid_config.reset_timeout = Duration::ZERO;
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_reset_timeout_serialized_as_seconds() {
        let config = CircuitBreakerConfig::new(3, Duration::from_secs(45));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["reset_timeout"], 45);
    }

    #[test]
    fn test_default_breakers_cover_known_dependencies() {
        let names: Vec<_> = CircuitBreakerConfig::default_breakers()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec!["control_api", "analytics", "ai_assistant", "database", "task_queue"]
        );
    }
}
