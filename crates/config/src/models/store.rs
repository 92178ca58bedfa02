use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// 进程内存储，仅适用于单实例部署与测试
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    /// 所有键的公共前缀，便于多个部署共享一个Redis
    pub key_prefix: String,
    pub connection_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "bulwark:".to_string(),
            connection_timeout_seconds: 5,
        }
    }
}

impl ConfigValidator for StoreConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.backend == StoreBackend::Redis {
            ValidationUtils::validate_url(&self.url, &["redis", "rediss"], "store.url")?;
        }
        if self.key_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::Validation(
                "store.key_prefix must not contain whitespace".to_string(),
            ));
        }
        ValidationUtils::validate_positive(
            self.connection_timeout_seconds,
            "store.connection_timeout_seconds",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_skips_url_check() {
        let config = StoreConfig {
            url: "garbage".to_string(),
            ..StoreConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_backend_requires_redis_url() {
        let mut config = StoreConfig {
            backend: StoreBackend::Redis,
            ..StoreConfig::default()
        };
        assert!(config.validate().is_ok());

        config.url = "http://localhost:6379".to_string();
        assert!(config.validate().is_err());
    }
}
