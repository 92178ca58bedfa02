use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    dead_letter::DeadLetterConfig,
    monitor::MonitorConfig,
    rate_limit::RateLimitConfig,
    store::StoreConfig,
};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::validation::ConfigValidator;
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    pub dead_letter: DeadLetterConfig,
    pub monitor: MonitorConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            circuit_breakers: CircuitBreakerConfig::default_breakers()
                .into_iter()
                .map(|(name, config)| (name.to_string(), config))
                .collect(),
            rate_limits: RateLimitConfig::default_configs(),
            dead_letter: DeadLetterConfig::default(),
            monitor: MonitorConfig::default(),
            api: ApiConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 加载顺序：内置默认值 < 配置文件 < `BULWARK_` 环境变量
    ///
    /// 环境变量以双下划线分隔层级，例如 `BULWARK_STORE__URL`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/bulwark.toml",
                "bulwark.toml",
                "/etc/bulwark/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("BULWARK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.normalize();
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 限流配置的名称以映射键为准
    fn normalize(&mut self) {
        for (name, config) in self.rate_limits.iter_mut() {
            config.name = name.clone();
        }
    }

    pub fn breaker(&self, name: &str) -> Option<&CircuitBreakerConfig> {
        self.circuit_breakers.get(name)
    }

    pub fn rate_limit(&self, name: &str) -> Option<&RateLimitConfig> {
        self.rate_limits.get(name)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.store.validate()?;
        for (name, breaker) in &self.circuit_breakers {
            breaker.validate().map_err(|e| {
                ConfigError::Validation(format!("circuit_breakers.{name}: {e}"))
            })?;
        }
        for config in self.rate_limits.values() {
            config.validate()?;
        }
        if let Some(name) = &self.api.rate_limit_config {
            if !self.rate_limits.contains_key(name) {
                return Err(ConfigError::Validation(format!(
                    "api.rate_limit_config references unknown rate limit {name}"
                )));
            }
        }
        self.dead_letter.validate()?;
        self.monitor.validate()?;
        self.api.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
