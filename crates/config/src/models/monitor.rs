use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

/// 邮件告警渠道，仅支持明文SMTP（无TLS、无认证），应指向可信的内网中继
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailChannelConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub from: String,
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatWebhookChannelConfig {
    pub url: String,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// 告警通道；未配置的通道不启用
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub log: bool,
    #[serde(default)]
    pub email: Option<EmailChannelConfig>,
    #[serde(default)]
    pub chat_webhook: Option<ChatWebhookChannelConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookChannelConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            log: true,
            email: None,
            chat_webhook: None,
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// 同一任务类型的告警在该窗口内只发送一次
    pub throttle_window_seconds: u64,
    pub health_check_interval_seconds: u64,
    pub dlq_alert_threshold: u64,
    pub health_warning_threshold: u64,
    pub health_unhealthy_threshold: u64,
    pub channel_timeout_seconds: u64,
    pub recent_alerts_limit: u64,
    pub channels: ChannelsConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            throttle_window_seconds: 300,
            health_check_interval_seconds: 300,
            dlq_alert_threshold: 100,
            health_warning_threshold: 100,
            health_unhealthy_threshold: 1000,
            channel_timeout_seconds: 10,
            recent_alerts_limit: 100,
            channels: ChannelsConfig::default(),
        }
    }
}

impl ConfigValidator for MonitorConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_positive(
            self.throttle_window_seconds,
            "monitor.throttle_window_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.health_check_interval_seconds,
            "monitor.health_check_interval_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.channel_timeout_seconds,
            "monitor.channel_timeout_seconds",
        )?;
        if self.health_warning_threshold >= self.health_unhealthy_threshold {
            return Err(ConfigError::Validation(
                "monitor.health_warning_threshold must be below health_unhealthy_threshold"
                    .to_string(),
            ));
        }
        self.channels.validate()
    }
}

impl ConfigValidator for ChannelsConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(email) = &self.email {
            ValidationUtils::validate_not_empty(&email.smtp_host, "monitor.channels.email.smtp_host")?;
            ValidationUtils::validate_not_empty(&email.from, "monitor.channels.email.from")?;
            if email.to.is_empty() {
                return Err(ConfigError::Validation(
                    "monitor.channels.email.to cannot be empty".to_string(),
                ));
            }
        }
        if let Some(chat) = &self.chat_webhook {
            ValidationUtils::validate_url(
                &chat.url,
                &["http", "https"],
                "monitor.channels.chat_webhook.url",
            )?;
        }
        if let Some(webhook) = &self.webhook {
            ValidationUtils::validate_url(
                &webhook.url,
                &["http", "https"],
                "monitor.channels.webhook.url",
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.throttle_window_seconds, 300);
        assert!(config.channels.log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_ordering() {
        let config = MonitorConfig {
            health_warning_threshold: 500,
            health_unhealthy_threshold: 100,
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_webhook_url() {
        let mut config = MonitorConfig::default();
        config.channels.webhook = Some(WebhookChannelConfig {
            url: "ftp://alerts.internal".to_string(),
            headers: BTreeMap::new(),
        });
        assert!(config.validate().is_err());
    }
}
