use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use bulwark_domain::DlqStats;

/// 死信队列健康状态，按条目总数分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

impl HealthStatus {
    /// 达到阈值即升级
    pub fn from_total(total: u64, warning_threshold: u64, unhealthy_threshold: u64) -> Self {
        if total >= unhealthy_threshold {
            HealthStatus::Unhealthy
        } else if total >= warning_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn is_available(&self) -> bool {
        *self != HealthStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub warning: u64,
    pub unhealthy: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqHealthReport {
    pub status: HealthStatus,
    pub total_items: u64,
    pub dlq: DlqStats,
    /// 各优先级主队列中等待处理的任务数
    pub queue_depths: BTreeMap<String, u64>,
    pub retry_pending: u64,
    pub thresholds: HealthThresholds,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_thresholds() {
        assert_eq!(HealthStatus::from_total(0, 100, 1000), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_total(99, 100, 1000), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_total(100, 100, 1000), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_total(1000, 100, 1000), HealthStatus::Unhealthy);
        assert!(HealthStatus::Warning.is_available());
        assert!(!HealthStatus::Unhealthy.is_available());
    }
}
