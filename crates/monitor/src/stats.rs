use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub sent: u64,
    pub failed: u64,
}

/// 告警发送统计快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertStatsSnapshot {
    /// 至少送达一个通道的告警数
    pub alerts_sent: u64,
    pub alerts_throttled: u64,
    /// 所有通道都失败的告警数
    pub alerts_failed: u64,
    pub channels: BTreeMap<String, ChannelStats>,
}

/// 进程内计数器，同时以`metrics`导出
#[derive(Debug, Default)]
pub struct AlertStats {
    sent: AtomicU64,
    throttled: AtomicU64,
    failed: AtomicU64,
    channels: Mutex<BTreeMap<String, ChannelStats>>,
}

impl AlertStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel(&self, channel: &str, success: bool) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = channels.entry(channel.to_string()).or_default();
        if success {
            entry.sent += 1;
        } else {
            entry.failed += 1;
        }
    }

    pub fn snapshot(&self) -> AlertStatsSnapshot {
        AlertStatsSnapshot {
            alerts_sent: self.sent.load(Ordering::Relaxed),
            alerts_throttled: self.throttled.load(Ordering::Relaxed),
            alerts_failed: self.failed.load(Ordering::Relaxed),
            channels: self
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
