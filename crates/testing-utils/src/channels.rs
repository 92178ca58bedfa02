//! 告警通道替身

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bulwark_domain::Alert;
use bulwark_errors::{BulwarkError, BulwarkResult};
use bulwark_observability::NotificationChannel;

/// 记录收到的告警
#[derive(Debug)]
pub struct RecordingChannel {
    name: String,
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &Alert) -> BulwarkResult<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// 总是失败的通道
#[derive(Debug, Default)]
pub struct FailingChannel {
    attempts: AtomicUsize,
}

impl FailingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for FailingChannel {
    fn name(&self) -> &str {
        "failing"
    }

    async fn send(&self, _alert: &Alert) -> BulwarkResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BulwarkError::notification("failing", "simulated outage"))
    }
}

/// 发送前挂起指定时长，用于验证超时隔离
#[derive(Debug)]
pub struct HangingChannel {
    delay: Duration,
}

impl HangingChannel {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl NotificationChannel for HangingChannel {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn send(&self, _alert: &Alert) -> BulwarkResult<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
