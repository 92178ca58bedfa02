//! 告警监控
//!
//! 订阅死信告警、通用告警和熔断事件，经节流后并发分发到所有告警通道；
//! 周期性巡检死信队列深度，超过阈值时发出告警。

use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use bulwark_config::MonitorConfig;
use bulwark_domain::{
    alert_types, channels, Alert, AlertSeverity, BreakerEvent, CircuitState, Clock, EventStream,
    Store, StoreMessage,
};
use bulwark_errors::{BulwarkError, BulwarkResult};
use bulwark_observability::{
    host_name, BulwarkMetrics, NotificationChannel, StructuredLogger, TraceContext,
};
use bulwark_queue::DeadLetterQueue;

use crate::health::{DlqHealthReport, HealthStatus, HealthThresholds};
use crate::stats::{AlertStats, AlertStatsSnapshot};

/// 最近告警列表
pub const RECENT_ALERTS_KEY: &str = "alerts:recent";

fn throttle_key(alert: &Alert) -> String {
    format!("alert:throttle:{}", alert.throttle_key())
}

/// 单条告警的分发结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    pub alert_id: String,
    pub throttled: bool,
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

pub struct AlertMonitor {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    queue: Arc<DeadLetterQueue>,
    config: MonitorConfig,
    channels: Vec<Arc<dyn NotificationChannel>>,
    stats: AlertStats,
    host: Option<String>,
}

impl AlertMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        queue: Arc<DeadLetterQueue>,
        config: MonitorConfig,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            store,
            clock,
            queue,
            config,
            channels,
            stats: AlertStats::new(),
            host: host_name(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn stats(&self) -> AlertStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// 节流后分发告警
    ///
    /// 同一告警类型与来源在节流窗口内只发送一次，窗口由共享存储中的键实现，所有实例共用。
    pub async fn handle_alert(&self, alert: &Alert) -> BulwarkResult<DispatchReport> {
        let span = TraceContext::span(
            "alert.dispatch",
            &[
                ("alert.type", alert.alert_type.clone()),
                ("alert.source", alert.source.clone()),
            ],
        );

        let result: BulwarkResult<DispatchReport> = async {
            let window = Duration::from_secs(self.config.throttle_window_seconds);
            let acquired = self
                .store
                .set_nx(&throttle_key(alert), &alert.id, Some(window))
                .await?;
            if !acquired {
                self.stats.record_throttled();
                BulwarkMetrics::alert_throttled(&alert.alert_type);
                StructuredLogger::log_alert_throttled(alert);
                return Ok(DispatchReport {
                    alert_id: alert.id.clone(),
                    throttled: true,
                    ..Default::default()
                });
            }

            self.remember(alert).await;
            let report = self.dispatch(alert).await;
            if report.delivered.is_empty() && !report.failed.is_empty() {
                self.stats.record_failed();
            } else {
                self.stats.record_sent();
            }
            StructuredLogger::log_alert_dispatched(
                alert,
                report.delivered.len(),
                report.failed.len(),
            );
            Ok(report)
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            TraceContext::record_error(&span, e);
        }
        result
    }

    /// 并发发送到所有通道，每个通道单独超时，互不影响
    async fn dispatch(&self, alert: &Alert) -> DispatchReport {
        let limit = Duration::from_secs(self.config.channel_timeout_seconds);
        let sends = self.channels.iter().map(|channel| async move {
            let result = match timeout(limit, channel.send(alert)).await {
                Ok(result) => result,
                Err(_) => Err(BulwarkError::timeout_error(format!(
                    "告警通道 {} 在{}秒内未完成发送",
                    channel.name(),
                    limit.as_secs()
                ))),
            };
            (channel.name().to_string(), result)
        });

        let mut report = DispatchReport {
            alert_id: alert.id.clone(),
            ..Default::default()
        };
        for (name, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    BulwarkMetrics::alert_sent(&name);
                    self.stats.record_channel(&name, true);
                    report.delivered.push(name);
                }
                Err(e) => {
                    warn!(channel = %name, alert.id = %alert.id, error = %e, "告警发送失败");
                    BulwarkMetrics::alert_channel_failed(&name);
                    self.stats.record_channel(&name, false);
                    report.failed.push(name);
                }
            }
        }
        report
    }

    async fn remember(&self, alert: &Alert) {
        let limit = self.config.recent_alerts_limit.max(1) as i64;
        let result: BulwarkResult<()> = async {
            let raw = serde_json::to_string(alert)?;
            self.store.list_push(RECENT_ALERTS_KEY, &raw).await?;
            self.store.list_trim(RECENT_ALERTS_KEY, -limit, -1).await
        }
        .await;
        if let Err(e) = result {
            warn!(alert.id = %alert.id, error = %e, "记录最近告警失败");
        }
    }

    /// 最近的告警，新的在前
    pub async fn recent_alerts(&self, limit: usize) -> BulwarkResult<Vec<Alert>> {
        let raw = self.store.list_range(RECENT_ALERTS_KEY, 0, -1).await?;
        let mut alerts = Vec::with_capacity(raw.len().min(limit));
        for item in raw.iter().rev().take(limit) {
            match serde_json::from_str::<Alert>(item) {
                Ok(alert) => alerts.push(alert),
                Err(e) => warn!(error = %e, "忽略无法解析的告警记录"),
            }
        }
        Ok(alerts)
    }

    /// 处理订阅到的一条消息
    pub async fn handle_message(&self, message: StoreMessage) -> Option<DispatchReport> {
        let alert = match message.channel.as_str() {
            channels::DLQ_ALERTS | channels::ALERTS => {
                match serde_json::from_str::<Alert>(&message.payload) {
                    Ok(alert) => alert,
                    Err(e) => {
                        warn!(channel = %message.channel, error = %e, "无法解析告警消息");
                        return None;
                    }
                }
            }
            channels::CIRCUIT_BREAKER_EVENTS => {
                let event = match serde_json::from_str::<BreakerEvent>(&message.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "无法解析熔断事件");
                        return None;
                    }
                };
                self.circuit_opened_alert(&event)?
            }
            other => {
                debug!(channel = other, "忽略未知频道的消息");
                return None;
            }
        };

        match self.handle_alert(&alert).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(alert.id = %alert.id, error = %e, "处理告警失败");
                None
            }
        }
    }

    /// 只有转为打开状态的事件产生告警
    fn circuit_opened_alert(&self, event: &BreakerEvent) -> Option<Alert> {
        if event.new_state != CircuitState::Open {
            return None;
        }
        let alert = Alert::new(
            alert_types::CIRCUIT_OPENED,
            AlertSeverity::High,
            event.breaker.clone(),
            format!(
                "熔断器 {} 已打开（{} -> open，连续失败{}次）",
                event.breaker,
                event.old_state.as_str(),
                event.fail_counter
            ),
            event.timestamp,
        )
        .with_payload(json!(event))
        .with_host(event.source.clone().or_else(|| self.host.clone()));
        Some(alert)
    }

    /// 计算死信队列健康状况，不产生告警
    pub async fn health_report(&self) -> BulwarkResult<DlqHealthReport> {
        let dlq = self.queue.get_dlq_stats().await?;
        let queue_depths = self
            .queue
            .queue_depths()
            .await?
            .into_iter()
            .map(|(priority, depth)| (priority.as_str().to_string(), depth))
            .collect();
        let retry_pending = self.queue.retry_set_size().await?;
        let status = HealthStatus::from_total(
            dlq.total,
            self.config.health_warning_threshold,
            self.config.health_unhealthy_threshold,
        );
        Ok(DlqHealthReport {
            status,
            total_items: dlq.total,
            dlq,
            queue_depths,
            retry_pending,
            thresholds: HealthThresholds {
                warning: self.config.health_warning_threshold,
                unhealthy: self.config.health_unhealthy_threshold,
            },
            checked_at: self.clock.now(),
        })
    }

    /// 巡检一次，死信总数超过阈值时发出告警
    pub async fn run_health_check(&self) -> BulwarkResult<DlqHealthReport> {
        let report = self.health_report().await?;
        debug!(
            status = report.status.as_str(),
            total = report.total_items,
            retry_pending = report.retry_pending,
            "死信队列巡检完成"
        );
        if report.total_items > self.config.dlq_alert_threshold {
            let alert = Alert::new(
                alert_types::DLQ_THRESHOLD_EXCEEDED,
                AlertSeverity::Medium,
                "dlq",
                format!(
                    "死信队列共有{}条任务，超过阈值{}",
                    report.total_items, self.config.dlq_alert_threshold
                ),
                report.checked_at,
            )
            .with_payload(json!({
                "total": report.total_items,
                "threshold": self.config.dlq_alert_threshold,
                "by_priority": report.dlq.by_priority,
            }))
            .with_host(self.host.clone());
            self.handle_alert(&alert).await?;
        }
        Ok(report)
    }

    /// 订阅事件并定期巡检，直到收到停机信号
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let subscribed = [
            channels::DLQ_ALERTS.to_string(),
            channels::ALERTS.to_string(),
            channels::CIRCUIT_BREAKER_EVENTS.to_string(),
        ];
        let mut events = match self.store.subscribe(&subscribed).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!(error = %e, "订阅告警频道失败，仅执行定期巡检");
                None
            }
        };

        let mut ticker = interval(Duration::from_secs(self.config.health_check_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            channels = ?self.channel_names(),
            throttle_window_seconds = self.config.throttle_window_seconds,
            "告警监控启动"
        );

        loop {
            tokio::select! {
                message = next_message(&mut events) => match message {
                    Some(message) => {
                        self.handle_message(message).await;
                    }
                    None => {
                        warn!("告警订阅已结束");
                        events = None;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.run_health_check().await {
                        error!(error = %e, "死信队列巡检失败");
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停机信号，告警监控退出");
                    break;
                }
            }
        }
    }
}

async fn next_message(events: &mut Option<EventStream>) -> Option<StoreMessage> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_config::DeadLetterConfig;
    use bulwark_infrastructure::InMemoryStore;
    use bulwark_testing_utils::{FailingChannel, HangingChannel, ManualClock, RecordingChannel};

    struct Fixture {
        clock: Arc<ManualClock>,
        recorder: Arc<RecordingChannel>,
        monitor: AlertMonitor,
    }

    fn fixture(extra: Vec<Arc<dyn NotificationChannel>>) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(clock.clone()));
        let queue = Arc::new(DeadLetterQueue::new(
            store.clone(),
            clock.clone(),
            DeadLetterConfig::default(),
        ));
        let recorder = Arc::new(RecordingChannel::new("recorder"));
        let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![recorder.clone()];
        channels.extend(extra);
        let config = MonitorConfig {
            channel_timeout_seconds: 1,
            recent_alerts_limit: 3,
            ..MonitorConfig::default()
        };
        let monitor = AlertMonitor::new(store, clock.clone(), queue, config, channels);
        Fixture {
            clock,
            recorder,
            monitor,
        }
    }

    fn alert(fx: &Fixture, source: &str) -> Alert {
        Alert::new(
            alert_types::TASK_DEAD_LETTERED,
            AlertSeverity::High,
            source,
            "task failed",
            fx.clock.now(),
        )
    }

    #[tokio::test]
    async fn test_throttle_per_type_and_source() {
        let fx = fixture(vec![]);
        let first = fx.monitor.handle_alert(&alert(&fx, "sync_crm")).await.unwrap();
        assert!(!first.throttled);
        assert_eq!(first.delivered, vec!["recorder"]);

        let second = fx.monitor.handle_alert(&alert(&fx, "sync_crm")).await.unwrap();
        assert!(second.throttled);

        // 不同来源不共享窗口
        let other = fx.monitor.handle_alert(&alert(&fx, "send_email")).await.unwrap();
        assert!(!other.throttled);

        fx.clock.advance_secs(301);
        let later = fx.monitor.handle_alert(&alert(&fx, "sync_crm")).await.unwrap();
        assert!(!later.throttled);

        assert_eq!(fx.recorder.count(), 3);
        let stats = fx.monitor.stats();
        assert_eq!(stats.alerts_sent, 3);
        assert_eq!(stats.alerts_throttled, 1);
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let failing = Arc::new(FailingChannel::new());
        let hanging: Arc<dyn NotificationChannel> =
            Arc::new(HangingChannel::new(Duration::from_secs(5)));
        let fx = fixture(vec![failing.clone() as Arc<dyn NotificationChannel>, hanging]);

        let report = fx.monitor.handle_alert(&alert(&fx, "sync_crm")).await.unwrap();
        assert_eq!(report.delivered, vec!["recorder"]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(failing.attempts(), 1);
        assert_eq!(fx.recorder.count(), 1);

        let stats = fx.monitor.stats();
        assert_eq!(stats.channels["failing"].failed, 1);
        assert_eq!(stats.channels["recorder"].sent, 1);
    }

    #[tokio::test]
    async fn test_recent_alerts_are_capped() {
        let fx = fixture(vec![]);
        for source in ["a", "b", "c", "d"] {
            fx.monitor.handle_alert(&alert(&fx, source)).await.unwrap();
        }
        let recent = fx.monitor.recent_alerts(10).await.unwrap();
        let sources: Vec<&str> = recent.iter().map(|a| a.source.as_str()).collect();
        assert_eq!(sources, vec!["d", "c", "b"]);
    }

    #[tokio::test]
    async fn test_breaker_open_event_raises_alert() {
        let fx = fixture(vec![]);
        let event = BreakerEvent {
            breaker: "payments".to_string(),
            old_state: CircuitState::Closed,
            new_state: CircuitState::Open,
            fail_counter: 3,
            success_counter: 0,
            source: None,
            timestamp: fx.clock.now(),
        };
        let message = StoreMessage {
            channel: channels::CIRCUIT_BREAKER_EVENTS.to_string(),
            payload: serde_json::to_string(&event).unwrap(),
        };
        let report = fx.monitor.handle_message(message).await.unwrap();
        assert!(!report.throttled);

        let sent = fx.recorder.alerts();
        assert_eq!(sent[0].alert_type, alert_types::CIRCUIT_OPENED);
        assert_eq!(sent[0].source, "payments");

        let closed = BreakerEvent {
            old_state: CircuitState::HalfOpen,
            new_state: CircuitState::Closed,
            ..event
        };
        let message = StoreMessage {
            channel: channels::CIRCUIT_BREAKER_EVENTS.to_string(),
            payload: serde_json::to_string(&closed).unwrap(),
        };
        assert!(fx.monitor.handle_message(message).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let fx = fixture(vec![]);
        let message = StoreMessage {
            channel: channels::DLQ_ALERTS.to_string(),
            payload: "not json".to_string(),
        };
        assert!(fx.monitor.handle_message(message).await.is_none());
        assert_eq!(fx.recorder.count(), 0);
    }

    #[tokio::test]
    async fn test_healthy_queue_raises_nothing() {
        let fx = fixture(vec![]);
        let report = fx.monitor.run_health_check().await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.total_items, 0);
        assert_eq!(report.queue_depths["normal"], 0);
        assert_eq!(fx.recorder.count(), 0);
    }
}
