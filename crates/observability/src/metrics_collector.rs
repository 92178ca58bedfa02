use anyhow::Result;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use bulwark_domain::{CircuitState, TaskPriority};

pub mod names {
    pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";
    pub const CIRCUIT_BREAKER_FAILURES: &str = "circuit_breaker_failures_total";
    pub const CIRCUIT_BREAKER_REJECTIONS: &str = "circuit_breaker_rejections_total";
    pub const CIRCUIT_BREAKER_CALLS: &str = "circuit_breaker_calls_total";

    pub const RATE_LIMIT_CHECKS: &str = "rate_limit_checks_total";
    pub const RATE_LIMIT_ALLOWED: &str = "rate_limit_allowed_total";
    pub const RATE_LIMIT_DENIED: &str = "rate_limit_denied_total";

    pub const TASKS_ENQUEUED: &str = "tasks_enqueued_total";
    pub const TASKS_COMPLETED: &str = "tasks_completed_total";
    pub const TASKS_RETRIED: &str = "tasks_retry_scheduled_total";
    pub const TASKS_DEAD_LETTERED: &str = "tasks_dead_lettered_total";
    pub const DLQ_ITEMS: &str = "dlq_items";

    pub const ALERTS_SENT: &str = "alerts_sent_total";
    pub const ALERTS_THROTTLED: &str = "alerts_throttled_total";
    pub const ALERT_CHANNEL_FAILURES: &str = "alert_channel_failures_total";
}

/// Prometheus文本导出
///
/// `install`注册全局recorder；`detached`只构造recorder而不注册，供测试和重复初始化时使用。
#[derive(Clone)]
pub struct MetricsExporter {
    handle: PrometheusHandle,
}

impl MetricsExporter {
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;
        info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter").finish_non_exhaustive()
    }
}

/// 各组件共用的指标记录入口
pub struct BulwarkMetrics;

impl BulwarkMetrics {
    pub fn breaker_state(breaker: &str, state: CircuitState) {
        gauge!(names::CIRCUIT_BREAKER_STATE, "breaker" => breaker.to_string()).set(state.as_gauge());
    }

    pub fn breaker_call(breaker: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            names::CIRCUIT_BREAKER_CALLS,
            "breaker" => breaker.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        if !success {
            counter!(names::CIRCUIT_BREAKER_FAILURES, "breaker" => breaker.to_string()).increment(1);
        }
    }

    pub fn breaker_rejection(breaker: &str) {
        counter!(names::CIRCUIT_BREAKER_REJECTIONS, "breaker" => breaker.to_string()).increment(1);
    }

    pub fn rate_limit_check(config: &str, allowed: bool) {
        counter!(names::RATE_LIMIT_CHECKS, "config" => config.to_string()).increment(1);
        if allowed {
            counter!(names::RATE_LIMIT_ALLOWED, "config" => config.to_string()).increment(1);
        } else {
            counter!(names::RATE_LIMIT_DENIED, "config" => config.to_string()).increment(1);
        }
    }

    pub fn task_enqueued(task_type: &str, priority: TaskPriority) {
        counter!(
            names::TASKS_ENQUEUED,
            "task_type" => task_type.to_string(),
            "priority" => priority.as_str()
        )
        .increment(1);
    }

    pub fn task_completed(task_type: &str) {
        counter!(names::TASKS_COMPLETED, "task_type" => task_type.to_string()).increment(1);
    }

    pub fn task_retry_scheduled(task_type: &str) {
        counter!(names::TASKS_RETRIED, "task_type" => task_type.to_string()).increment(1);
    }

    pub fn task_dead_lettered(task_type: &str, priority: TaskPriority) {
        counter!(
            names::TASKS_DEAD_LETTERED,
            "task_type" => task_type.to_string(),
            "priority" => priority.as_str()
        )
        .increment(1);
    }

    pub fn dlq_depth(priority: TaskPriority, depth: u64) {
        gauge!(names::DLQ_ITEMS, "priority" => priority.as_str()).set(depth as f64);
    }

    pub fn alert_sent(channel: &str) {
        counter!(names::ALERTS_SENT, "channel" => channel.to_string()).increment(1);
    }

    pub fn alert_channel_failed(channel: &str) {
        counter!(names::ALERT_CHANNEL_FAILURES, "channel" => channel.to_string()).increment(1);
    }

    pub fn alert_throttled(alert_type: &str) {
        counter!(names::ALERTS_THROTTLED, "alert_type" => alert_type.to_string()).increment(1);
    }
}
