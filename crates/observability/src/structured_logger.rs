use tracing::{error, info, warn};

use bulwark_domain::{Alert, CircuitState, DlqEntry, Task};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_enqueued(task: &Task) {
        info!(
            event = "task_enqueued",
            task.id = %task.id,
            task.type = %task.task_type,
            task.priority = task.priority.as_str(),
            task.max_retries = task.max_retries,
            trace_id = task.trace_id.as_deref().unwrap_or(""),
            "Task enqueued"
        );
    }

    pub fn log_duplicate_enqueue(idempotency_key: &str, existing_task_id: &str) {
        info!(
            event = "task_enqueue_deduplicated",
            task.id = existing_task_id,
            task.idempotency_key = idempotency_key,
            "Idempotency key already mapped, returning existing task"
        );
    }

    pub fn log_task_completed(task: &Task) {
        info!(
            event = "task_completed",
            task.id = %task.id,
            task.type = %task.task_type,
            task.attempts = task.attempts,
            "Task completed"
        );
    }

    pub fn log_task_retry(task: &Task, delay_secs: u64) {
        warn!(
            event = "task_retry_scheduled",
            task.id = %task.id,
            task.type = %task.task_type,
            task.attempts = task.attempts,
            task.max_retries = task.max_retries,
            task.retry_in_secs = delay_secs,
            task.error = task.last_error.as_deref().unwrap_or("unknown error"),
            "Task failed, retry scheduled"
        );
    }

    pub fn log_task_dead_lettered(entry: &DlqEntry) {
        error!(
            event = "task_dead_lettered",
            task.id = %entry.task_id,
            task.type = %entry.task_type,
            task.priority = entry.priority.as_str(),
            task.attempts = entry.attempts,
            task.error = %entry.last_error,
            "Task moved to dead letter queue"
        );
    }

    pub fn log_breaker_transition(breaker: &str, from: CircuitState, to: CircuitState, fail_counter: u32) {
        match to {
            CircuitState::Open => warn!(
                event = "circuit_breaker_transition",
                breaker = breaker,
                breaker.from = from.as_str(),
                breaker.to = to.as_str(),
                breaker.fail_counter = fail_counter,
                "Circuit breaker opened"
            ),
            _ => info!(
                event = "circuit_breaker_transition",
                breaker = breaker,
                breaker.from = from.as_str(),
                breaker.to = to.as_str(),
                breaker.fail_counter = fail_counter,
                "Circuit breaker state changed"
            ),
        }
    }

    pub fn log_rate_limited(identifier: &str, config: &str, retry_after_secs: u64) {
        warn!(
            event = "rate_limit_exceeded",
            rate_limit.identifier = identifier,
            rate_limit.config = config,
            rate_limit.retry_after_secs = retry_after_secs,
            "Rate limit exceeded"
        );
    }

    pub fn log_alert_dispatched(alert: &Alert, delivered: usize, failed: usize) {
        info!(
            event = "alert_dispatched",
            alert.id = %alert.id,
            alert.type = %alert.alert_type,
            alert.severity = alert.severity.as_str(),
            alert.source = %alert.source,
            alert.delivered = delivered,
            alert.failed = failed,
            "Alert dispatched to channels"
        );
    }

    pub fn log_alert_throttled(alert: &Alert) {
        info!(
            event = "alert_throttled",
            alert.type = %alert.alert_type,
            alert.source = %alert.source,
            "Alert suppressed within throttle window"
        );
    }
}
