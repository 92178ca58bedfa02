//! 领域事件
//!
//! 通过存储的发布/订阅通道传播，供监控与外部消费者使用。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::Task;
use crate::value_objects::{CircuitState, TaskPriority};

/// 事件通道名
pub mod channels {
    pub const CIRCUIT_BREAKER_EVENTS: &str = "circuit_breaker_events";
    pub const DLQ_ALERTS: &str = "dlq_alerts";
    pub const ALERTS: &str = "alerts";
    pub const TASK_EVENTS: &str = "task_events";
}

/// 熔断器状态变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub breaker: String,
    pub old_state: CircuitState,
    pub new_state: CircuitState,
    pub fail_counter: u32,
    pub success_counter: u32,
    #[serde(default)]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskEnqueued,
    TaskCompleted,
    TaskRetryScheduled,
    TaskDeadLettered,
    TaskRequeued,
}

/// 任务生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: TaskEventKind,
    pub task_id: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub attempts: u32,
    pub error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn from_task(event: TaskEventKind, task: &Task, timestamp: DateTime<Utc>) -> Self {
        Self {
            event,
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
            attempts: task.attempts,
            error: task.last_error.clone(),
            next_retry_at: task.next_retry_at,
            trace_id: task.trace_id.clone(),
            timestamp,
        }
    }
}
