//! 领域实体

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::value_objects::{AlertSeverity, TaskPriority, TaskStatus};

/// 入队请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    /// 未指定时使用死信队列的默认值
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::Normal,
            max_retries: None,
            idempotency_key: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// 一个离散的后台工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    /// 入队时注入的W3C追踪载体，处理时据此续接链路
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_request(request: NewTask, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: request.task_type,
            payload: request.payload,
            priority: request.priority,
            status: TaskStatus::Pending,
            attempts: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            last_error: None,
            idempotency_key: request.idempotency_key,
            trace_id: None,
            trace_context: HashMap::new(),
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            completed_at: None,
        }
    }

    /// 已失败的尝试中，除首次外的次数未超过max_retries时仍可重试
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// 从死信记录恢复任务，用于任务记录已过期的情况
    pub fn from_dlq_entry(entry: &DlqEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: entry.task_id.clone(),
            task_type: entry.task_type.clone(),
            payload: entry.payload.clone(),
            priority: entry.priority,
            status: TaskStatus::DeadLettered,
            attempts: entry.attempts,
            max_retries: entry.attempts.saturating_sub(1),
            last_error: Some(entry.last_error.clone()),
            idempotency_key: None,
            trace_id: entry.trace_id.clone(),
            trace_context: HashMap::new(),
            created_at: entry.original_created_at,
            updated_at: now,
            next_retry_at: None,
            completed_at: None,
        }
    }
}

/// 死信条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub task_id: String,
    pub task_type: String,
    pub payload: Value,
    pub priority: TaskPriority,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
    pub trace_id: Option<String>,
    pub original_created_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn from_task(task: &Task, failed_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            failed_at,
            attempts: task.attempts,
            last_error: task
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            trace_id: task.trace_id.clone(),
            original_created_at: task.created_at,
        }
    }
}

/// 死信队列统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqStats {
    pub by_priority: BTreeMap<String, u64>,
    pub total: u64,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub newest_failure: Option<DateTime<Utc>>,
}

/// 死信检索条件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqSearchFilter {
    #[serde(default)]
    pub task_type: Option<String>,
    /// 大小写不敏感的子串匹配
    #[serde(default)]
    pub error_contains: Option<String>,
    #[serde(default)]
    pub failed_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    100
}

impl Default for DlqSearchFilter {
    fn default() -> Self {
        Self {
            task_type: None,
            error_contains: None,
            failed_after: None,
            failed_before: None,
            priority: None,
            limit: default_search_limit(),
        }
    }
}

impl DlqSearchFilter {
    pub fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(task_type) = &self.task_type {
            if &entry.task_type != task_type {
                return false;
            }
        }
        if let Some(needle) = &self.error_contains {
            if !entry
                .last_error
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(after) = self.failed_after {
            if entry.failed_at < after {
                return false;
            }
        }
        if let Some(before) = self.failed_before {
            if entry.failed_at > before {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if entry.priority != priority {
                return false;
            }
        }
        true
    }
}

pub mod alert_types {
    pub const TASK_DEAD_LETTERED: &str = "task_dead_lettered";
    pub const DLQ_THRESHOLD_EXCEEDED: &str = "dlq_threshold_exceeded";
    pub const CIRCUIT_OPENED: &str = "circuit_opened";
}

/// 告警
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    /// 节流维度：任务类型或熔断器名
    pub source: String,
    pub message: String,
    pub payload: Value,
    pub trace_id: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: impl Into<String>,
        severity: AlertSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type: alert_type.into(),
            severity,
            source: source.into(),
            message: message.into(),
            payload: Value::Null,
            trace_id: None,
            host: None,
            timestamp,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub fn task_dead_lettered(entry: &DlqEntry) -> Self {
        Alert::new(
            alert_types::TASK_DEAD_LETTERED,
            AlertSeverity::High,
            entry.task_type.clone(),
            format!(
                "任务 {} ({}) 在{}次尝试后进入死信队列: {}",
                entry.task_id, entry.task_type, entry.attempts, entry.last_error
            ),
            entry.failed_at,
        )
        .with_payload(serde_json::json!({
            "task_id": entry.task_id,
            "task_type": entry.task_type,
            "priority": entry.priority,
            "attempts": entry.attempts,
            "last_error": entry.last_error,
        }))
        .with_trace_id(entry.trace_id.clone())
    }

    /// 节流键：同一告警类型与来源共享一个窗口
    pub fn throttle_key(&self) -> String {
        format!("{}:{}", self.alert_type, self.source)
    }
}
