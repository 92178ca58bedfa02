//! 测试数据构造器

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use bulwark_config::{AdaptiveSettings, RateLimitConfig, RateLimitStrategy};
use bulwark_domain::{Task, TaskPriority, TaskStatus};

use crate::clock::DEFAULT_START_MILLIS;

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        let created_at =
            DateTime::from_timestamp_millis(DEFAULT_START_MILLIS).unwrap_or_else(Utc::now);
        Self {
            task: Task {
                id: uuid::Uuid::new_v4().to_string(),
                task_type: "test_task".to_string(),
                payload: serde_json::json!({}),
                priority: TaskPriority::Normal,
                status: TaskStatus::Pending,
                attempts: 0,
                max_retries: 3,
                last_error: None,
                idempotency_key: None,
                trace_id: None,
                trace_context: HashMap::new(),
                created_at,
                updated_at: created_at,
                next_retry_at: None,
                completed_at: None,
            },
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.task.task_type = task_type.to_string();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.task.attempts = attempts;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_last_error(mut self, error: &str) -> Self {
        self.task.last_error = Some(error.to_string());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self.task.updated_at = created_at;
        self
    }

    pub fn dead_lettered(mut self) -> Self {
        self.task.status = TaskStatus::DeadLettered;
        self.task.attempts = self.task.max_retries + 1;
        if self.task.last_error.is_none() {
            self.task.last_error = Some("simulated failure".to_string());
        }
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for rate limit configurations used in tests
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: RateLimitConfig::new(name, RateLimitStrategy::SlidingWindow, 5, 60),
        }
    }

    pub fn strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn limit(mut self, max_requests: u64, window_seconds: u64) -> Self {
        self.config.max_requests = max_requests;
        self.config.window_seconds = window_seconds;
        self
    }

    pub fn burst(mut self, burst_size: u64) -> Self {
        self.config.burst_size = Some(burst_size);
        self
    }

    pub fn cost(mut self, cost_per_request: u64) -> Self {
        self.config.cost_per_request = cost_per_request;
        self
    }

    pub fn penalty(mut self, seconds: u64) -> Self {
        self.config.penalty_duration = Some(seconds);
        self
    }

    pub fn whitelist(mut self, identifiers: &[&str]) -> Self {
        self.config.whitelist = identifiers.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        self
    }

    pub fn blacklist(mut self, identifiers: &[&str]) -> Self {
        self.config.blacklist = identifiers.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        self
    }

    pub fn adaptive(mut self, settings: AdaptiveSettings) -> Self {
        self.config.strategy = RateLimitStrategy::Adaptive;
        self.config.adaptive = settings;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}
