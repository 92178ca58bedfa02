use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use bulwark_core::Fallback;
use bulwark_domain::{NewTask, TaskPriority};
use bulwark_errors::BulwarkResult;

use crate::dead_letter_queue::DeadLetterQueue;

/// 熔断期间把调用转成异步任务，稍后由worker补做
///
/// 降级结果为`{"status": "queued", "task_id": ...}`。
pub struct EnqueueForRetryFallback {
    queue: Arc<DeadLetterQueue>,
    task_type: String,
    priority: TaskPriority,
}

impl EnqueueForRetryFallback {
    pub fn new(queue: Arc<DeadLetterQueue>, task_type: impl Into<String>) -> Self {
        Self {
            queue,
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Fallback for EnqueueForRetryFallback {
    async fn fallback(&self, service: &str, args: &Value) -> BulwarkResult<Option<Value>> {
        let request = NewTask::new(
            self.task_type.clone(),
            json!({ "service": service, "args": args }),
        )
        .with_priority(self.priority);
        let task_id = self.queue.enqueue(request).await?;
        Ok(Some(json!({ "status": "queued", "task_id": task_id })))
    }
}
