//! 死信队列任务引擎
//!
//! 任务记录、优先级主队列、到期重试集合与死信列表都保存在共享存储中。
//! 任务只由当前持有者修改：弹出它的worker，或领取它的重试调度器。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use bulwark_config::DeadLetterConfig;
use bulwark_domain::{
    channels, Alert, Clock, DlqEntry, DlqSearchFilter, DlqStats, NewTask, Store, Task,
    TaskEvent, TaskEventKind, TaskPriority, TaskStatus,
};
use bulwark_errors::{BulwarkError, BulwarkResult};
use bulwark_observability::{host_name, BulwarkMetrics, StructuredLogger, TraceContext};

use crate::keys;
use crate::processor::TaskProcessor;
use crate::retry_policy::RetryPolicy;

/// 分页的死信条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqPage {
    pub priority: TaskPriority,
    pub items: Vec<DlqEntry>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

/// 死信条目及其任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqTaskDetail {
    pub entry: DlqEntry,
    /// 任务记录可能已过期
    pub task: Option<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryFailure {
    pub task_id: String,
    pub error: String,
}

/// 批量重试结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryAllReport {
    pub requeued: Vec<String>,
    pub failed: Vec<RetryFailure>,
}

pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: DeadLetterConfig,
    policy: RetryPolicy,
    host: Option<String>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: DeadLetterConfig) -> Self {
        Self {
            store,
            clock,
            policy: RetryPolicy::new(config.clone()),
            config,
            host: host_name(),
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// 入队
    ///
    /// 带幂等键时，键在TTL内已映射到任务则直接返回已有任务ID，不会产生重复任务。
    pub async fn enqueue(&self, request: NewTask) -> BulwarkResult<String> {
        if request.task_type.trim().is_empty() {
            return Err(BulwarkError::validation_error("task_type不能为空"));
        }
        let span = TraceContext::span(
            "task.enqueue",
            &[
                ("task.type", request.task_type.clone()),
                ("task.priority", request.priority.as_str().to_string()),
            ],
        );

        let result: BulwarkResult<String> = async {
            let mut task =
                Task::from_request(request, self.config.default_max_retries, self.clock.now());
            task.trace_id = TraceContext::trace_id_of(&span);
            TraceContext::inject_from(&span, &mut task.trace_context);

            if let Some(key) = &task.idempotency_key {
                let idem_key = keys::idempotency(key);
                let ttl = Some(Duration::from_secs(self.config.idempotency_ttl_seconds));
                if !self.store.set_nx(&idem_key, &task.id, ttl).await? {
                    if let Some(existing) = self.store.get(&idem_key).await? {
                        StructuredLogger::log_duplicate_enqueue(key, &existing);
                        return Ok(existing);
                    }
                    // 映射在两次调用之间过期
                    self.store.set(&idem_key, &task.id, ttl).await?;
                }
            }

            self.save(&task, None).await?;
            self.store
                .list_push(&keys::queue(task.priority), &task.id)
                .await?;

            BulwarkMetrics::task_enqueued(&task.task_type, task.priority);
            StructuredLogger::log_task_enqueued(&task);
            self.publish_task_event(TaskEventKind::TaskEnqueued, &task)
                .await;
            Ok(task.id)
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            TraceContext::record_error(&span, e);
        }
        result
    }

    pub async fn get_task(&self, task_id: &str) -> BulwarkResult<Task> {
        self.find_task(task_id)
            .await?
            .ok_or_else(|| BulwarkError::task_not_found(task_id))
    }

    async fn find_task(&self, task_id: &str) -> BulwarkResult<Option<Task>> {
        match self.store.get(&keys::task(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, task: &Task, ttl: Option<Duration>) -> BulwarkResult<()> {
        let raw = serde_json::to_string(task)?;
        self.store.set(&keys::task(&task.id), &raw, ttl).await
    }

    /// 按优先级从高到低弹出一个待处理任务ID
    pub async fn dequeue(&self) -> BulwarkResult<Option<String>> {
        for priority in TaskPriority::ALL {
            if let Some(id) = self.store.list_pop(&keys::queue(priority)).await? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// 处理一次任务，成功返回`true`
    ///
    /// 失败时在`attempts <= max_retries`内安排重试，否则进入死信队列。
    /// 已完成的任务不会重复执行，已进入死信的任务需经`retry_dlq_task`重新入队。
    pub async fn process_task(
        &self,
        task_id: &str,
        processor: &dyn TaskProcessor,
    ) -> BulwarkResult<bool> {
        let mut task = self.get_task(task_id).await?;
        match task.status {
            TaskStatus::Completed => {
                debug!(task.id = task_id, "任务已完成，跳过");
                return Ok(true);
            }
            TaskStatus::DeadLettered => {
                warn!(task.id = task_id, "任务已在死信队列中，跳过");
                return Ok(false);
            }
            _ => {}
        }

        let span = TraceContext::continue_from(
            &task.trace_context,
            "task.process",
            &[
                ("task.id", task.id.clone()),
                ("task.type", task.task_type.clone()),
            ],
        );

        let result: BulwarkResult<bool> = async {
            self.store.zrem(keys::RETRY_SET, &task.id).await?;

            task.status = TaskStatus::Processing;
            task.attempts += 1;
            task.next_retry_at = None;
            task.updated_at = self.clock.now();
            self.save(&task, None).await?;

            match processor.process(&task).await {
                Ok(()) => {
                    self.complete(&mut task).await?;
                    Ok(true)
                }
                Err(e) => {
                    task.last_error = Some(e.to_string());
                    if task.can_retry() {
                        self.schedule_retry(&mut task).await?;
                    } else {
                        self.dead_letter(&mut task).await?;
                    }
                    Ok(false)
                }
            }
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            TraceContext::record_error(&span, e);
        }
        result
    }

    async fn complete(&self, task: &mut Task) -> BulwarkResult<()> {
        let now = self.clock.now();
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.updated_at = now;
        self.save(
            task,
            Some(Duration::from_secs(self.config.completed_ttl_seconds)),
        )
        .await?;
        if let Some(key) = &task.idempotency_key {
            self.store.delete(&keys::idempotency(key)).await?;
        }

        BulwarkMetrics::task_completed(&task.task_type);
        StructuredLogger::log_task_completed(task);
        self.publish_task_event(TaskEventKind::TaskCompleted, task)
            .await;
        Ok(())
    }

    async fn schedule_retry(&self, task: &mut Task) -> BulwarkResult<()> {
        let now = self.clock.now();
        let delay = self.policy.delay_for(task.attempts);
        let due = now + ChronoDuration::milliseconds(delay.as_millis() as i64);
        task.status = TaskStatus::Retrying;
        task.next_retry_at = Some(due);
        task.updated_at = now;
        self.save(task, None).await?;
        self.store
            .zadd(keys::RETRY_SET, &task.id, due.timestamp_millis() as f64)
            .await?;

        BulwarkMetrics::task_retry_scheduled(&task.task_type);
        StructuredLogger::log_task_retry(task, delay.as_secs());
        self.publish_task_event(TaskEventKind::TaskRetryScheduled, task)
            .await;
        Ok(())
    }

    async fn dead_letter(&self, task: &mut Task) -> BulwarkResult<()> {
        let now = self.clock.now();
        let retention = self.config.retention();
        task.status = TaskStatus::DeadLettered;
        task.updated_at = now;
        self.save(task, Some(retention)).await?;

        let entry = DlqEntry::from_task(task, now);
        let raw = serde_json::to_string(&entry)?;
        self.store
            .set(&keys::dlq_entry(&task.id), &raw, Some(retention))
            .await?;
        let depth = self
            .store
            .list_push(&keys::dlq(task.priority), &task.id)
            .await?;

        BulwarkMetrics::task_dead_lettered(&task.task_type, task.priority);
        BulwarkMetrics::dlq_depth(task.priority, depth);
        StructuredLogger::log_task_dead_lettered(&entry);

        let alert = Alert::task_dead_lettered(&entry).with_host(self.host.clone());
        match serde_json::to_string(&alert) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(channels::DLQ_ALERTS, &payload).await {
                    warn!(task.id = %task.id, error = %e, "发布死信告警失败");
                }
            }
            Err(e) => warn!(task.id = %task.id, error = %e, "无法序列化死信告警"),
        }
        self.publish_task_event(TaskEventKind::TaskDeadLettered, task)
            .await;
        Ok(())
    }

    async fn publish_task_event(&self, kind: TaskEventKind, task: &Task) {
        let event = TaskEvent::from_task(kind, task, self.clock.now());
        let result = match serde_json::to_string(&event) {
            Ok(payload) => self.store.publish(channels::TASK_EVENTS, &payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(task.id = %task.id, error = %e, "发布任务事件失败");
        }
    }

    /// 领取到期的重试任务并放回主队列，返回领取数量
    ///
    /// 领取在存储中是原子的，多个调度器实例不会重复放回同一任务。
    pub async fn promote_due(&self, limit: usize) -> BulwarkResult<usize> {
        let now_ms = self.clock.now_millis();
        let claimed = self
            .store
            .claim_due(keys::RETRY_SET, now_ms as f64, limit)
            .await?;
        let mut promoted = 0;
        for task_id in claimed {
            let Some(mut task) = self.find_task(&task_id).await? else {
                warn!(task.id = %task_id, "到期的重试任务记录已不存在");
                continue;
            };
            if task.status != TaskStatus::Retrying {
                debug!(task.id = %task_id, status = task.status.as_str(), "任务不再等待重试");
                continue;
            }
            task.status = TaskStatus::Pending;
            task.updated_at = self.clock.now();
            self.save(&task, None).await?;
            self.store
                .list_push(&keys::queue(task.priority), &task.id)
                .await?;
            promoted += 1;
        }
        if promoted > 0 {
            info!(promoted, "到期重试任务已放回队列");
        }
        Ok(promoted)
    }

    /// 各优先级主队列的长度
    pub async fn queue_depths(&self) -> BulwarkResult<BTreeMap<TaskPriority, u64>> {
        let mut depths = BTreeMap::new();
        for priority in TaskPriority::ALL {
            depths.insert(priority, self.store.list_len(&keys::queue(priority)).await?);
        }
        Ok(depths)
    }

    pub async fn retry_set_size(&self) -> BulwarkResult<u64> {
        self.store.zcard(keys::RETRY_SET).await
    }

    async fn load_entry(&self, task_id: &str) -> BulwarkResult<Option<DlqEntry>> {
        match self.store.get(&keys::dlq_entry(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// 读取一个优先级下的全部条目，顺带移除记录已过期的列表项
    async fn load_priority(&self, priority: TaskPriority) -> BulwarkResult<Vec<DlqEntry>> {
        let list_key = keys::dlq(priority);
        let ids = self.store.list_range(&list_key, 0, -1).await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_entry(&id).await? {
                Some(entry) => entries.push(entry),
                None => {
                    self.store.list_remove(&list_key, &id).await?;
                }
            }
        }
        Ok(entries)
    }

    pub async fn get_dlq_items(
        &self,
        priority: TaskPriority,
        limit: usize,
        offset: usize,
    ) -> BulwarkResult<DlqPage> {
        let entries = self.load_priority(priority).await?;
        let total = entries.len() as u64;
        let items = entries.into_iter().skip(offset).take(limit).collect();
        Ok(DlqPage {
            priority,
            items,
            total,
            limit,
            offset,
        })
    }

    /// 合并所有优先级，按失败时间倒序
    pub async fn get_all_dlq_items(&self, limit: usize) -> BulwarkResult<Vec<DlqEntry>> {
        let mut all = Vec::new();
        for priority in TaskPriority::ALL {
            all.extend(self.load_priority(priority).await?);
        }
        all.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        all.truncate(limit);
        Ok(all)
    }

    pub async fn get_dlq_stats(&self) -> BulwarkResult<DlqStats> {
        let mut stats = DlqStats::default();
        for priority in TaskPriority::ALL {
            let entries = self.load_priority(priority).await?;
            let count = entries.len() as u64;
            BulwarkMetrics::dlq_depth(priority, count);
            stats.by_priority.insert(priority.as_str().to_string(), count);
            stats.total += count;
            for entry in &entries {
                stats.oldest_failure = Some(
                    stats
                        .oldest_failure
                        .map_or(entry.failed_at, |t| t.min(entry.failed_at)),
                );
                stats.newest_failure = Some(
                    stats
                        .newest_failure
                        .map_or(entry.failed_at, |t| t.max(entry.failed_at)),
                );
            }
        }
        Ok(stats)
    }

    /// 按当前死信深度刷新各优先级的计量
    pub async fn refresh_dlq_gauges(&self) -> BulwarkResult<()> {
        for priority in TaskPriority::ALL {
            let depth = self.load_priority(priority).await?.len() as u64;
            BulwarkMetrics::dlq_depth(priority, depth);
        }
        Ok(())
    }

    pub async fn get_dlq_task(&self, task_id: &str) -> BulwarkResult<DlqTaskDetail> {
        let entry = self
            .load_entry(task_id)
            .await?
            .ok_or_else(|| BulwarkError::task_not_found(task_id))?;
        let task = self.find_task(task_id).await?;
        Ok(DlqTaskDetail { entry, task })
    }

    /// 把死信任务重新入队
    ///
    /// `reset_attempts`为`false`时尝试次数压到`max_retries`，只再给一次机会，
    /// 再失败即重新进入死信，尝试次数不会超过`max_retries + 1`。
    pub async fn retry_dlq_task(&self, task_id: &str, reset_attempts: bool) -> BulwarkResult<Task> {
        let entry = self
            .load_entry(task_id)
            .await?
            .ok_or_else(|| BulwarkError::task_not_found(task_id))?;
        let now = self.clock.now();
        let mut task = match self.find_task(task_id).await? {
            Some(task) => task,
            None => Task::from_dlq_entry(&entry, now),
        };

        self.store
            .list_remove(&keys::dlq(entry.priority), task_id)
            .await?;
        self.store.delete(&keys::dlq_entry(task_id)).await?;

        task.status = TaskStatus::Pending;
        task.next_retry_at = None;
        task.updated_at = now;
        task.attempts = if reset_attempts {
            0
        } else {
            task.attempts.min(task.max_retries)
        };
        self.save(&task, None).await?;
        self.store
            .list_push(&keys::queue(task.priority), &task.id)
            .await?;

        info!(
            event = "task_requeued",
            task.id = %task.id,
            task.type = %task.task_type,
            reset_attempts,
            "死信任务已重新入队"
        );
        self.publish_task_event(TaskEventKind::TaskRequeued, &task)
            .await;
        Ok(task)
    }

    /// 批量重试一个优先级下的死信任务，单个失败不影响其余任务
    pub async fn retry_all(
        &self,
        priority: TaskPriority,
        limit: usize,
        task_type: Option<&str>,
    ) -> BulwarkResult<RetryAllReport> {
        let entries = self.load_priority(priority).await?;
        let mut report = RetryAllReport::default();
        for entry in entries
            .into_iter()
            .filter(|e| task_type.map_or(true, |t| e.task_type == t))
            .take(limit)
        {
            match self.retry_dlq_task(&entry.task_id, true).await {
                Ok(task) => report.requeued.push(task.id),
                Err(e) => report.failed.push(RetryFailure {
                    task_id: entry.task_id,
                    error: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    /// 删除失败时间不晚于`now - older_than_days`的条目，返回删除数量
    pub async fn purge_dlq(
        &self,
        priority: Option<TaskPriority>,
        older_than_days: u64,
    ) -> BulwarkResult<u64> {
        let cutoff: DateTime<Utc> =
            self.clock.now() - ChronoDuration::days(older_than_days as i64);
        let priorities = match priority {
            Some(p) => vec![p],
            None => TaskPriority::ALL.to_vec(),
        };
        let mut purged = 0;
        for priority in priorities {
            let list_key = keys::dlq(priority);
            for entry in self.load_priority(priority).await? {
                if entry.failed_at > cutoff {
                    continue;
                }
                self.store.list_remove(&list_key, &entry.task_id).await?;
                self.store.delete(&keys::dlq_entry(&entry.task_id)).await?;
                self.store.delete(&keys::task(&entry.task_id)).await?;
                purged += 1;
            }
        }
        info!(purged, older_than_days, "死信队列清理完成");
        Ok(purged)
    }

    pub async fn search_dlq(&self, filter: &DlqSearchFilter) -> BulwarkResult<Vec<DlqEntry>> {
        let priorities = match filter.priority {
            Some(p) => vec![p],
            None => TaskPriority::ALL.to_vec(),
        };
        let mut matches = Vec::new();
        for priority in priorities {
            matches.extend(
                self.load_priority(priority)
                    .await?
                    .into_iter()
                    .filter(|entry| filter.matches(entry)),
            );
        }
        matches.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        matches.truncate(filter.limit);
        Ok(matches)
    }
}
