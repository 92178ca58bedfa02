//! 任务工作者
//!
//! 多条并发通道从主队列取任务，按任务类型找到处理器并交给死信队列执行。
//! 停机时不会打断正在处理的任务，当前任务结束后通道退出。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use bulwark_errors::{BulwarkError, BulwarkResult};

use crate::dead_letter_queue::DeadLetterQueue;
use crate::processor::{ProcessorRegistry, TaskProcessor, UnregisteredProcessor};

pub struct TaskWorker {
    queue: Arc<DeadLetterQueue>,
    registry: Arc<ProcessorRegistry>,
    concurrency: usize,
    poll_interval: Duration,
}

impl TaskWorker {
    pub fn new(queue: Arc<DeadLetterQueue>, registry: Arc<ProcessorRegistry>) -> Self {
        let config = queue.config();
        Self {
            concurrency: config.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            queue,
            registry,
        }
    }

    /// 取出并处理一个任务，队列为空时返回`None`
    pub async fn run_once(&self) -> BulwarkResult<Option<bool>> {
        let Some(task_id) = self.queue.dequeue().await? else {
            return Ok(None);
        };
        let task = match self.queue.get_task(&task_id).await {
            Ok(task) => task,
            Err(BulwarkError::TaskNotFound { .. }) => {
                warn!(task.id = %task_id, "队列中的任务记录已不存在，丢弃");
                return Ok(Some(false));
            }
            Err(e) => return Err(e),
        };

        let processor: Arc<dyn TaskProcessor> = match self.registry.get(&task.task_type) {
            Some(processor) => processor,
            None => Arc::new(UnregisteredProcessor),
        };
        let succeeded = self.queue.process_task(&task_id, processor.as_ref()).await?;
        Ok(Some(succeeded))
    }

    /// 处理直到队列为空，返回处理的任务数
    pub async fn drain(&self) -> BulwarkResult<usize> {
        let mut processed = 0;
        while self.run_once().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// 启动全部通道，运行直到收到停机信号
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Receiver<()>) {
        info!(
            concurrency = self.concurrency,
            task_types = ?self.registry.task_types(),
            "任务工作者启动"
        );
        let mut lanes = JoinSet::new();
        for lane in 0..self.concurrency {
            let worker = Arc::clone(&self);
            let shutdown = shutdown.resubscribe();
            lanes.spawn(async move { worker.lane(lane, shutdown).await });
        }
        drop(shutdown);

        while let Some(result) = lanes.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "工作通道异常退出");
            }
        }
        info!("任务工作者已停止");
    }

    async fn lane(&self, lane: usize, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // 队列有任务时连续处理，每个任务之间检查停机信号
                    loop {
                        match self.run_once().await {
                            Ok(Some(_)) => {}
                            Ok(None) => break,
                            Err(e) => {
                                error!(lane, error = %e, "处理任务失败");
                                break;
                            }
                        }
                        if !matches!(
                            shutdown.try_recv(),
                            Err(broadcast::error::TryRecvError::Empty)
                        ) {
                            debug!(lane, "工作通道退出");
                            return;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!(lane, "工作通道退出");
                    return;
                }
            }
        }
    }
}
