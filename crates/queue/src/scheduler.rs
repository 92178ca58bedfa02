use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use bulwark_errors::BulwarkResult;

use crate::dead_letter_queue::DeadLetterQueue;

/// 重试调度器
///
/// 周期性地把到期的重试任务放回主队列。
pub struct RetryScheduler {
    queue: Arc<DeadLetterQueue>,
    poll_interval: Duration,
    batch_size: usize,
}

impl RetryScheduler {
    pub fn new(queue: Arc<DeadLetterQueue>) -> Self {
        let config = queue.config();
        Self {
            poll_interval: Duration::from_millis(config.scheduler_poll_interval_ms),
            batch_size: config.scheduler_batch_size,
            queue,
        }
    }

    /// 领取一批到期任务；一批取满时继续领取，直到没有到期任务
    pub async fn tick(&self) -> BulwarkResult<usize> {
        let mut total = 0;
        loop {
            let promoted = self.queue.promote_due(self.batch_size).await?;
            total += promoted;
            if promoted < self.batch_size {
                return Ok(total);
            }
        }
    }

    /// 运行直到收到停机信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "重试调度器启动"
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "重试调度失败");
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停机信号，重试调度器退出");
                    break;
                }
            }
        }
    }
}
