//! # Bulwark Queue
//!
//! 带重试、退避和幂等的任务队列，以及死信管理。

pub mod dead_letter_queue;
pub mod fallback;
pub mod keys;
pub mod processor;
pub mod retry_policy;
pub mod scheduler;
pub mod worker;

pub use dead_letter_queue::{DeadLetterQueue, DlqPage, DlqTaskDetail, RetryAllReport, RetryFailure};
pub use fallback::EnqueueForRetryFallback;
pub use processor::{
    FnProcessor, NoopProcessor, ProcessorRegistry, TaskProcessor, UnregisteredProcessor,
    WebhookProcessor, WebhookTaskParams,
};
pub use retry_policy::RetryPolicy;
pub use scheduler::RetryScheduler;
pub use worker::TaskWorker;
