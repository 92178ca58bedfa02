//! Bulwark服务装配：按运行模式启动重试调度器、任务Worker、告警监控和管理API

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::ShutdownManager;
