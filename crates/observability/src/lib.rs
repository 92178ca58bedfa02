//! 可观测性：链路追踪上下文、日志与追踪初始化、Prometheus指标、结构化日志和告警通道

pub mod alerting;
pub mod metrics_collector;
pub mod structured_logger;
pub mod telemetry_setup;
pub mod trace_context;

pub use alerting::{
    build_channels, format_alert, host_name, ChatWebhookNotificationChannel,
    EmailNotificationChannel, LogNotificationChannel, NotificationChannel,
    WebhookNotificationChannel,
};
pub use metrics_collector::{names as metric_names, BulwarkMetrics, MetricsExporter};
pub use structured_logger::StructuredLogger;
pub use telemetry_setup::{init_observability, shutdown_observability, TelemetryGuard};
pub use trace_context::{TraceContext, TRACE_ID_HEADER};
