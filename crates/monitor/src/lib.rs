//! # Bulwark Monitor
//!
//! 死信与熔断告警的节流、分发和死信队列健康巡检。

pub mod alert_monitor;
pub mod health;
pub mod stats;

pub use alert_monitor::{AlertMonitor, DispatchReport, RECENT_ALERTS_KEY};
pub use health::{DlqHealthReport, HealthStatus, HealthThresholds};
pub use stats::{AlertStats, AlertStatsSnapshot, ChannelStats};
