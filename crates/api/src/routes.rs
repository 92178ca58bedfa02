use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use bulwark_config::AppConfig;
use bulwark_core::{CircuitBreakerRegistry, RateLimiter};
use bulwark_domain::Store;
use bulwark_monitor::AlertMonitor;
use bulwark_observability::MetricsExporter;
use bulwark_queue::DeadLetterQueue;

use crate::handlers::{
    alerts::{get_alert_stats, get_recent_alerts},
    breakers::{get_breaker, list_breakers, reset_breaker},
    dlq::{
        get_dlq_health, get_dlq_items, get_dlq_stats, get_dlq_task, list_dlq, purge_dlq,
        retry_all, retry_task, search_dlq,
    },
    health::{health_check, metrics},
    rate_limits::{get_limit_info, reset_limit},
};

/// 管理API共享状态
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<DeadLetterQueue>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub monitor: Arc<AlertMonitor>,
    pub metrics: MetricsExporter,
    pub config: Arc<AppConfig>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查与指标
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        // 死信队列
        .route("/dlq", get(list_dlq))
        .route("/dlq/stats", get(get_dlq_stats))
        .route("/dlq/health", get(get_dlq_health))
        .route("/dlq/retry", post(retry_task))
        .route("/dlq/retry-all", post(retry_all))
        .route("/dlq/purge", delete(purge_dlq))
        .route("/dlq/search", post(search_dlq))
        .route("/dlq/task/{task_id}", get(get_dlq_task))
        .route("/dlq/{priority}", get(get_dlq_items))
        // 熔断器
        .route("/breakers", get(list_breakers))
        .route("/breakers/{name}", get(get_breaker))
        .route("/breakers/{name}/reset", post(reset_breaker))
        // 限流
        .route("/rate-limits/{config}/{identifier}", get(get_limit_info))
        .route("/rate-limits/{identifier}", delete(reset_limit))
        // 告警
        .route("/alerts/stats", get(get_alert_stats))
        .route("/alerts/recent", get(get_recent_alerts))
        .with_state(state)
}
