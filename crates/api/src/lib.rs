//! 管理HTTP API
//!
//! 提供死信队列的查询、重试与清理，熔断器与限流状态的查看和重置，
//! 告警统计，以及健康检查和Prometheus指标端点。
//!
//! 错误统一以如下结构返回：
//!
//! ```json
//! {
//!   "error": {
//!     "message": "用户 user:1 超出限流配置 api",
//!     "type": "RATE_LIMIT_EXCEEDED",
//!     "code": 429,
//!     "retry_after": 42,
//!     "suggestions": ["请在42秒后重试"],
//!     "timestamp": "2024-01-01T00:00:00Z"
//!   }
//! }
//! ```
//!
//! 限流拒绝同时返回`Retry-After`响应头；熔断打开或服务降级返回503并在正文中携带`retry_after`。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use middleware::{
    cors_layer, rate_limit, request_logging, request_timeout, trace_layer, trace_propagation,
};

pub use error::{ApiError, ApiResult};
pub use response::ApiResponse;
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState) -> Router {
    let api_config = state.config.api.clone();
    let cors = api_config.cors_enabled.then(|| cors_layer(&api_config));

    create_routes(state.clone()).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(tower::util::option_layer(cors))
            .layer(axum::middleware::from_fn(trace_propagation))
            .layer(axum::middleware::from_fn(request_logging))
            .layer(TimeoutLayer::new(request_timeout(&api_config)))
            .layer(axum::middleware::from_fn_with_state(state, rate_limit)),
    )
}
