use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use bulwark_domain::CircuitState;
use bulwark_observability::BulwarkMetrics;
use serde_json::json;
use tracing::warn;

use crate::error::ApiResult;
use crate::routes::AppState;

/// 服务健康检查，存储不可达时返回503
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (healthy, store) = match state.store.ping().await {
        Ok(()) => (true, "ok".to_string()),
        Err(e) => {
            warn!(error = %e, "存储健康检查失败");
            (false, e.to_string())
        }
    };

    let open_breakers: Vec<String> = match state.breakers.snapshots().await {
        Ok(snapshots) => snapshots
            .into_iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.name)
            .collect(),
        Err(_) => Vec::new(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "unavailable" },
            "store": store,
            "open_breakers": open_breakers,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": state.config.observability.service_name,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// Prometheus抓取端点，渲染前刷新熔断器状态和死信深度
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    for snapshot in state.breakers.snapshots().await? {
        BulwarkMetrics::breaker_state(&snapshot.name, snapshot.state);
    }
    state.queue.refresh_dlq_gauges().await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    ))
}
