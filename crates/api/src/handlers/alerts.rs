use axum::{
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiResult;
use crate::response::success;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// 告警发送统计与最近告警
pub async fn get_alert_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let recent = state.monitor.recent_alerts(10).await?;
    Ok(success(json!({
        "stats": state.monitor.stats(),
        "channels": state.monitor.channel_names(),
        "recent_alerts": recent,
    })))
}

pub async fn get_recent_alerts(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> ApiResult<impl IntoResponse> {
    let cap = state.monitor.config().recent_alerts_limit as usize;
    let limit = params.limit.unwrap_or(cap).min(cap);
    let alerts = state.monitor.recent_alerts(limit).await?;
    Ok(success(alerts))
}
