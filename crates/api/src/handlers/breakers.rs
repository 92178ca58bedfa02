use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::info;

use crate::error::ApiResult;
use crate::response::{success, success_with_message};
use crate::routes::AppState;

pub async fn list_breakers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let snapshots = state.breakers.snapshots().await?;
    Ok(success(snapshots))
}

pub async fn get_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.breakers.snapshot(&name).await?;
    Ok(success(snapshot))
}

/// 人工把熔断器恢复为关闭状态并清零计数
pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.breakers.reset(&name).await?;
    info!(breaker = %name, "熔断器已通过管理API重置");
    Ok(success_with_message(snapshot, format!("熔断器 {name} 已重置")))
}
