use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiResult;
use crate::response::success;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct ResetParams {
    #[serde(default)]
    pub config: Option<String>,
}

/// 只读查询标识在某个限流配置下的配额
pub async fn get_limit_info(
    State(state): State<AppState>,
    Path((config, identifier)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let decision = state.limiter.get_limit_info(&identifier, &config).await?;
    Ok(success(json!({
        "identifier": identifier,
        "config": config,
        "allowed": decision.allowed,
        "reason": decision.reason,
        "limit": decision.info.limit,
        "remaining": decision.info.remaining,
        "reset": decision.info.reset,
        "retry_after": decision.info.retry_after,
    })))
}

pub async fn reset_limit(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(params): Query<ResetParams>,
) -> ApiResult<impl IntoResponse> {
    let removed = state
        .limiter
        .reset_limit(&identifier, params.config.as_deref())
        .await?;
    Ok(success(json!({
        "identifier": identifier,
        "config": params.config,
        "removed_keys": removed,
    })))
}
