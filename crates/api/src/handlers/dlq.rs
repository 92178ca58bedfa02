use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bulwark_domain::{DlqSearchFilter, TaskPriority};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::response::{success, success_with_message, ApiResponse};
use crate::routes::AppState;

const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub task_id: String,
    #[serde(default = "default_reset_attempts")]
    pub reset_attempts: bool,
}

fn default_reset_attempts() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RetryAllRequest {
    pub priority: TaskPriority,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub task_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PurgeParams {
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// 缺省为死信保留天数
    #[serde(default)]
    pub older_than_days: Option<u64>,
}

fn check_limit(limit: usize) -> ApiResult<usize> {
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(ApiError::BadRequest(format!(
            "limit必须在1到{MAX_PAGE_SIZE}之间"
        )));
    }
    Ok(limit)
}

/// 按优先级分页列出死信条目
pub async fn get_dlq_items(
    State(state): State<AppState>,
    Path(priority): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<impl IntoResponse> {
    let priority: TaskPriority = priority.parse()?;
    let limit = check_limit(params.limit)?;
    let page = state
        .queue
        .get_dlq_items(priority, limit, params.offset)
        .await?;
    Ok(success(page))
}

/// 合并所有优先级的最近死信条目
pub async fn list_dlq(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = check_limit(params.limit)?;
    let items = state.queue.get_all_dlq_items(limit).await?;
    let stats = state.queue.get_dlq_stats().await?;
    Ok(success(json!({ "items": items, "stats": stats })))
}

/// 各优先级计数与失败时间范围，附带健康分级
pub async fn get_dlq_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let report = state.monitor.health_report().await?;
    let mut body = serde_json::to_value(&report.dlq)
        .map_err(|e| ApiError::Internal(format!("序列化死信统计失败: {e}")))?;
    if let Some(fields) = body.as_object_mut() {
        fields.insert("status".to_string(), json!(report.status));
        fields.insert("healthy".to_string(), json!(report.status.is_available()));
    }
    Ok(success(body))
}

/// 死信健康状态，`unhealthy`时返回503
pub async fn get_dlq_health(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let report = state.monitor.health_report().await?;
    let status = if report.status.is_available() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, ApiResponse::success(report)))
}

pub async fn get_dlq_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let detail = state.queue.get_dlq_task(&task_id).await?;
    Ok(success(detail))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.task_id.trim().is_empty() {
        return Err(ApiError::BadRequest("task_id不能为空".to_string()));
    }
    let task = state
        .queue
        .retry_dlq_task(&request.task_id, request.reset_attempts)
        .await?;
    Ok(success_with_message(
        task,
        format!("任务 {} 已重新入队", request.task_id),
    ))
}

pub async fn retry_all(
    State(state): State<AppState>,
    Json(request): Json<RetryAllRequest>,
) -> ApiResult<impl IntoResponse> {
    let limit = check_limit(request.limit)?;
    let report = state
        .queue
        .retry_all(request.priority, limit, request.task_type.as_deref())
        .await?;
    let message = format!(
        "已重新入队{}个任务，失败{}个",
        report.requeued.len(),
        report.failed.len()
    );
    Ok(success_with_message(report, message))
}

pub async fn purge_dlq(
    State(state): State<AppState>,
    Query(params): Query<PurgeParams>,
) -> ApiResult<impl IntoResponse> {
    let older_than_days = params
        .older_than_days
        .unwrap_or(state.queue.config().retention_days);
    let purged = state
        .queue
        .purge_dlq(params.priority, older_than_days)
        .await?;
    Ok(success(json!({
        "purged": purged,
        "older_than_days": older_than_days,
        "priority": params.priority,
    })))
}

pub async fn search_dlq(
    State(state): State<AppState>,
    Json(filter): Json<DlqSearchFilter>,
) -> ApiResult<impl IntoResponse> {
    check_limit(filter.limit)?;
    let items = state.queue.search_dlq(&filter).await?;
    Ok(success(items))
}
