use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bulwark_errors::BulwarkError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Bulwark(#[from] BulwarkError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源")]
    NotFound,

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, String, &'static str, Vec<String>) {
        match self {
            ApiError::Bulwark(BulwarkError::RateLimitExceeded {
                identifier,
                config,
                retry_after_secs,
            }) => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("{identifier} 超出限流配置 {config}"),
                "RATE_LIMIT_EXCEEDED",
                vec![format!("请在{retry_after_secs}秒后重试")],
            ),
            ApiError::Bulwark(BulwarkError::CircuitOpen { service, .. }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("服务 {service} 的熔断器已打开"),
                "CIRCUIT_OPEN",
                vec!["依赖服务正在恢复，请按retry_after等待后重试".to_string()],
            ),
            ApiError::Bulwark(BulwarkError::ServiceDegraded { service, .. }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("服务 {service} 已降级且没有可用的降级结果"),
                "SERVICE_DEGRADED",
                vec!["请按retry_after等待后重试".to_string()],
            ),
            ApiError::Bulwark(BulwarkError::TaskNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("任务 {id} 不存在"),
                "TASK_NOT_FOUND",
                vec![
                    "请检查任务ID是否正确".to_string(),
                    "死信条目过期后任务将无法查询".to_string(),
                ],
            ),
            ApiError::Bulwark(BulwarkError::UnknownRateLimitConfig { name }) => (
                StatusCode::NOT_FOUND,
                format!("限流配置 {name} 不存在"),
                "UNKNOWN_RATE_LIMIT_CONFIG",
                vec!["请检查配置文件中的rate_limits".to_string()],
            ),
            ApiError::Bulwark(BulwarkError::UnknownCircuitBreaker { name }) => (
                StatusCode::NOT_FOUND,
                format!("熔断器 {name} 不存在"),
                "UNKNOWN_CIRCUIT_BREAKER",
                vec!["使用 GET /breakers 查看已配置的熔断器".to_string()],
            ),
            ApiError::Bulwark(BulwarkError::Validation(msg)) => (
                StatusCode::BAD_REQUEST,
                msg.clone(),
                "VALIDATION_ERROR",
                vec!["请检查请求参数是否符合要求".to_string()],
            ),
            ApiError::Bulwark(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.user_message().to_string(),
                "INTERNAL_ERROR",
                vec![
                    "系统遇到内部错误，请稍后重试".to_string(),
                    "查看 GET /health 检查系统状态".to_string(),
                ],
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {msg}"),
                "BAD_REQUEST",
                vec!["请检查请求格式和参数".to_string()],
            ),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                "请求的资源不存在".to_string(),
                "NOT_FOUND",
                vec!["请检查请求URL是否正确".to_string()],
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "系统内部错误".to_string(),
                "INTERNAL_ERROR",
                vec![format!("错误详情: {msg}")],
            ),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::Bulwark(err) => err.retry_after_secs(),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, error_type, suggestions) = self.parts();
        let retry_after = self.retry_after();
        if status.is_server_error() {
            tracing::error!(error = %self, "请求处理失败");
        }

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "retry_after": retry_after,
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
