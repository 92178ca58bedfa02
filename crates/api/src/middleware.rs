use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bulwark_config::ApiConfig;
use bulwark_domain::RateLimitInfo;
use bulwark_errors::BulwarkError;
use bulwark_observability::{TraceContext, TRACE_ID_HEADER};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn, Instrument};

use crate::error::ApiError;
use crate::routes::AppState;

/// 不受管理API限流约束的探活与抓取路径
const UNLIMITED_PATHS: [&str; 2] = ["/health", "/metrics"];

pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    info!("开始处理请求: {} {}", method, uri);

    let response = next.run(request).await;
    let duration = start.elapsed();

    info!(
        "完成请求处理: {} {} - 状态: {} - 耗时: {:?}",
        method,
        uri,
        response.status(),
        duration
    );

    response
}

/// 从请求头延续链路，并在响应中回写`x-trace-id`
pub async fn trace_propagation(request: Request, next: Next) -> Response {
    let carrier = header_carrier(request.headers());
    let incoming_trace_id = carrier.get(TRACE_ID_HEADER).cloned();
    let span = TraceContext::continue_from(
        &carrier,
        "http.request",
        &[
            ("http.method", request.method().to_string()),
            ("http.target", request.uri().path().to_string()),
        ],
    );

    let mut response = next.run(request).instrument(span.clone()).await;
    if response.status().is_server_error() {
        TraceContext::record_error(&span, &response.status());
    }

    let trace_id = TraceContext::trace_id_of(&span).or(incoming_trace_id);
    if let Some(value) = trace_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

/// 按调用方标识对管理API限流
///
/// 标识依次取`x-api-key`、`x-forwarded-for`的首个地址，缺省为`anonymous`。
/// 限流存储不可用时放行请求。
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(config_name) = state.config.api.rate_limit_config.clone() else {
        return next.run(request).await;
    };
    if UNLIMITED_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let identifier = client_identifier(request.headers());
    match state
        .limiter
        .check_rate_limit(&identifier, &config_name, None)
        .await
    {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            apply_limit_headers(response.headers_mut(), &decision.info);
            response
        }
        Ok(decision) => {
            let mut response = ApiError::from(BulwarkError::RateLimitExceeded {
                identifier,
                config: config_name,
                retry_after_secs: decision.info.retry_after.unwrap_or(1),
            })
            .into_response();
            apply_limit_headers(response.headers_mut(), &decision.info);
            response
        }
        Err(e) => {
            warn!(error = %e, identifier = %identifier, "管理API限流检查失败，放行请求");
            next.run(request).await
        }
    }
}

fn header_carrier(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn client_identifier(headers: &HeaderMap) -> String {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return format!("key:{key}");
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| format!("ip:{}", ip.trim()))
        .unwrap_or_else(|| "anonymous".to_string())
}

fn apply_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    let pairs = [
        ("x-ratelimit-limit", info.limit.to_string()),
        ("x-ratelimit-remaining", info.remaining.to_string()),
        ("x-ratelimit-reset", info.reset.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

pub fn cors_layer(config: &ApiConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let allow_origin = if origins.is_empty() || config.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

pub fn trace_layer(
) -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>>
{
    TraceLayer::new_for_http()
}

pub fn request_timeout(config: &ApiConfig) -> Duration {
    Duration::from_secs(config.request_timeout_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_identifier_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_identifier(&headers), "anonymous");

        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(client_identifier(&headers), "ip:10.0.0.1");

        headers.insert("x-api-key", HeaderValue::from_static("ops"));
        assert_eq!(client_identifier(&headers), "key:ops");
    }

    #[test]
    fn test_limit_headers() {
        let mut headers = HeaderMap::new();
        apply_limit_headers(
            &mut headers,
            &RateLimitInfo {
                limit: 10,
                remaining: 3,
                reset: 1_700_000_000,
                retry_after: None,
            },
        );
        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "3");
        assert_eq!(headers["x-ratelimit-reset"], "1700000000");
    }
}
