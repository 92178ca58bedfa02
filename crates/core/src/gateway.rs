//! 请求保护网关
//!
//! 每个入站请求依次经过：链路span、限流判定、熔断保护调用、熔断时降级。

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use bulwark_domain::RateLimitInfo;
use bulwark_errors::BulwarkResult;
use bulwark_observability::TraceContext;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::fallback::CallOutcome;
use crate::rate_limiter::RateLimiter;

/// 一次受保护的下游调用请求
#[derive(Debug, Clone, Default)]
pub struct GatewayRequest {
    /// 限流标识，通常是用户ID或客户端IP
    pub identifier: String,
    /// 为空时不做限流
    pub rate_limit_config: Option<String>,
    pub service: String,
    pub args: Value,
    pub cost: Option<u64>,
    pub timeout: Option<Duration>,
    /// 上游传入的W3C载体，为空时开启新的trace
    pub trace_carrier: HashMap<String, String>,
}

impl GatewayRequest {
    pub fn new(identifier: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn with_rate_limit(mut self, config: impl Into<String>) -> Self {
        self.rate_limit_config = Some(config.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_trace_carrier(mut self, carrier: HashMap<String, String>) -> Self {
        self.trace_carrier = carrier;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub outcome: CallOutcome,
    pub rate_limit: Option<RateLimitInfo>,
    pub trace_id: Option<String>,
}

#[derive(Clone)]
pub struct ProtectionGateway {
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ProtectionGateway {
    pub fn new(limiter: Arc<RateLimiter>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { limiter, breakers }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// 处理一次请求
    ///
    /// 被限流时返回`RateLimitExceeded`且不调用`f`；熔断时返回降级结果或`ServiceDegraded`。
    pub async fn handle<E, F, Fut>(
        &self,
        request: GatewayRequest,
        f: F,
    ) -> BulwarkResult<GatewayResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Display,
    {
        let span = TraceContext::continue_from(
            &request.trace_carrier,
            "gateway.request",
            &[
                ("gateway.service", request.service.clone()),
                ("gateway.identifier", request.identifier.clone()),
            ],
        );
        let trace_id = TraceContext::trace_id_of(&span);

        let result: BulwarkResult<GatewayResponse> = async {
            let rate_limit = match &request.rate_limit_config {
                Some(config) => Some(
                    self.limiter
                        .enforce(&request.identifier, config, request.cost)
                        .await?,
                ),
                None => None,
            };
            let outcome = self
                .breakers
                .call_with_fallback_timeout(&request.service, request.args, request.timeout, f)
                .await?;
            Ok(GatewayResponse {
                outcome,
                rate_limit,
                trace_id: trace_id.clone(),
            })
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            TraceContext::record_error(&span, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::StaticFallback;
    use bulwark_config::CircuitBreakerConfig;
    use bulwark_domain::Store;
    use bulwark_errors::BulwarkError;
    use bulwark_infrastructure::InMemoryStore;
    use bulwark_testing_utils::{ManualClock, RateLimitConfigBuilder};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gateway() -> ProtectionGateway {
        let clock = Arc::new(ManualClock::new());
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(clock.clone()));
        let mut limits = BTreeMap::new();
        limits.insert(
            "api".to_string(),
            RateLimitConfigBuilder::new("api").limit(2, 60).build(),
        );
        let mut breakers = BTreeMap::new();
        breakers.insert(
            "analytics".to_string(),
            CircuitBreakerConfig::new(1, Duration::from_secs(60)),
        );
        ProtectionGateway::new(
            Arc::new(RateLimiter::new(store.clone(), clock.clone(), limits)),
            Arc::new(CircuitBreakerRegistry::new(store, clock, breakers)),
        )
    }

    fn request() -> GatewayRequest {
        GatewayRequest::new("user:1", "analytics").with_rate_limit("api")
    }

    #[tokio::test]
    async fn test_live_call_carries_quota() {
        let gateway = gateway();
        let response = gateway
            .handle(request(), || async { Ok::<_, String>(json!({"ok": true})) })
            .await
            .unwrap();
        assert!(!response.outcome.is_fallback());
        assert_eq!(response.rate_limit.unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_request_never_reaches_downstream() {
        let gateway = gateway();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            gateway
                .handle(request(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(json!({}))
                })
                .await
                .unwrap();
        }
        let err = gateway
            .handle(request(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(json!({}))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BulwarkError::RateLimitExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_serves_fallback() {
        let gateway = gateway();
        gateway.breakers().register_fallback(
            "analytics",
            Arc::new(StaticFallback::new(json!({"cached": true}))),
        );
        gateway
            .handle(GatewayRequest::new("user:1", "analytics"), || async {
                Err::<Value, _>("503")
            })
            .await
            .unwrap_err();

        let response = gateway
            .handle(GatewayRequest::new("user:1", "analytics"), || async {
                Ok::<_, String>(json!({"cached": false}))
            })
            .await
            .unwrap();
        assert!(response.outcome.is_fallback());
        assert!(response.rate_limit.is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let gateway = gateway();
        let err = gateway
            .handle(
                GatewayRequest::new("user:1", "analytics").with_timeout(Duration::from_millis(5)),
                || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(json!({}))
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BulwarkError::Timeout(_)));
    }
}
