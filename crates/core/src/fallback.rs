//! 熔断后的降级策略

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use bulwark_domain::Store;
use bulwark_errors::BulwarkResult;

/// 服务级降级
///
/// `fallback`返回`None`表示没有可用的降级结果，调用方收到`ServiceDegraded`。
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn fallback(&self, service: &str, args: &Value) -> BulwarkResult<Option<Value>>;

    /// 实时调用成功后的回调，可用于刷新缓存快照
    async fn on_success(&self, _service: &str, _args: &Value, _value: &Value) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    Live,
    Fallback,
}

/// 带降级的调用结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub value: Value,
    pub source: OutcomeSource,
}

impl CallOutcome {
    pub fn live(value: Value) -> Self {
        Self {
            value,
            source: OutcomeSource::Live,
        }
    }

    pub fn fallback(value: Value) -> Self {
        Self {
            value,
            source: OutcomeSource::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == OutcomeSource::Fallback
    }
}

/// 固定的降级响应
pub struct StaticFallback {
    response: Value,
}

impl StaticFallback {
    pub fn new(response: Value) -> Self {
        Self { response }
    }
}

#[async_trait]
impl Fallback for StaticFallback {
    async fn fallback(&self, _service: &str, _args: &Value) -> BulwarkResult<Option<Value>> {
        Ok(Some(self.response.clone()))
    }
}

/// 返回最近一次成功调用的结果
///
/// 快照保存在共享存储中，因此所有实例看到同一份。
pub struct CachedSnapshotFallback {
    store: Arc<dyn Store>,
    ttl: Option<Duration>,
}

impl CachedSnapshotFallback {
    pub fn new(store: Arc<dyn Store>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    pub fn snapshot_key(service: &str) -> String {
        format!("fallback:snapshot:{service}")
    }
}

#[async_trait]
impl Fallback for CachedSnapshotFallback {
    async fn fallback(&self, service: &str, _args: &Value) -> BulwarkResult<Option<Value>> {
        let Some(raw) = self.store.get(&Self::snapshot_key(service)).await? else {
            debug!(service, "没有可用的缓存快照");
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn on_success(&self, service: &str, _args: &Value, value: &Value) {
        let result = match serde_json::to_string(value) {
            Ok(raw) => self
                .store
                .set(&Self::snapshot_key(service), &raw, self.ttl)
                .await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(service, error = %e, "刷新降级快照失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_domain::SystemClock;
    use bulwark_infrastructure::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_fallback() {
        let fallback = StaticFallback::new(json!({"status": "degraded"}));
        let value = fallback.fallback("analytics", &json!({})).await.unwrap();
        assert_eq!(value, Some(json!({"status": "degraded"})));
    }

    #[tokio::test]
    async fn test_cached_snapshot_round_trip() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(Arc::new(SystemClock)));
        let fallback = CachedSnapshotFallback::new(store, None);

        assert_eq!(fallback.fallback("analytics", &json!({})).await.unwrap(), None);

        fallback
            .on_success("analytics", &json!({}), &json!({"visits": 42}))
            .await;
        assert_eq!(
            fallback.fallback("analytics", &json!({})).await.unwrap(),
            Some(json!({"visits": 42}))
        );
    }
}
