//! 自适应限流的负载信号

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

use bulwark_config::AdaptiveSettings;
use bulwark_domain::Store;
use bulwark_errors::BulwarkResult;

pub const CPU_LOAD_KEY: &str = "system:cpu_load";
pub const ERROR_RATE_KEY: &str = "system:error_rate";

/// 一次负载采样，取值范围均为0.0到1.0
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadSample {
    pub cpu_load: f64,
    pub error_rate: f64,
}

impl LoadSample {
    pub fn new(cpu_load: f64, error_rate: f64) -> Self {
        Self {
            cpu_load,
            error_rate,
        }
    }

    /// 根据阈值计算配额缩放系数
    pub fn scale_factor(&self, settings: &AdaptiveSettings) -> f64 {
        if self.cpu_load > settings.high_load_threshold
            || self.error_rate > settings.high_error_rate
        {
            settings.min_factor
        } else if self.cpu_load < settings.low_load_threshold
            && self.error_rate < settings.low_error_rate
        {
            settings.max_factor
        } else {
            1.0
        }
    }
}

#[async_trait]
pub trait LoadSignal: Send + Sync {
    async fn sample(&self) -> BulwarkResult<LoadSample>;
}

/// 固定值信号，可在运行时更新
#[derive(Debug, Default)]
pub struct StaticLoadSignal {
    sample: RwLock<LoadSample>,
}

impl StaticLoadSignal {
    pub fn new(cpu_load: f64, error_rate: f64) -> Self {
        Self {
            sample: RwLock::new(LoadSample::new(cpu_load, error_rate)),
        }
    }

    pub fn set(&self, cpu_load: f64, error_rate: f64) {
        *self.sample.write().unwrap_or_else(PoisonError::into_inner) =
            LoadSample::new(cpu_load, error_rate);
    }
}

#[async_trait]
impl LoadSignal for StaticLoadSignal {
    async fn sample(&self) -> BulwarkResult<LoadSample> {
        Ok(*self.sample.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// 从共享存储读取由外部写入的负载指标
///
/// 键缺失或无法解析时按0处理。
pub struct StoreLoadSignal {
    store: Arc<dyn Store>,
}

impl StoreLoadSignal {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn read(&self, key: &str) -> BulwarkResult<f64> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(0.0);
        };
        match raw.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => {
                warn!(key, value = %raw, "无法解析负载指标，按0处理");
                Ok(0.0)
            }
        }
    }
}

#[async_trait]
impl LoadSignal for StoreLoadSignal {
    async fn sample(&self) -> BulwarkResult<LoadSample> {
        Ok(LoadSample {
            cpu_load: self.read(CPU_LOAD_KEY).await?,
            error_rate: self.read(ERROR_RATE_KEY).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_domain::SystemClock;
    use bulwark_infrastructure::InMemoryStore;

    #[test]
    fn test_scale_factor_thresholds() {
        let settings = AdaptiveSettings::default();
        assert_eq!(LoadSample::new(0.9, 0.0).scale_factor(&settings), 0.5);
        assert_eq!(LoadSample::new(0.5, 0.2).scale_factor(&settings), 0.5);
        assert_eq!(LoadSample::new(0.1, 0.0).scale_factor(&settings), 1.5);
        assert_eq!(LoadSample::new(0.5, 0.05).scale_factor(&settings), 1.0);
        // 低CPU但错误率不低时保持原配额
        assert_eq!(LoadSample::new(0.1, 0.05).scale_factor(&settings), 1.0);
    }

    #[tokio::test]
    async fn test_static_signal_updates() {
        let signal = StaticLoadSignal::new(0.2, 0.0);
        assert_eq!(signal.sample().await.unwrap(), LoadSample::new(0.2, 0.0));
        signal.set(0.95, 0.3);
        assert_eq!(signal.sample().await.unwrap(), LoadSample::new(0.95, 0.3));
    }

    #[tokio::test]
    async fn test_store_signal_reads_keys() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(Arc::new(SystemClock)));
        let signal = StoreLoadSignal::new(store.clone());
        assert_eq!(signal.sample().await.unwrap(), LoadSample::default());

        store.set(CPU_LOAD_KEY, "0.85", None).await.unwrap();
        store.set(ERROR_RATE_KEY, "garbage", None).await.unwrap();
        assert_eq!(signal.sample().await.unwrap(), LoadSample::new(0.85, 0.0));
    }
}
