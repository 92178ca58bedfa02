//! Test helper utilities and common testing patterns

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    ///
    /// This is useful for integration tests where you need to wait for
    /// background loops to make progress.
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        condition().await
    }

    /// Generate unique test names
    pub fn unique_name(prefix: &str) -> String {
        format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
    }
}

static TELEMETRY: OnceLock<SdkTracerProvider> = OnceLock::new();

/// 安装进程级的追踪订阅者，使span获得有效的trace id
///
/// 日志输出受`RUST_LOG`控制（默认关闭），可重复调用。
pub fn init_test_telemetry() {
    TELEMETRY.get_or_init(|| {
        let provider = SdkTracerProvider::builder().build();
        let tracer = provider.tracer("bulwark-test");
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")));
        let _ = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(fmt_layer)
            .try_init();
        opentelemetry::global::set_text_map_propagator(
            bulwark_observability::TraceContext::propagator(),
        );
        provider
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_for_eventually_true() {
        let calls = AtomicUsize::new(0);
        let ok = TestEnv::wait_for(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { n >= 3 }
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(ok);
    }

    #[test]
    fn test_init_test_telemetry_gives_trace_ids() {
        init_test_telemetry();
        init_test_telemetry();
        let span = bulwark_observability::TraceContext::span("test", &[]);
        assert!(bulwark_observability::TraceContext::trace_id_of(&span).is_some());
    }
}
