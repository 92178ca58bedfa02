use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn, Instrument};

use bulwark_config::CircuitBreakerConfig;
use bulwark_domain::{
    channels, BreakerEvent, BreakerPermit, BreakerRecord, BreakerSnapshot, CircuitState, Clock,
    StateTransition, Store,
};
use bulwark_errors::{BulwarkError, BulwarkResult};
use bulwark_observability::{host_name, BulwarkMetrics, StructuredLogger, TraceContext};

use crate::fallback::{CallOutcome, Fallback};

/// 熔断器观察者
///
/// 回调在调用路径上同步执行，实现必须不阻塞。
pub trait CircuitBreakerListener: Send + Sync {
    fn state_changed(&self, _breaker: &str, _transition: StateTransition, _record: &BreakerRecord) {}

    fn call_succeeded(&self, _breaker: &str) {}

    fn call_failed(&self, _breaker: &str, _error: &str) {}

    fn call_rejected(&self, _breaker: &str) {}
}

/// 将熔断器事件写入Prometheus指标
pub struct MetricsListener;

impl CircuitBreakerListener for MetricsListener {
    fn state_changed(&self, breaker: &str, transition: StateTransition, _record: &BreakerRecord) {
        BulwarkMetrics::breaker_state(breaker, transition.to);
    }

    fn call_succeeded(&self, breaker: &str) {
        BulwarkMetrics::breaker_call(breaker, true);
    }

    fn call_failed(&self, breaker: &str, _error: &str) {
        BulwarkMetrics::breaker_call(breaker, false);
    }

    fn call_rejected(&self, breaker: &str) {
        BulwarkMetrics::breaker_rejection(breaker);
    }
}

/// 记录状态迁移日志
pub struct LoggingListener;

impl CircuitBreakerListener for LoggingListener {
    fn state_changed(&self, breaker: &str, transition: StateTransition, record: &BreakerRecord) {
        StructuredLogger::log_breaker_transition(
            breaker,
            transition.from,
            transition.to,
            record.fail_counter,
        );
    }

    fn call_failed(&self, breaker: &str, error: &str) {
        debug!(breaker, error, "受保护调用失败");
    }
}

fn retry_after_secs(retry_after_ms: i64) -> u64 {
    (retry_after_ms.max(0) as u64).div_ceil(1000).max(1)
}

/// 熔断器注册表
///
/// 每个下游依赖一个独立配置的熔断器，状态保存在共享存储中，每次迁移都是一次原子的存储操作。
pub struct CircuitBreakerRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    breakers: BTreeMap<String, CircuitBreakerConfig>,
    listeners: RwLock<Vec<Arc<dyn CircuitBreakerListener>>>,
    fallbacks: RwLock<HashMap<String, Arc<dyn Fallback>>>,
    source: Option<String>,
}

impl CircuitBreakerRegistry {
    /// 创建注册表并安装默认的指标与日志监听器
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        breakers: BTreeMap<String, CircuitBreakerConfig>,
    ) -> Self {
        let listeners: Vec<Arc<dyn CircuitBreakerListener>> =
            vec![Arc::new(MetricsListener), Arc::new(LoggingListener)];
        Self {
            store,
            clock,
            breakers,
            listeners: RwLock::new(listeners),
            fallbacks: RwLock::new(HashMap::new()),
            source: host_name(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn register_fallback(&self, service: &str, fallback: Arc<dyn Fallback>) {
        self.fallbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), fallback);
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.keys().cloned().collect()
    }

    pub fn config(&self, name: &str) -> BulwarkResult<&CircuitBreakerConfig> {
        self.breakers
            .get(name)
            .ok_or_else(|| BulwarkError::unknown_circuit_breaker(name))
    }

    fn fallback_for(&self, service: &str) -> Option<Arc<dyn Fallback>> {
        self.fallbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    fn notify(&self, f: impl Fn(&dyn CircuitBreakerListener)) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }

    fn on_transition(&self, name: &str, transition: StateTransition, record: &BreakerRecord) {
        self.notify(|l| l.state_changed(name, transition, record));

        let event = BreakerEvent {
            breaker: name.to_string(),
            old_state: transition.from,
            new_state: transition.to,
            fail_counter: record.fail_counter,
            success_counter: record.success_counter,
            source: self.source.clone(),
            timestamp: self.clock.now(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(breaker = name, error = %e, "无法序列化熔断器事件");
                return;
            }
        };
        let store = self.store.clone();
        let breaker = name.to_string();
        // 事件发布不占用调用路径
        tokio::spawn(async move {
            if let Err(e) = store
                .publish(channels::CIRCUIT_BREAKER_EVENTS, &payload)
                .await
            {
                warn!(breaker = %breaker, error = %e, "发布熔断器事件失败");
            }
        });
    }

    /// 经熔断器调用下游
    ///
    /// 熔断器打开时立即返回`CircuitOpen`且不调用`f`；调用失败计入失败次数并以`Downstream`返回。
    pub async fn invoke<T, E, F, Fut>(&self, name: &str, f: F) -> BulwarkResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute(name, None, f).await
    }

    /// 与`invoke`相同，但超时视为一次失败
    pub async fn invoke_with_timeout<T, E, F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        f: F,
    ) -> BulwarkResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute(name, Some(timeout), f).await
    }

    async fn execute<T, E, F, Fut>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> BulwarkResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let config = self.config(name)?.clone();
        let span = TraceContext::span("circuit_breaker.call", &[("breaker", name.to_string())]);

        let result: BulwarkResult<T> = async {
            let reset_ms = config.reset_timeout.as_millis() as i64;
            let acquire = self
                .store
                .breaker_acquire(name, reset_ms, self.clock.now_millis())
                .await?;
            if let Some(transition) = acquire.transition {
                self.on_transition(name, transition, &acquire.record);
            }

            if let BreakerPermit::Rejected { retry_after_ms } = acquire.permit {
                self.notify(|l| l.call_rejected(name));
                return Err(BulwarkError::CircuitOpen {
                    service: name.to_string(),
                    retry_after_secs: retry_after_secs(retry_after_ms),
                });
            }

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, f()).await {
                    Ok(result) => result.map_err(|e| BulwarkError::downstream(name, e.to_string())),
                    Err(_) => Err(BulwarkError::timeout_error(format!(
                        "{name} 调用超过 {}ms",
                        limit.as_millis()
                    ))),
                },
                None => f()
                    .await
                    .map_err(|e| BulwarkError::downstream(name, e.to_string())),
            };

            match outcome {
                Ok(value) => {
                    self.record_success(name).await;
                    Ok(value)
                }
                Err(error) => {
                    self.record_failure(name, config.fail_max, &error).await;
                    Err(error)
                }
            }
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            TraceContext::record_error(&span, e);
        }
        result
    }

    async fn record_success(&self, name: &str) {
        self.notify(|l| l.call_succeeded(name));
        match self
            .store
            .breaker_record_success(name, self.clock.now_millis())
            .await
        {
            Ok(update) => {
                if let Some(transition) = update.transition {
                    self.on_transition(name, transition, &update.record);
                }
            }
            Err(e) => warn!(breaker = name, error = %e, "记录调用成功失败"),
        }
    }

    async fn record_failure(&self, name: &str, fail_max: u32, error: &BulwarkError) {
        let message = error.to_string();
        self.notify(|l| l.call_failed(name, &message));
        match self
            .store
            .breaker_record_failure(name, fail_max, self.clock.now_millis())
            .await
        {
            Ok(update) => {
                if let Some(transition) = update.transition {
                    self.on_transition(name, transition, &update.record);
                }
            }
            Err(e) => warn!(breaker = name, error = %e, "记录调用失败失败"),
        }
    }

    /// 经熔断器调用，熔断时改用服务注册的降级策略
    pub async fn call_with_fallback<E, F, Fut>(
        &self,
        service: &str,
        args: Value,
        f: F,
    ) -> BulwarkResult<CallOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Display,
    {
        self.guarded_with_fallback(service, args, None, f).await
    }

    /// 与`call_with_fallback`相同，`timeout`为`None`时不限时
    pub async fn call_with_fallback_timeout<E, F, Fut>(
        &self,
        service: &str,
        args: Value,
        timeout: Option<Duration>,
        f: F,
    ) -> BulwarkResult<CallOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Display,
    {
        self.guarded_with_fallback(service, args, timeout, f).await
    }

    async fn guarded_with_fallback<E, F, Fut>(
        &self,
        service: &str,
        args: Value,
        timeout: Option<Duration>,
        f: F,
    ) -> BulwarkResult<CallOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Display,
    {
        match self.execute(service, timeout, f).await {
            Ok(value) => {
                if let Some(fallback) = self.fallback_for(service) {
                    fallback.on_success(service, &args, &value).await;
                }
                Ok(CallOutcome::live(value))
            }
            Err(BulwarkError::CircuitOpen {
                retry_after_secs, ..
            }) => {
                let degraded = || BulwarkError::ServiceDegraded {
                    service: service.to_string(),
                    retry_after_secs,
                };
                let Some(fallback) = self.fallback_for(service) else {
                    return Err(degraded());
                };
                match fallback.fallback(service, &args).await? {
                    Some(value) => {
                        debug!(service, "熔断器打开，返回降级结果");
                        Ok(CallOutcome::fallback(value))
                    }
                    None => Err(degraded()),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn snapshot(&self, name: &str) -> BulwarkResult<BreakerSnapshot> {
        let config = self.config(name)?;
        let record = self.store.breaker_load(name).await?;
        BulwarkMetrics::breaker_state(name, record.state);
        Ok(BreakerSnapshot::from_record(
            name,
            &record,
            config.fail_max,
            config.reset_timeout.as_secs(),
        ))
    }

    pub async fn snapshots(&self) -> BulwarkResult<Vec<BreakerSnapshot>> {
        let mut snapshots = Vec::with_capacity(self.breakers.len());
        for name in self.breakers.keys() {
            snapshots.push(self.snapshot(name).await?);
        }
        Ok(snapshots)
    }

    pub async fn state(&self, name: &str) -> BulwarkResult<CircuitState> {
        self.config(name)?;
        Ok(self.store.breaker_load(name).await?.state)
    }

    async fn force(&self, name: &str, state: CircuitState) -> BulwarkResult<BreakerSnapshot> {
        self.config(name)?;
        let update = self
            .store
            .breaker_force(name, state, self.clock.now_millis())
            .await?;
        if let Some(transition) = update.transition {
            self.on_transition(name, transition, &update.record);
        }
        self.snapshot(name).await
    }

    /// 恢复为闭合状态并清零计数
    pub async fn reset(&self, name: &str) -> BulwarkResult<BreakerSnapshot> {
        self.force(name, CircuitState::Closed).await
    }

    pub async fn force_open(&self, name: &str) -> BulwarkResult<BreakerSnapshot> {
        self.force(name, CircuitState::Open).await
    }

    pub async fn force_close(&self, name: &str) -> BulwarkResult<BreakerSnapshot> {
        self.force(name, CircuitState::Closed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::{CachedSnapshotFallback, StaticFallback};
    use bulwark_domain::EventBus;
    use bulwark_infrastructure::InMemoryStore;
    use bulwark_testing_utils::ManualClock;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Fixture {
        registry: CircuitBreakerRegistry,
        clock: Arc<ManualClock>,
        store: Arc<dyn Store>,
    }

    fn fixture(fail_max: u32, reset_secs: u64) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(clock.clone()));
        let mut breakers = BTreeMap::new();
        breakers.insert(
            "analytics".to_string(),
            CircuitBreakerConfig::new(fail_max, Duration::from_secs(reset_secs)),
        );
        Fixture {
            registry: CircuitBreakerRegistry::new(store.clone(), clock.clone(), breakers),
            clock,
            store,
        }
    }

    async fn fail(registry: &CircuitBreakerRegistry) -> BulwarkResult<()> {
        registry
            .invoke("analytics", || async { Err::<(), _>("boom") })
            .await
    }

    async fn succeed(registry: &CircuitBreakerRegistry) -> BulwarkResult<u32> {
        registry
            .invoke("analytics", || async { Ok::<_, String>(7) })
            .await
    }

    #[derive(Default)]
    struct RecordingListener {
        transitions: Mutex<Vec<StateTransition>>,
        rejections: AtomicUsize,
    }

    impl CircuitBreakerListener for RecordingListener {
        fn state_changed(&self, _breaker: &str, transition: StateTransition, _record: &BreakerRecord) {
            self.transitions.lock().unwrap().push(transition);
        }

        fn call_rejected(&self, _breaker: &str) {
            self.rejections.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_opens_after_fail_max_and_rejects_without_calling() {
        let fx = fixture(3, 60);
        for _ in 0..3 {
            let err = fail(&fx.registry).await.unwrap_err();
            assert!(matches!(err, BulwarkError::Downstream { .. }));
        }
        let snapshot = fx.registry.snapshot("analytics").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.fail_counter, 3);

        let calls = AtomicUsize::new(0);
        let err = fx
            .registry
            .invoke("analytics", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.retry_after_secs(), Some(60));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let fx = fixture(3, 60);
        fail(&fx.registry).await.unwrap_err();
        fail(&fx.registry).await.unwrap_err();
        assert_eq!(succeed(&fx.registry).await.unwrap(), 7);
        fail(&fx.registry).await.unwrap_err();
        fail(&fx.registry).await.unwrap_err();
        assert_eq!(
            fx.registry.state("analytics").await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let fx = fixture(2, 30);
        fail(&fx.registry).await.unwrap_err();
        fail(&fx.registry).await.unwrap_err();
        fx.clock.advance_secs(31);

        assert_eq!(succeed(&fx.registry).await.unwrap(), 7);
        let snapshot = fx.registry.snapshot("analytics").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.fail_counter, 0);
        assert_eq!(snapshot.success_counter, 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens_and_restarts_timeout() {
        let fx = fixture(2, 30);
        fail(&fx.registry).await.unwrap_err();
        fail(&fx.registry).await.unwrap_err();
        fx.clock.advance_secs(30);

        fail(&fx.registry).await.unwrap_err();
        assert_eq!(
            fx.registry.state("analytics").await.unwrap(),
            CircuitState::Open
        );

        fx.clock.advance_secs(10);
        let err = succeed(&fx.registry).await.unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(20));
    }

    #[tokio::test]
    async fn test_only_one_trial_in_flight() {
        let fx = fixture(1, 10);
        fail(&fx.registry).await.unwrap_err();
        fx.clock.advance_secs(10);

        let acquire = fx
            .store
            .breaker_acquire("analytics", 10_000, fx.clock.now_millis())
            .await
            .unwrap();
        assert_eq!(acquire.permit, BreakerPermit::Trial);

        let err = succeed(&fx.registry).await.unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let fx = fixture(1, 60);
        let err = fx
            .registry
            .invoke_with_timeout("analytics", Duration::from_millis(10), || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BulwarkError::Timeout(_)));
        assert_eq!(
            fx.registry.state("analytics").await.unwrap(),
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_unknown_breaker() {
        let fx = fixture(1, 60);
        let err = fx
            .registry
            .invoke("nope", || async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, BulwarkError::UnknownCircuitBreaker { .. }));
    }

    #[tokio::test]
    async fn test_listeners_see_transitions_and_rejections() {
        let fx = fixture(1, 60);
        let listener = Arc::new(RecordingListener::default());
        fx.registry.add_listener(listener.clone());

        fail(&fx.registry).await.unwrap_err();
        succeed(&fx.registry).await.unwrap_err();

        assert_eq!(
            *listener.transitions.lock().unwrap(),
            vec![StateTransition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            }]
        );
        assert_eq!(listener.rejections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transition_published_on_event_channel() {
        let fx = fixture(1, 60);
        let mut events = fx
            .store
            .subscribe(&[channels::CIRCUIT_BREAKER_EVENTS.to_string()])
            .await
            .unwrap();

        fail(&fx.registry).await.unwrap_err();

        let message = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        let event: BreakerEvent = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(event.breaker, "analytics");
        assert_eq!(event.old_state, CircuitState::Closed);
        assert_eq!(event.new_state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_with_fallback_without_registration_is_degraded() {
        let fx = fixture(1, 60);
        fx.registry.force_open("analytics").await.unwrap();

        let err = fx
            .registry
            .call_with_fallback("analytics", json!({}), || async {
                Ok::<_, String>(json!({"live": true}))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BulwarkError::ServiceDegraded {
                retry_after_secs: 60,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_call_with_fallback_uses_static_response() {
        let fx = fixture(1, 60);
        fx.registry.register_fallback(
            "analytics",
            Arc::new(StaticFallback::new(json!({"status": "degraded"}))),
        );

        let live = fx
            .registry
            .call_with_fallback("analytics", json!({}), || async {
                Ok::<_, String>(json!({"live": true}))
            })
            .await
            .unwrap();
        assert!(!live.is_fallback());

        fx.registry.force_open("analytics").await.unwrap();
        let degraded = fx
            .registry
            .call_with_fallback("analytics", json!({}), || async {
                Ok::<_, String>(json!({"live": true}))
            })
            .await
            .unwrap();
        assert!(degraded.is_fallback());
        assert_eq!(degraded.value, json!({"status": "degraded"}));
    }

    #[tokio::test]
    async fn test_call_with_fallback_serves_cached_snapshot() {
        let fx = fixture(1, 60);
        fx.registry.register_fallback(
            "analytics",
            Arc::new(CachedSnapshotFallback::new(fx.store.clone(), None)),
        );

        fx.registry
            .call_with_fallback("analytics", json!({}), || async {
                Ok::<_, String>(json!({"visits": 10}))
            })
            .await
            .unwrap();
        fx.registry.force_open("analytics").await.unwrap();

        let outcome = fx
            .registry
            .call_with_fallback("analytics", json!({}), || async {
                Ok::<_, String>(json!({"visits": 11}))
            })
            .await
            .unwrap();
        assert!(outcome.is_fallback());
        assert_eq!(outcome.value, json!({"visits": 10}));
    }

    #[tokio::test]
    async fn test_downstream_errors_pass_through_fallback() {
        let fx = fixture(5, 60);
        fx.registry.register_fallback(
            "analytics",
            Arc::new(StaticFallback::new(json!({"status": "degraded"}))),
        );
        let err = fx
            .registry
            .call_with_fallback("analytics", json!({}), || async {
                Err::<Value, _>("500 internal")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BulwarkError::Downstream { .. }));
    }

    #[tokio::test]
    async fn test_reset_and_force_close() {
        let fx = fixture(1, 60);
        fail(&fx.registry).await.unwrap_err();
        let snapshot = fx.registry.reset("analytics").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.fail_counter, 0);

        fx.registry.force_open("analytics").await.unwrap();
        let snapshot = fx.registry.force_close("analytics").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);

        let all = fx.registry.snapshots().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "analytics");
    }
}
