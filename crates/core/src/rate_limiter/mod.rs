//! 多策略限流器
//!
//! 按(标识, 命名配置)判定请求是否放行。白名单直接放行，黑名单与封禁在算法之前判定，
//! 算法状态全部保存在共享存储中。

pub mod load_signal;
pub mod strategies;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Instrument};

use bulwark_config::{RateLimitConfig, RateLimitStrategy};
use bulwark_domain::{Clock, DecisionReason, RateLimitDecision, RateLimitInfo, Store};
use bulwark_errors::{BulwarkError, BulwarkResult};
use bulwark_observability::{BulwarkMetrics, StructuredLogger, TraceContext};

pub use load_signal::{LoadSample, LoadSignal, StaticLoadSignal, StoreLoadSignal};
pub use strategies::LimitKeys;

use strategies::{ceil_secs, evaluate};

/// 黑名单标识的重试提示
pub const BLACKLIST_RETRY_AFTER_SECS: u64 = 86_400;

pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    configs: BTreeMap<String, RateLimitConfig>,
    load_signal: Arc<dyn LoadSignal>,
}

impl RateLimiter {
    /// 默认从共享存储读取自适应负载信号
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        configs: BTreeMap<String, RateLimitConfig>,
    ) -> Self {
        let load_signal = Arc::new(StoreLoadSignal::new(store.clone()));
        Self {
            store,
            clock,
            configs,
            load_signal,
        }
    }

    pub fn with_load_signal(mut self, load_signal: Arc<dyn LoadSignal>) -> Self {
        self.load_signal = load_signal;
        self
    }

    pub fn config(&self, name: &str) -> BulwarkResult<&RateLimitConfig> {
        self.configs
            .get(name)
            .ok_or_else(|| BulwarkError::unknown_rate_limit_config(name))
    }

    pub fn config_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    /// 判定并消耗配额
    ///
    /// `cost`为`None`时使用配置的`cost_per_request`。
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        config_name: &str,
        cost: Option<u64>,
    ) -> BulwarkResult<RateLimitDecision> {
        let config = self.config(config_name)?;
        let cost = cost.unwrap_or(config.cost_per_request);
        let span = TraceContext::span(
            "rate_limit.check",
            &[
                ("rate_limit.identifier", identifier.to_string()),
                ("rate_limit.config", config_name.to_string()),
                ("rate_limit.cost", cost.to_string()),
            ],
        );

        let result: BulwarkResult<RateLimitDecision> = async {
            let decision = self.decide(identifier, config, cost).await?;
            BulwarkMetrics::rate_limit_check(config_name, decision.allowed);
            if !decision.allowed {
                if decision.reason == DecisionReason::LimitExceeded {
                    self.apply_penalty(identifier, config).await;
                }
                StructuredLogger::log_rate_limited(
                    identifier,
                    config_name,
                    decision.info.retry_after.unwrap_or(1),
                );
            }
            Ok(decision)
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            TraceContext::record_error(&span, e);
        }
        result
    }

    /// 判定并消耗配额，被拒绝时返回`RateLimitExceeded`
    pub async fn enforce(
        &self,
        identifier: &str,
        config_name: &str,
        cost: Option<u64>,
    ) -> BulwarkResult<RateLimitInfo> {
        let decision = self.check_rate_limit(identifier, config_name, cost).await?;
        if decision.allowed {
            Ok(decision.info)
        } else {
            Err(BulwarkError::RateLimitExceeded {
                identifier: identifier.to_string(),
                config: config_name.to_string(),
                retry_after_secs: decision.info.retry_after.unwrap_or(1),
            })
        }
    }

    /// 只读查询当前配额，不消耗也不触发封禁
    ///
    /// `allowed`表示下一次`cost_per_request`的请求是否会被放行。
    pub async fn get_limit_info(
        &self,
        identifier: &str,
        config_name: &str,
    ) -> BulwarkResult<RateLimitDecision> {
        let config = self.config(config_name)?;
        let mut decision = self.decide(identifier, config, 0).await?;
        if decision.reason == DecisionReason::WithinLimit
            && decision.info.remaining < config.cost_per_request
        {
            let now_secs = self.clock.now_millis().div_euclid(1000);
            decision.allowed = false;
            decision.reason = DecisionReason::LimitExceeded;
            decision.info.retry_after = Some((decision.info.reset - now_secs).max(1) as u64);
        }
        Ok(decision)
    }

    /// 清除标识的全部限流状态，包括封禁；未指定配置时清除所有配置下的状态
    pub async fn reset_limit(
        &self,
        identifier: &str,
        config_name: Option<&str>,
    ) -> BulwarkResult<u64> {
        let names = match config_name {
            Some(name) => vec![self.config(name)?.name.clone()],
            None => self.config_names(),
        };
        let mut removed = 0;
        for name in names {
            let prefix = LimitKeys::new(&name, identifier).prefix();
            for key in self.store.keys_with_prefix(&prefix).await? {
                if self.store.delete(&key).await? {
                    removed += 1;
                }
            }
        }
        debug!(identifier, removed, "限流状态已重置");
        Ok(removed)
    }

    async fn decide(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        cost: u64,
    ) -> BulwarkResult<RateLimitDecision> {
        let now_ms = self.clock.now_millis();
        let now_secs = now_ms.div_euclid(1000);

        if config.whitelist.contains(identifier) {
            return Ok(RateLimitDecision::allow(
                DecisionReason::Whitelisted,
                RateLimitInfo {
                    limit: config.max_requests,
                    remaining: config.max_requests,
                    reset: now_secs,
                    retry_after: None,
                },
            ));
        }

        if config.blacklist.contains(identifier) {
            return Ok(RateLimitDecision::deny(
                DecisionReason::Blacklisted,
                RateLimitInfo {
                    limit: config.max_requests,
                    remaining: 0,
                    reset: now_secs + BLACKLIST_RETRY_AFTER_SECS as i64,
                    retry_after: Some(BLACKLIST_RETRY_AFTER_SECS),
                },
            ));
        }

        let keys = LimitKeys::new(&config.name, identifier);
        if let Some(until_ms) = self.penalty_until(&keys, now_ms).await? {
            return Ok(RateLimitDecision::deny(
                DecisionReason::Penalized,
                RateLimitInfo {
                    limit: config.max_requests,
                    remaining: 0,
                    reset: (until_ms + 999).div_euclid(1000),
                    retry_after: Some(ceil_secs(until_ms - now_ms)),
                },
            ));
        }

        let limit = self.effective_limit(config).await?;
        let outcome = evaluate(self.store.as_ref(), config, &keys, cost, limit, now_ms).await?;
        Ok(if outcome.allowed {
            RateLimitDecision::allow(DecisionReason::WithinLimit, outcome.info)
        } else {
            RateLimitDecision::deny(DecisionReason::LimitExceeded, outcome.info)
        })
    }

    async fn effective_limit(&self, config: &RateLimitConfig) -> BulwarkResult<u64> {
        if config.strategy != RateLimitStrategy::Adaptive {
            return Ok(config.max_requests);
        }
        let sample = self.load_signal.sample().await?;
        let factor = sample.scale_factor(&config.adaptive);
        let scaled = ((config.max_requests as f64) * factor).floor() as u64;
        Ok(scaled.max(1))
    }

    async fn penalty_until(&self, keys: &LimitKeys, now_ms: i64) -> BulwarkResult<Option<i64>> {
        let Some(raw) = self.store.get(&keys.penalty()).await? else {
            return Ok(None);
        };
        match raw.parse::<i64>() {
            Ok(until_ms) if until_ms > now_ms => Ok(Some(until_ms)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(key = %keys.penalty(), error = %e, "封禁记录格式错误");
                Ok(None)
            }
        }
    }

    async fn apply_penalty(&self, identifier: &str, config: &RateLimitConfig) {
        let Some(seconds) = config.penalty_duration.filter(|s| *s > 0) else {
            return;
        };
        let keys = LimitKeys::new(&config.name, identifier);
        let until_ms = self.clock.now_millis() + seconds as i64 * 1000;
        if let Err(e) = self
            .store
            .set(
                &keys.penalty(),
                &until_ms.to_string(),
                Some(Duration::from_secs(seconds)),
            )
            .await
        {
            warn!(identifier, config = %config.name, error = %e, "写入封禁记录失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_infrastructure::InMemoryStore;
    use bulwark_testing_utils::{ManualClock, RateLimitConfigBuilder};

    struct Fixture {
        limiter: RateLimiter,
        clock: Arc<ManualClock>,
        signal: Arc<StaticLoadSignal>,
    }

    fn fixture(configs: Vec<RateLimitConfig>) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(clock.clone()));
        let signal = Arc::new(StaticLoadSignal::new(0.5, 0.05));
        let configs = configs
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect();
        let limiter =
            RateLimiter::new(store, clock.clone(), configs).with_load_signal(signal.clone());
        Fixture {
            limiter,
            clock,
            signal,
        }
    }

    fn sliding(max: u64, window: u64) -> RateLimitConfig {
        RateLimitConfigBuilder::new("api").limit(max, window).build()
    }

    #[tokio::test]
    async fn test_sliding_window_counts_down_then_denies() {
        let fx = fixture(vec![sliding(5, 60)]);
        for expected in [4, 3, 2, 1, 0] {
            let decision = fx.limiter.check_rate_limit("user:1", "api", None).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.info.remaining, expected);
            fx.clock.advance_secs(1);
        }
        let denied = fx.limiter.check_rate_limit("user:1", "api", None).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason, DecisionReason::LimitExceeded);
        assert_eq!(denied.info.remaining, 0);
        // 最早的请求在55秒后滑出窗口
        assert_eq!(denied.info.retry_after, Some(55));
    }

    #[tokio::test]
    async fn test_sliding_window_frees_slots_as_entries_expire() {
        let fx = fixture(vec![sliding(2, 10)]);
        fx.limiter.check_rate_limit("u", "api", None).await.unwrap();
        fx.clock.advance_secs(5);
        fx.limiter.check_rate_limit("u", "api", None).await.unwrap();
        assert!(!fx.limiter.check_rate_limit("u", "api", None).await.unwrap().allowed);

        fx.clock.advance_secs(5);
        assert!(fx.limiter.check_rate_limit("u", "api", None).await.unwrap().allowed);
        assert!(!fx.limiter.check_rate_limit("u", "api", None).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let fx = fixture(vec![sliding(1, 60)]);
        assert!(fx.limiter.check_rate_limit("a", "api", None).await.unwrap().allowed);
        assert!(!fx.limiter.check_rate_limit("a", "api", None).await.unwrap().allowed);
        assert!(fx.limiter.check_rate_limit("b", "api", None).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_fixed_window_resets_at_boundary_and_rejections_do_not_consume() {
        let config = RateLimitConfigBuilder::new("auth")
            .strategy(RateLimitStrategy::FixedWindow)
            .limit(2, 60)
            .build();
        let fx = fixture(vec![config]);
        // 对齐到窗口起点
        let now_secs = fx.clock.now_millis() / 1000;
        fx.clock.advance_secs((60 - now_secs % 60) as u64);

        assert!(fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap().allowed);
        assert!(fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap().allowed);
        fx.clock.advance_secs(20);
        let denied = fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.info.retry_after, Some(40));
        assert_eq!(denied.info.remaining, 0);

        fx.clock.advance_secs(40);
        let next = fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap();
        assert!(next.allowed);
        assert_eq!(next.info.remaining, 1);
    }

    #[tokio::test]
    async fn test_token_bucket_burst_and_refill() {
        let config = RateLimitConfigBuilder::new("ai")
            .strategy(RateLimitStrategy::TokenBucket)
            .limit(10, 10)
            .burst(3)
            .build();
        let fx = fixture(vec![config]);

        for _ in 0..3 {
            assert!(fx.limiter.check_rate_limit("k", "ai", None).await.unwrap().allowed);
        }
        let denied = fx.limiter.check_rate_limit("k", "ai", None).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.info.limit, 3);
        assert_eq!(denied.info.retry_after, Some(1));

        // 每秒补充1个令牌
        fx.clock.advance_secs(2);
        assert!(fx.limiter.check_rate_limit("k", "ai", None).await.unwrap().allowed);
        assert!(fx.limiter.check_rate_limit("k", "ai", None).await.unwrap().allowed);
        assert!(!fx.limiter.check_rate_limit("k", "ai", None).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_cost_larger_than_tokens() {
        let config = RateLimitConfigBuilder::new("ai")
            .strategy(RateLimitStrategy::TokenBucket)
            .limit(2, 1)
            .burst(4)
            .build();
        let fx = fixture(vec![config]);
        assert!(fx.limiter.check_rate_limit("k", "ai", Some(4)).await.unwrap().allowed);
        let denied = fx.limiter.check_rate_limit("k", "ai", Some(3)).await.unwrap();
        assert!(!denied.allowed);
        // (3 - 0) / 2 向上取整
        assert_eq!(denied.info.retry_after, Some(2));
    }

    #[tokio::test]
    async fn test_leaky_bucket_drains() {
        let config = RateLimitConfigBuilder::new("hooks")
            .strategy(RateLimitStrategy::LeakyBucket)
            .limit(1, 1)
            .burst(2)
            .build();
        let fx = fixture(vec![config]);
        assert!(fx.limiter.check_rate_limit("h", "hooks", None).await.unwrap().allowed);
        let second = fx.limiter.check_rate_limit("h", "hooks", None).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.info.remaining, 0);
        let denied = fx.limiter.check_rate_limit("h", "hooks", None).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.info.retry_after, Some(1));

        fx.clock.advance_secs(1);
        assert!(fx.limiter.check_rate_limit("h", "hooks", None).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_adaptive_scales_with_load() {
        let config = RateLimitConfigBuilder::new("scrape")
            .strategy(RateLimitStrategy::Adaptive)
            .limit(4, 60)
            .build();
        let fx = fixture(vec![config]);

        fx.signal.set(0.95, 0.0);
        let first = fx.limiter.check_rate_limit("s", "scrape", None).await.unwrap();
        assert_eq!(first.info.limit, 2);
        assert!(fx.limiter.check_rate_limit("s", "scrape", None).await.unwrap().allowed);
        assert!(!fx.limiter.check_rate_limit("s", "scrape", None).await.unwrap().allowed);

        fx.signal.set(0.1, 0.0);
        let relaxed = fx.limiter.check_rate_limit("s", "scrape", None).await.unwrap();
        assert!(relaxed.allowed);
        assert_eq!(relaxed.info.limit, 6);
    }

    #[tokio::test]
    async fn test_whitelist_and_blacklist() {
        let config = RateLimitConfigBuilder::new("api")
            .limit(1, 60)
            .whitelist(&["trusted"])
            .blacklist(&["banned"])
            .build();
        let fx = fixture(vec![config]);

        for _ in 0..5 {
            let decision = fx.limiter.check_rate_limit("trusted", "api", None).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.reason, DecisionReason::Whitelisted);
        }
        let banned = fx.limiter.check_rate_limit("banned", "api", None).await.unwrap();
        assert!(!banned.allowed);
        assert_eq!(banned.reason, DecisionReason::Blacklisted);
        assert_eq!(banned.info.retry_after, Some(BLACKLIST_RETRY_AFTER_SECS));
    }

    #[tokio::test]
    async fn test_penalty_outlives_window() {
        let config = RateLimitConfigBuilder::new("auth")
            .limit(1, 10)
            .penalty(120)
            .build();
        let fx = fixture(vec![config]);
        assert!(fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap().allowed);
        let violation = fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap();
        assert_eq!(violation.reason, DecisionReason::LimitExceeded);

        fx.clock.advance_secs(30);
        let penalized = fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap();
        assert!(!penalized.allowed);
        assert_eq!(penalized.reason, DecisionReason::Penalized);
        assert_eq!(penalized.info.retry_after, Some(90));

        fx.clock.advance_secs(91);
        assert!(fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_get_limit_info_does_not_consume() {
        let fx = fixture(vec![sliding(2, 60)]);
        for _ in 0..3 {
            let info = fx.limiter.get_limit_info("u", "api").await.unwrap();
            assert!(info.allowed);
            assert_eq!(info.info.remaining, 2);
        }
        fx.limiter.check_rate_limit("u", "api", None).await.unwrap();
        fx.limiter.check_rate_limit("u", "api", None).await.unwrap();

        let info = fx.limiter.get_limit_info("u", "api").await.unwrap();
        assert!(!info.allowed);
        assert_eq!(info.info.remaining, 0);
        assert!(info.info.retry_after.unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_reset_limit_clears_state_and_penalty() {
        let config = RateLimitConfigBuilder::new("auth")
            .limit(1, 60)
            .penalty(600)
            .build();
        let fx = fixture(vec![config, sliding(1, 60)]);
        fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap();
        fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap();
        fx.limiter.check_rate_limit("ip", "api", None).await.unwrap();

        let removed = fx.limiter.reset_limit("ip", Some("auth")).await.unwrap();
        assert_eq!(removed, 2);
        assert!(fx.limiter.check_rate_limit("ip", "auth", None).await.unwrap().allowed);
        assert!(!fx.limiter.check_rate_limit("ip", "api", None).await.unwrap().allowed);

        fx.limiter.reset_limit("ip", None).await.unwrap();
        assert!(fx.limiter.check_rate_limit("ip", "api", None).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_limit_leaves_longer_identifiers_alone() {
        let config = RateLimitConfigBuilder::new("api")
            .limit(1, 60)
            .penalty(600)
            .build();
        let fx = fixture(vec![config]);
        for identifier in ["user", "user:1"] {
            fx.limiter.check_rate_limit(identifier, "api", None).await.unwrap();
            let denied = fx.limiter.check_rate_limit(identifier, "api", None).await.unwrap();
            assert!(!denied.allowed);
        }

        let removed = fx.limiter.reset_limit("user", Some("api")).await.unwrap();
        assert_eq!(removed, 2);
        assert!(fx.limiter.check_rate_limit("user", "api", None).await.unwrap().allowed);

        let other = fx.limiter.check_rate_limit("user:1", "api", None).await.unwrap();
        assert!(!other.allowed);
        assert_eq!(other.reason, DecisionReason::Penalized);
    }

    #[tokio::test]
    async fn test_sliding_window_retry_after_covers_cost() {
        let fx = fixture(vec![sliding(3, 60)]);
        for _ in 0..3 {
            assert!(fx.limiter.check_rate_limit("u", "api", None).await.unwrap().allowed);
            fx.clock.advance_secs(10);
        }
        // t=30，需要t=0和t=10两个条目都滑出窗口
        let denied = fx.limiter.check_rate_limit("u", "api", Some(2)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.info.retry_after, Some(40));

        fx.clock.advance_secs(39);
        assert!(!fx.limiter.check_rate_limit("u", "api", Some(2)).await.unwrap().allowed);
        fx.clock.advance_secs(1);
        let allowed = fx.limiter.check_rate_limit("u", "api", Some(2)).await.unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.info.remaining, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_over_admit() {
        let configs = vec![
            RateLimitConfigBuilder::new("sw").limit(5, 60).build(),
            RateLimitConfigBuilder::new("fw")
                .strategy(RateLimitStrategy::FixedWindow)
                .limit(5, 3600)
                .build(),
            RateLimitConfigBuilder::new("tb")
                .strategy(RateLimitStrategy::TokenBucket)
                .limit(5, 3600)
                .build(),
            RateLimitConfigBuilder::new("lb")
                .strategy(RateLimitStrategy::LeakyBucket)
                .limit(5, 3600)
                .build(),
        ];
        let fx = fixture(configs);
        // 固定窗口从窗口起点开始，避免请求跨越边界
        let now_secs = fx.clock.now_millis() / 1000;
        fx.clock.advance_secs((3600 - now_secs % 3600) as u64);
        let limiter = Arc::new(fx.limiter);

        for config in ["sw", "fw", "tb", "lb"] {
            let mut calls = tokio::task::JoinSet::new();
            for _ in 0..32 {
                let limiter = limiter.clone();
                calls.spawn(async move {
                    limiter
                        .check_rate_limit("shared", config, None)
                        .await
                        .unwrap()
                        .allowed
                });
            }
            let mut admitted = 0;
            while let Some(allowed) = calls.join_next().await {
                if allowed.unwrap() {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 5, "{config}");
        }
    }

    #[tokio::test]
    async fn test_unknown_config_and_enforce() {
        let fx = fixture(vec![sliding(1, 60)]);
        let err = fx
            .limiter
            .check_rate_limit("u", "missing", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BulwarkError::UnknownRateLimitConfig { .. }));

        fx.limiter.enforce("u", "api", None).await.unwrap();
        let err = fx.limiter.enforce("u", "api", None).await.unwrap_err();
        assert!(matches!(err, BulwarkError::RateLimitExceeded { .. }));
        assert_eq!(err.retry_after_secs(), Some(60));
    }
}
