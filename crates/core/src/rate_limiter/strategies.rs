//! 五种限流算法
//!
//! 每个算法只做一次原子的存储调用，再由返回的计数或水位推导配额元数据。

use std::time::Duration;

use bulwark_config::{RateLimitConfig, RateLimitStrategy};
use bulwark_domain::{RateLimitInfo, Store};
use bulwark_errors::BulwarkResult;

/// 限流记录的键
///
/// 配置名和标识都可能含有`:`，因此每段以字节长度开头（`rl:3:api:6:user:1`），
/// 保证一个标识的前缀不会匹配到另一个标识的键，例如`user`与`user:1`。
#[derive(Debug, Clone)]
pub struct LimitKeys {
    base: String,
}

fn segment(value: &str) -> String {
    format!("{}:{value}", value.len())
}

impl LimitKeys {
    pub fn new(config: &str, identifier: &str) -> Self {
        Self {
            base: format!("rl:{}:{}", segment(config), segment(identifier)),
        }
    }

    /// 该标识在该配置下所有记录的公共前缀，不与其他标识共享
    pub fn prefix(&self) -> String {
        format!("{}:", self.base)
    }

    pub fn fixed_window(&self, window_start_secs: i64) -> String {
        format!("{}:fw:{window_start_secs}", self.base)
    }

    pub fn sliding_window(&self) -> String {
        format!("{}:sw", self.base)
    }

    pub fn token_bucket(&self) -> String {
        format!("{}:tb", self.base)
    }

    pub fn leaky_bucket(&self) -> String {
        format!("{}:lb", self.base)
    }

    pub fn penalty(&self) -> String {
        format!("{}:penalty", self.base)
    }
}

/// 算法的判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyOutcome {
    pub allowed: bool,
    pub info: RateLimitInfo,
}

/// 毫秒向上取整为秒，至少为1
pub fn ceil_secs(millis: i64) -> u64 {
    (millis.max(0) as u64).div_ceil(1000).max(1)
}

fn ceil_secs_f64(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        secs.ceil() as u64
    } else {
        0
    }
}

/// 按配置的算法执行一次判定
///
/// `limit`是本次生效的窗口配额，自适应算法已按负载缩放。
pub async fn evaluate(
    store: &dyn Store,
    config: &RateLimitConfig,
    keys: &LimitKeys,
    cost: u64,
    limit: u64,
    now_ms: i64,
) -> BulwarkResult<StrategyOutcome> {
    match config.strategy {
        RateLimitStrategy::FixedWindow => fixed_window(store, config, keys, cost, limit, now_ms).await,
        RateLimitStrategy::SlidingWindow | RateLimitStrategy::Adaptive => {
            sliding_window(store, config, keys, cost, limit, now_ms).await
        }
        RateLimitStrategy::TokenBucket => token_bucket(store, config, keys, cost, now_ms).await,
        RateLimitStrategy::LeakyBucket => leaky_bucket(store, config, keys, cost, now_ms).await,
    }
}

async fn fixed_window(
    store: &dyn Store,
    config: &RateLimitConfig,
    keys: &LimitKeys,
    cost: u64,
    limit: u64,
    now_ms: i64,
) -> BulwarkResult<StrategyOutcome> {
    let window_secs = config.window_seconds.max(1) as i64;
    let now_secs = now_ms.div_euclid(1000);
    let window_start = now_secs - now_secs.rem_euclid(window_secs);
    let window_end_ms = (window_start + window_secs) * 1000;
    let ttl = Duration::from_millis((window_end_ms - now_ms).max(1000) as u64);

    let outcome = store
        .fixed_window_acquire(&keys.fixed_window(window_start), cost, limit, ttl)
        .await?;

    Ok(StrategyOutcome {
        allowed: outcome.allowed,
        info: RateLimitInfo {
            limit,
            remaining: limit.saturating_sub(outcome.count),
            reset: window_start + window_secs,
            retry_after: (!outcome.allowed).then(|| ceil_secs(window_end_ms - now_ms)),
        },
    })
}

async fn sliding_window(
    store: &dyn Store,
    config: &RateLimitConfig,
    keys: &LimitKeys,
    cost: u64,
    limit: u64,
    now_ms: i64,
) -> BulwarkResult<StrategyOutcome> {
    let window_ms = config.window_seconds as i64 * 1000;
    let outcome = store
        .sliding_window_acquire(&keys.sliding_window(), now_ms, window_ms, limit, cost)
        .await?;

    // 被拒绝时等到足够多的条目滑出窗口，放行时为下一个名额释放的时间
    let frees_at_ms = outcome.release_ms.unwrap_or(now_ms) + window_ms;
    Ok(StrategyOutcome {
        allowed: outcome.allowed,
        info: RateLimitInfo {
            limit,
            remaining: limit.saturating_sub(outcome.count),
            reset: (frees_at_ms + 999).div_euclid(1000),
            retry_after: (!outcome.allowed).then(|| ceil_secs(frees_at_ms - now_ms)),
        },
    })
}

fn bucket_ttl(capacity: f64, rate: f64) -> Duration {
    Duration::from_secs(ceil_secs_f64(capacity / rate) + 1)
}

async fn token_bucket(
    store: &dyn Store,
    config: &RateLimitConfig,
    keys: &LimitKeys,
    cost: u64,
    now_ms: i64,
) -> BulwarkResult<StrategyOutcome> {
    let capacity = config.effective_burst() as f64;
    let rate = config.refill_rate();
    let outcome = store
        .token_bucket_acquire(
            &keys.token_bucket(),
            capacity,
            rate,
            cost as f64,
            now_ms,
            bucket_ttl(capacity, rate),
        )
        .await?;

    let tokens = outcome.level.max(0.0);
    let now_secs = now_ms.div_euclid(1000);
    Ok(StrategyOutcome {
        allowed: outcome.allowed,
        info: RateLimitInfo {
            limit: config.effective_burst(),
            remaining: tokens.floor() as u64,
            reset: now_secs + ceil_secs_f64((capacity - tokens) / rate) as i64,
            retry_after: (!outcome.allowed)
                .then(|| ceil_secs_f64((cost as f64 - tokens) / rate).max(1)),
        },
    })
}

async fn leaky_bucket(
    store: &dyn Store,
    config: &RateLimitConfig,
    keys: &LimitKeys,
    cost: u64,
    now_ms: i64,
) -> BulwarkResult<StrategyOutcome> {
    let capacity = config.effective_burst() as f64;
    let rate = config.refill_rate();
    let outcome = store
        .leaky_bucket_acquire(
            &keys.leaky_bucket(),
            capacity,
            rate,
            cost as f64,
            now_ms,
            bucket_ttl(capacity, rate),
        )
        .await?;

    let level = outcome.level.clamp(0.0, capacity);
    let now_secs = now_ms.div_euclid(1000);
    Ok(StrategyOutcome {
        allowed: outcome.allowed,
        info: RateLimitInfo {
            limit: config.effective_burst(),
            remaining: (capacity - level).floor() as u64,
            reset: now_secs + ceil_secs_f64(level / rate) as i64,
            retry_after: (!outcome.allowed)
                .then(|| ceil_secs_f64((level + cost as f64 - capacity) / rate).max(1)),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_prefix() {
        let keys = LimitKeys::new("api", "user:1");
        let prefix = keys.prefix();
        assert_eq!(prefix, "rl:3:api:6:user:1:");
        for key in [
            keys.fixed_window(1_700_000_000),
            keys.sliding_window(),
            keys.token_bucket(),
            keys.leaky_bucket(),
            keys.penalty(),
        ] {
            assert!(key.starts_with(&prefix), "{key}");
        }
    }

    #[test]
    fn test_prefix_does_not_cover_longer_identifiers() {
        let short = LimitKeys::new("api", "user").prefix();
        for other in [
            LimitKeys::new("api", "user:1"),
            LimitKeys::new("api", "user:fw"),
            LimitKeys::new("api", "username"),
        ] {
            for key in [
                other.fixed_window(60),
                other.sliding_window(),
                other.token_bucket(),
                other.leaky_bucket(),
                other.penalty(),
            ] {
                assert!(!key.starts_with(&short), "{key}");
            }
        }
        assert!(!LimitKeys::new("api:4", "x")
            .sliding_window()
            .starts_with(&LimitKeys::new("api", "4").prefix()));
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(0), 1);
        assert_eq!(ceil_secs(-5), 1);
        assert_eq!(ceil_secs(1), 1);
        assert_eq!(ceil_secs(1000), 1);
        assert_eq!(ceil_secs(1001), 2);
        assert_eq!(ceil_secs(59_500), 60);
    }

    #[test]
    fn test_bucket_ttl_covers_full_refill() {
        assert_eq!(bucket_ttl(10.0, 2.0), Duration::from_secs(6));
        assert_eq!(bucket_ttl(10.0, 4.0), Duration::from_secs(4));
    }
}
