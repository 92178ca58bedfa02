//! 限流判定结果

use serde::{Deserialize, Serialize};

/// 配额元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// 配额完全恢复的时间（Unix秒）
    pub reset: i64,
    /// 被拒绝时建议的等待秒数，至少为1
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    WithinLimit,
    Whitelisted,
    Blacklisted,
    Penalized,
    LimitExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub info: RateLimitInfo,
}

impl RateLimitDecision {
    pub fn allow(reason: DecisionReason, info: RateLimitInfo) -> Self {
        Self {
            allowed: true,
            reason,
            info,
        }
    }

    pub fn deny(reason: DecisionReason, info: RateLimitInfo) -> Self {
        Self {
            allowed: false,
            reason,
            info,
        }
    }
}

/// 窗口类算法的原子执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// 执行后窗口内的计数
    pub count: u64,
    /// 滑动窗口中决定下一次放行时间的条目时间戳（毫秒）
    ///
    /// 被拒绝时是第`count + cost - limit`早的条目，它滑出窗口后本次请求即可放行；
    /// 放行时是最早的条目。
    pub release_ms: Option<i64>,
}

/// 桶类算法的原子执行结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// 令牌桶为剩余令牌，漏桶为当前水位
    pub level: f64,
}
