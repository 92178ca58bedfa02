//! 共享存储端口
//!
//! 所有跨实例共享的状态都经由这些trait访问。每个方法在存储层是原子的：
//! Redis实现使用单条命令或Lua脚本，内存实现在同一把锁内完成。
//! 调用方不得在应用层对共享计数器做“读-改-写”。

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use bulwark_errors::BulwarkResult;

use crate::circuit::{BreakerAcquire, BreakerRecord, BreakerUpdate};
use crate::rate_limit::{BucketOutcome, WindowOutcome};
use crate::value_objects::CircuitState;

/// 订阅收到的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

pub type EventStream = BoxStream<'static, StoreMessage>;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// 连通性检查
    async fn ping(&self) -> BulwarkResult<()>;
    async fn get(&self, key: &str) -> BulwarkResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BulwarkResult<()>;
    /// 仅当键不存在时写入，返回是否写入成功
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> BulwarkResult<bool>;
    async fn delete(&self, key: &str) -> BulwarkResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> BulwarkResult<bool>;
    /// 列出以`prefix`开头的键
    async fn keys_with_prefix(&self, prefix: &str) -> BulwarkResult<Vec<String>>;
}

#[async_trait]
pub trait ListStore: Send + Sync {
    /// 追加到尾部，返回追加后的长度
    async fn list_push(&self, key: &str, value: &str) -> BulwarkResult<u64>;
    /// 从头部弹出
    async fn list_pop(&self, key: &str) -> BulwarkResult<Option<String>>;
    /// 闭区间，负数下标从尾部计
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> BulwarkResult<Vec<String>>;
    /// 删除所有等于`value`的元素，返回删除个数
    async fn list_remove(&self, key: &str, value: &str) -> BulwarkResult<u64>;
    async fn list_len(&self, key: &str) -> BulwarkResult<u64>;
    /// 只保留闭区间内的元素
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> BulwarkResult<()>;
}

#[async_trait]
pub trait SortedSetStore: Send + Sync {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> BulwarkResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> BulwarkResult<bool>;
    async fn zcard(&self, key: &str) -> BulwarkResult<u64>;
    /// 按分数升序返回`[min, max]`内的成员
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> BulwarkResult<Vec<(String, f64)>>;
    /// 原子地取出并移除分数不超过`max_score`的成员，保证每个成员只被一个调用方领取
    async fn claim_due(&self, key: &str, max_score: f64, limit: usize) -> BulwarkResult<Vec<String>>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> BulwarkResult<()>;
    async fn subscribe(&self, channels: &[String]) -> BulwarkResult<EventStream>;
}

/// 限流算法的原子操作
///
/// 时间戳由调用方的时钟提供，保证各实现与测试时钟一致。
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// 固定窗口：`count + cost <= limit` 时计数增加`cost`；首次写入时设置TTL
    async fn fixed_window_acquire(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        ttl: Duration,
    ) -> BulwarkResult<WindowOutcome>;

    /// 滑动窗口：先清理时间戳`<= now - window`的条目，再按`count + cost <= limit`放行
    async fn sliding_window_acquire(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
        cost: u64,
    ) -> BulwarkResult<WindowOutcome>;

    /// 令牌桶：按`refill_per_sec`补充至`capacity`，足够时扣除`cost`
    async fn token_bucket_acquire(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        cost: f64,
        now_ms: i64,
        ttl: Duration,
    ) -> BulwarkResult<BucketOutcome>;

    /// 漏桶：水位按`leak_per_sec`下降，`level + cost <= capacity` 时加入
    async fn leaky_bucket_acquire(
        &self,
        key: &str,
        capacity: f64,
        leak_per_sec: f64,
        cost: f64,
        now_ms: i64,
        ttl: Duration,
    ) -> BulwarkResult<BucketOutcome>;
}

/// 熔断器状态的原子迁移
#[async_trait]
pub trait CircuitStateStore: Send + Sync {
    /// 读取记录，不存在时视为闭合
    async fn breaker_load(&self, name: &str) -> BulwarkResult<BreakerRecord>;

    /// 判定是否放行一次调用
    ///
    /// 打开状态满`reset_timeout_ms`后迁移到半开并授予探测许可；半开状态下
    /// 同一时间只有一个探测调用，探测租约过期后下一个调用方接替。
    async fn breaker_acquire(
        &self,
        name: &str,
        reset_timeout_ms: i64,
        now_ms: i64,
    ) -> BulwarkResult<BreakerAcquire>;

    /// 闭合状态下清零连续失败计数；半开状态下闭合并重置计数
    async fn breaker_record_success(&self, name: &str, now_ms: i64) -> BulwarkResult<BreakerUpdate>;

    /// 闭合状态下失败计数加一，达到`fail_max`时打开；半开状态下重新打开
    async fn breaker_record_failure(
        &self,
        name: &str,
        fail_max: u32,
        now_ms: i64,
    ) -> BulwarkResult<BreakerUpdate>;

    /// 强制迁移，迁移到闭合时重置计数
    async fn breaker_force(
        &self,
        name: &str,
        state: CircuitState,
        now_ms: i64,
    ) -> BulwarkResult<BreakerUpdate>;
}

/// 组件依赖的完整存储能力
pub trait Store:
    KeyValueStore + ListStore + SortedSetStore + EventBus + RateLimitStore + CircuitStateStore
{
}

impl<T> Store for T where
    T: KeyValueStore + ListStore + SortedSetStore + EventBus + RateLimitStore + CircuitStateStore
{
}
