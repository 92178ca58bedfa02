mod scripts;

pub use scripts::StoreScripts;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use std::time::Duration;
use tracing::{debug, error, info};

use bulwark_config::StoreConfig;
use bulwark_domain::{
    BreakerAcquire, BreakerPermit, BreakerRecord, BreakerUpdate, BucketOutcome, CircuitState,
    CircuitStateStore, EventBus, EventStream, KeyValueStore, ListStore, RateLimitStore,
    SortedSetStore, StateTransition, StoreMessage, WindowOutcome,
};
use bulwark_errors::{BulwarkError, BulwarkResult};

fn store_error(operation: &'static str) -> impl Fn(RedisError) -> BulwarkError {
    move |e| BulwarkError::Store(format!("Redis {operation} failed: {e}"))
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// 转义SCAN MATCH中的通配符
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Redis存储实现
///
/// 普通命令经由`ConnectionManager`（断线自动重连）；复合操作使用Lua脚本保证原子性；
/// 订阅使用独立的pub/sub连接。所有键加上配置的前缀，事件通道名不加前缀。
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    key_prefix: String,
    scripts: StoreScripts,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> BulwarkResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            BulwarkError::Store(format!("Failed to create Redis client: {e}"))
        })?;

        let timeout = Duration::from_secs(config.connection_timeout_seconds);
        let connection = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                BulwarkError::Store(format!(
                    "Timed out connecting to Redis after {}s",
                    config.connection_timeout_seconds
                ))
            })?
            .map_err(store_error("connect"))?;

        let store = Self {
            client,
            connection,
            key_prefix: config.key_prefix.clone(),
            scripts: StoreScripts::new(),
        };
        store.ping().await?;
        info!(prefix = %store.key_prefix, "Redis存储连接成功");
        Ok(store)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn breaker_key(&self, name: &str) -> String {
        self.key(&format!("cb:{name}"))
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    async fn run_breaker_script(
        &self,
        script: &redis::Script,
        name: &str,
        args: &[String],
    ) -> BulwarkResult<BreakerReply> {
        let mut conn = self.conn();
        let mut invocation = script.key(self.breaker_key(name));
        for arg in args {
            invocation.arg(arg.as_str());
        }
        let values: Vec<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("breaker script"))?;
        BreakerReply::parse(&values)
    }
}

/// 熔断器脚本的应答
struct BreakerReply {
    permit: String,
    retry_after_ms: i64,
    from: CircuitState,
    record: BreakerRecord,
}

impl BreakerReply {
    fn parse(values: &[String]) -> BulwarkResult<Self> {
        if values.len() != 9 {
            return Err(BulwarkError::Store(format!(
                "熔断器脚本应答长度异常: {}",
                values.len()
            )));
        }
        let optional = |raw: &str| -> BulwarkResult<Option<i64>> {
            if raw.is_empty() {
                return Ok(None);
            }
            raw.parse::<i64>()
                .map(Some)
                .map_err(|e| BulwarkError::Store(format!("熔断器字段无法解析: {raw} ({e})")))
        };
        let counter = |raw: &str| -> BulwarkResult<u32> {
            raw.parse::<u32>()
                .map_err(|e| BulwarkError::Store(format!("熔断器计数无法解析: {raw} ({e})")))
        };

        Ok(Self {
            permit: values[0].clone(),
            retry_after_ms: optional(&values[1])?.unwrap_or(0),
            from: values[2].parse()?,
            record: BreakerRecord {
                state: values[3].parse()?,
                fail_counter: counter(&values[4])?,
                success_counter: counter(&values[5])?,
                opened_at_ms: optional(&values[6])?,
                last_failure_ms: optional(&values[7])?,
                trial_started_ms: optional(&values[8])?,
            },
        })
    }

    fn transition(&self) -> Option<StateTransition> {
        (self.from != self.record.state).then_some(StateTransition {
            from: self.from,
            to: self.record.state,
        })
    }

    fn into_update(self) -> BreakerUpdate {
        BreakerUpdate {
            transition: self.transition(),
            record: self.record,
        }
    }

    fn into_acquire(self) -> BulwarkResult<BreakerAcquire> {
        let permit = match self.permit.as_str() {
            "admitted" => BreakerPermit::Admitted,
            "trial" => BreakerPermit::Trial,
            "rejected" => BreakerPermit::Rejected {
                retry_after_ms: self.retry_after_ms,
            },
            other => {
                return Err(BulwarkError::Store(format!("未知的熔断器许可: {other}")));
            }
        };
        Ok(BreakerAcquire {
            permit,
            transition: self.transition(),
            record: self.record,
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn ping(&self) -> BulwarkResult<()> {
        let mut conn = self.conn();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error("PING"))?;
        if response != "PONG" {
            let message = format!("Unexpected PING response: {response}");
            error!("{}", message);
            return Err(BulwarkError::Store(message));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> BulwarkResult<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error("GET"))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BulwarkResult<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(store_error("SET"))?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> BulwarkResult<bool> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(store_error("SET NX"))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> BulwarkResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error("DEL"))?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> BulwarkResult<bool> {
        let mut conn = self.conn();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error("PEXPIRE"))?;
        Ok(updated == 1)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> BulwarkResult<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(store_error("SCAN"))?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&self.key_prefix).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl ListStore for RedisStore {
    async fn list_push(&self, key: &str, value: &str) -> BulwarkResult<u64> {
        let mut conn = self.conn();
        redis::cmd("RPUSH")
            .arg(self.key(key))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(store_error("RPUSH"))
    }

    async fn list_pop(&self, key: &str) -> BulwarkResult<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("LPOP")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error("LPOP"))
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> BulwarkResult<Vec<String>> {
        let mut conn = self.conn();
        redis::cmd("LRANGE")
            .arg(self.key(key))
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(store_error("LRANGE"))
    }

    async fn list_remove(&self, key: &str, value: &str) -> BulwarkResult<u64> {
        let mut conn = self.conn();
        redis::cmd("LREM")
            .arg(self.key(key))
            .arg(0)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(store_error("LREM"))
    }

    async fn list_len(&self, key: &str) -> BulwarkResult<u64> {
        let mut conn = self.conn();
        redis::cmd("LLEN")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error("LLEN"))
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> BulwarkResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("LTRIM")
            .arg(self.key(key))
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(store_error("LTRIM"))?;
        Ok(())
    }
}

#[async_trait]
impl SortedSetStore for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> BulwarkResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.key(key))
            .arg(score_arg(score))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error("ZADD"))?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> BulwarkResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.key(key))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error("ZREM"))?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> BulwarkResult<u64> {
        let mut conn = self.conn();
        redis::cmd("ZCARD")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error("ZCARD"))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> BulwarkResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(self.key(key))
            .arg(score_arg(min))
            .arg(score_arg(max))
            .arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(store_error("ZRANGEBYSCORE"))
    }

    async fn claim_due(&self, key: &str, max_score: f64, limit: usize) -> BulwarkResult<Vec<String>> {
        let mut conn = self.conn();
        self.scripts
            .claim_due
            .key(self.key(key))
            .arg(score_arg(max_score))
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("claim_due script"))
    }
}

#[async_trait]
impl EventBus for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> BulwarkResult<()> {
        let mut conn = self.conn();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(store_error("PUBLISH"))?;
        debug!(channel, receivers, "事件已发布");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> BulwarkResult<EventStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(store_error("pubsub connect"))?;
        for channel in channels {
            pubsub
                .subscribe(channel.as_str())
                .await
                .map_err(store_error("SUBSCRIBE"))?;
        }
        info!(?channels, "已订阅事件通道");

        let stream = pubsub.into_on_message().filter_map(|message| async move {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "无法解析订阅消息");
                    return None;
                }
            };
            Some(StoreMessage {
                channel: message.get_channel_name().to_string(),
                payload,
            })
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn fixed_window_acquire(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        ttl: Duration,
    ) -> BulwarkResult<WindowOutcome> {
        let mut conn = self.conn();
        let (allowed, count): (i64, u64) = self
            .scripts
            .fixed_window
            .key(self.key(key))
            .arg(cost)
            .arg(limit)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("fixed window script"))?;
        Ok(WindowOutcome {
            allowed: allowed == 1,
            count,
            release_ms: None,
        })
    }

    async fn sliding_window_acquire(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
        cost: u64,
    ) -> BulwarkResult<WindowOutcome> {
        let mut conn = self.conn();
        let member_prefix = uuid::Uuid::new_v4().simple().to_string();
        let (allowed, count, release): (i64, u64, i64) = self
            .scripts
            .sliding_window
            .key(self.key(key))
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(cost)
            .arg(member_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("sliding window script"))?;
        Ok(WindowOutcome {
            allowed: allowed == 1,
            count,
            release_ms: (release >= 0).then_some(release),
        })
    }

    async fn token_bucket_acquire(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        cost: f64,
        now_ms: i64,
        ttl: Duration,
    ) -> BulwarkResult<BucketOutcome> {
        let mut conn = self.conn();
        let (allowed, level): (i64, String) = self
            .scripts
            .token_bucket
            .key(self.key(key))
            .arg(capacity)
            .arg(refill_per_sec)
            .arg(cost)
            .arg(now_ms)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("token bucket script"))?;
        Ok(BucketOutcome {
            allowed: allowed == 1,
            level: parse_level(&level)?,
        })
    }

    async fn leaky_bucket_acquire(
        &self,
        key: &str,
        capacity: f64,
        leak_per_sec: f64,
        cost: f64,
        now_ms: i64,
        ttl: Duration,
    ) -> BulwarkResult<BucketOutcome> {
        let mut conn = self.conn();
        let (allowed, level): (i64, String) = self
            .scripts
            .leaky_bucket
            .key(self.key(key))
            .arg(capacity)
            .arg(leak_per_sec)
            .arg(cost)
            .arg(now_ms)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("leaky bucket script"))?;
        Ok(BucketOutcome {
            allowed: allowed == 1,
            level: parse_level(&level)?,
        })
    }
}

fn parse_level(raw: &str) -> BulwarkResult<f64> {
    raw.parse::<f64>()
        .map_err(|e| BulwarkError::Store(format!("桶水位无法解析: {raw} ({e})")))
}

#[async_trait]
impl CircuitStateStore for RedisStore {
    async fn breaker_load(&self, name: &str) -> BulwarkResult<BreakerRecord> {
        let reply = self
            .run_breaker_script(&self.scripts.breaker_load, name, &[])
            .await?;
        Ok(reply.record)
    }

    async fn breaker_acquire(
        &self,
        name: &str,
        reset_timeout_ms: i64,
        now_ms: i64,
    ) -> BulwarkResult<BreakerAcquire> {
        self.run_breaker_script(
            &self.scripts.breaker_acquire,
            name,
            &[reset_timeout_ms.to_string(), now_ms.to_string()],
        )
        .await?
        .into_acquire()
    }

    async fn breaker_record_success(&self, name: &str, now_ms: i64) -> BulwarkResult<BreakerUpdate> {
        Ok(self
            .run_breaker_script(&self.scripts.breaker_success, name, &[now_ms.to_string()])
            .await?
            .into_update())
    }

    async fn breaker_record_failure(
        &self,
        name: &str,
        fail_max: u32,
        now_ms: i64,
    ) -> BulwarkResult<BreakerUpdate> {
        Ok(self
            .run_breaker_script(
                &self.scripts.breaker_failure,
                name,
                &[fail_max.to_string(), now_ms.to_string()],
            )
            .await?
            .into_update())
    }

    async fn breaker_force(
        &self,
        name: &str,
        state: CircuitState,
        now_ms: i64,
    ) -> BulwarkResult<BreakerUpdate> {
        Ok(self
            .run_breaker_script(
                &self.scripts.breaker_force,
                name,
                &[state.as_str().to_string(), now_ms.to_string()],
            )
            .await?
            .into_update())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("rl:api:user*1"), "rl:api:user\\*1");
        assert_eq!(escape_glob("plain"), "plain");
    }

    #[test]
    fn test_score_arg_infinity() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(1500.0), "1500");
    }

    #[test]
    fn test_breaker_reply_parse() {
        let values: Vec<String> = [
            "rejected", "1500", "open", "open", "3", "0", "1000", "1000", "",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let acquire = BreakerReply::parse(&values).unwrap().into_acquire().unwrap();
        assert_eq!(
            acquire.permit,
            BreakerPermit::Rejected {
                retry_after_ms: 1500
            }
        );
        assert_eq!(acquire.transition, None);
        assert_eq!(acquire.record.fail_counter, 3);
        assert_eq!(acquire.record.trial_started_ms, None);
    }

    #[test]
    fn test_breaker_reply_detects_transition() {
        let values: Vec<String> = [
            "none", "0", "half_open", "closed", "0", "0", "", "", "",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let update = BreakerReply::parse(&values).unwrap().into_update();
        assert_eq!(
            update.transition,
            Some(StateTransition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Closed
            })
        );
    }

    #[test]
    fn test_breaker_reply_rejects_short_reply() {
        assert!(BreakerReply::parse(&["none".to_string()]).is_err());
    }
}
