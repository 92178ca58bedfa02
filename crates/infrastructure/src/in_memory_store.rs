use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use bulwark_domain::{
    BreakerAcquire, BreakerRecord, BreakerUpdate, BucketOutcome, CircuitState, CircuitStateStore,
    Clock, EventBus, EventStream, KeyValueStore, ListStore, RateLimitStore, SortedSetStore,
    StoreMessage, WindowOutcome,
};
use bulwark_errors::{BulwarkError, BulwarkResult};

/// 内存存储实现
///
/// 语义与Redis实现保持一致：每个操作在同一把锁内完成，TTL按注入的时钟惰性过期。
/// 适用于单实例嵌入式部署与测试，多实例部署必须使用Redis。
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<StoreMessage>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
}

#[derive(Debug, Default)]
struct MemoryState {
    slots: HashMap<String, Slot>,
}

#[derive(Debug)]
struct Slot {
    value: SlotValue,
    expires_at_ms: Option<i64>,
}

#[derive(Debug)]
enum SlotValue {
    Text(String),
    List(VecDeque<String>),
    /// 按(分数, 成员)升序排列
    SortedSet(Vec<(String, f64)>),
    Bucket { level: f64, last_ms: i64 },
    Breaker(BreakerRecord),
}

impl SlotValue {
    fn kind(&self) -> &'static str {
        match self {
            SlotValue::Text(_) => "string",
            SlotValue::List(_) => "list",
            SlotValue::SortedSet(_) => "zset",
            SlotValue::Bucket { .. } => "bucket",
            SlotValue::Breaker(_) => "breaker",
        }
    }
}

fn wrong_type(key: &str, expected: &str, actual: &str) -> BulwarkError {
    BulwarkError::store_error(format!(
        "WRONGTYPE 键 {key} 的类型为 {actual}，期望 {expected}"
    ))
}

fn ttl_deadline(now_ms: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms + ttl.as_millis().max(1) as i64)
}

/// 与Redis一致的闭区间下标换算，负数从尾部计
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl MemoryState {
    /// 返回未过期的槽位，过期的顺带删除
    fn live(&mut self, key: &str, now_ms: i64) -> Option<&mut Slot> {
        let expired = matches!(
            self.slots.get(key),
            Some(Slot { expires_at_ms: Some(deadline), .. }) if *deadline <= now_ms
        );
        if expired {
            self.slots.remove(key);
            return None;
        }
        self.slots.get_mut(key)
    }

    fn list_mut(&mut self, key: &str, now_ms: i64) -> BulwarkResult<Option<&mut VecDeque<String>>> {
        match self.live(key, now_ms) {
            None => Ok(None),
            Some(Slot { value: SlotValue::List(list), .. }) => Ok(Some(list)),
            Some(slot) => Err(wrong_type(key, "list", slot.value.kind())),
        }
    }

    fn zset_mut(
        &mut self,
        key: &str,
        now_ms: i64,
    ) -> BulwarkResult<Option<&mut Vec<(String, f64)>>> {
        match self.live(key, now_ms) {
            None => Ok(None),
            Some(Slot { value: SlotValue::SortedSet(set), .. }) => Ok(Some(set)),
            Some(slot) => Err(wrong_type(key, "zset", slot.value.kind())),
        }
    }

    fn text(&mut self, key: &str, now_ms: i64) -> BulwarkResult<Option<String>> {
        match self.live(key, now_ms) {
            None => Ok(None),
            Some(Slot { value: SlotValue::Text(text), .. }) => Ok(Some(text.clone())),
            Some(slot) => Err(wrong_type(key, "string", slot.value.kind())),
        }
    }

    fn breaker(&mut self, key: &str, now_ms: i64) -> BulwarkResult<&mut BreakerRecord> {
        if self.live(key, now_ms).is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: SlotValue::Breaker(BreakerRecord::default()),
                    expires_at_ms: None,
                },
            );
        }
        match self.slots.get_mut(key) {
            Some(Slot { value: SlotValue::Breaker(record), .. }) => Ok(record),
            Some(slot) => Err(wrong_type(key, "breaker", slot.value.kind())),
            None => Err(BulwarkError::Internal(format!("熔断器记录丢失: {key}"))),
        }
    }

    fn bucket(
        &mut self,
        key: &str,
        now_ms: i64,
        initial_level: f64,
    ) -> BulwarkResult<(f64, i64)> {
        match self.live(key, now_ms) {
            None => Ok((initial_level, now_ms)),
            Some(Slot { value: SlotValue::Bucket { level, last_ms }, .. }) => Ok((*level, *last_ms)),
            Some(slot) => Err(wrong_type(key, "bucket", slot.value.kind())),
        }
    }

    fn put(&mut self, key: &str, value: SlotValue, expires_at_ms: Option<i64>) {
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at_ms,
            },
        );
    }

    fn zset_insert(set: &mut Vec<(String, f64)>, member: &str, score: f64) {
        set.retain(|(m, _)| m != member);
        let position = set.partition_point(|(m, s)| {
            *s < score || (*s == score && m.as_str() < member)
        });
        set.insert(position, (member.to_string(), score));
    }
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            clock,
            sequence: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_millis()
    }

    /// 当前未过期的键数量
    pub fn len(&self) -> usize {
        let now = self.now_ms();
        self.state()
            .slots
            .values()
            .filter(|slot| slot.expires_at_ms.map_or(true, |deadline| deadline > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn ping(&self) -> BulwarkResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> BulwarkResult<Option<String>> {
        let now = self.now_ms();
        self.state().text(key, now)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BulwarkResult<()> {
        let now = self.now_ms();
        self.state()
            .put(key, SlotValue::Text(value.to_string()), ttl_deadline(now, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> BulwarkResult<bool> {
        let now = self.now_ms();
        let mut state = self.state();
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.put(key, SlotValue::Text(value.to_string()), ttl_deadline(now, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> BulwarkResult<bool> {
        let now = self.now_ms();
        let mut state = self.state();
        let existed = state.live(key, now).is_some();
        state.slots.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> BulwarkResult<bool> {
        let now = self.now_ms();
        match self.state().live(key, now) {
            Some(slot) => {
                slot.expires_at_ms = ttl_deadline(now, Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> BulwarkResult<Vec<String>> {
        let now = self.now_ms();
        let state = self.state();
        let mut keys: Vec<String> = state
            .slots
            .iter()
            .filter(|(key, slot)| {
                key.starts_with(prefix) && slot.expires_at_ms.map_or(true, |d| d > now)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ListStore for InMemoryStore {
    async fn list_push(&self, key: &str, value: &str) -> BulwarkResult<u64> {
        let now = self.now_ms();
        let mut state = self.state();
        if let Some(list) = state.list_mut(key, now)? {
            list.push_back(value.to_string());
            return Ok(list.len() as u64);
        }
        state.put(key, SlotValue::List(VecDeque::from([value.to_string()])), None);
        Ok(1)
    }

    async fn list_pop(&self, key: &str) -> BulwarkResult<Option<String>> {
        let now = self.now_ms();
        let mut state = self.state();
        let Some(list) = state.list_mut(key, now)? else {
            return Ok(None);
        };
        let value = list.pop_front();
        if list.is_empty() {
            state.slots.remove(key);
        }
        Ok(value)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> BulwarkResult<Vec<String>> {
        let now = self.now_ms();
        let mut state = self.state();
        let Some(list) = state.list_mut(key, now)? else {
            return Ok(Vec::new());
        };
        Ok(match normalize_range(start, stop, list.len()) {
            Some((start, stop)) => list.range(start..=stop).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn list_remove(&self, key: &str, value: &str) -> BulwarkResult<u64> {
        let now = self.now_ms();
        let mut state = self.state();
        let Some(list) = state.list_mut(key, now)? else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            state.slots.remove(key);
        }
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> BulwarkResult<u64> {
        let now = self.now_ms();
        Ok(self
            .state()
            .list_mut(key, now)?
            .map(|list| list.len() as u64)
            .unwrap_or(0))
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> BulwarkResult<()> {
        let now = self.now_ms();
        let mut state = self.state();
        let Some(list) = state.list_mut(key, now)? else {
            return Ok(());
        };
        match normalize_range(start, stop, list.len()) {
            Some((start, stop)) => {
                let kept: VecDeque<String> = list.drain(start..=stop).collect();
                *list = kept;
            }
            None => {
                state.slots.remove(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SortedSetStore for InMemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> BulwarkResult<()> {
        let now = self.now_ms();
        let mut state = self.state();
        if let Some(set) = state.zset_mut(key, now)? {
            MemoryState::zset_insert(set, member, score);
            return Ok(());
        }
        state.put(
            key,
            SlotValue::SortedSet(vec![(member.to_string(), score)]),
            None,
        );
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> BulwarkResult<bool> {
        let now = self.now_ms();
        let mut state = self.state();
        let Some(set) = state.zset_mut(key, now)? else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|(m, _)| m != member);
        Ok(set.len() < before)
    }

    async fn zcard(&self, key: &str) -> BulwarkResult<u64> {
        let now = self.now_ms();
        Ok(self
            .state()
            .zset_mut(key, now)?
            .map(|set| set.len() as u64)
            .unwrap_or(0))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> BulwarkResult<Vec<(String, f64)>> {
        let now = self.now_ms();
        let mut state = self.state();
        let Some(set) = state.zset_mut(key, now)? else {
            return Ok(Vec::new());
        };
        Ok(set
            .iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn claim_due(&self, key: &str, max_score: f64, limit: usize) -> BulwarkResult<Vec<String>> {
        let now = self.now_ms();
        let mut state = self.state();
        let Some(set) = state.zset_mut(key, now)? else {
            return Ok(Vec::new());
        };
        let due = set
            .iter()
            .take_while(|(_, score)| *score <= max_score)
            .take(limit)
            .count();
        Ok(set.drain(..due).map(|(member, _)| member).collect())
    }
}

#[async_trait]
impl EventBus for InMemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> BulwarkResult<()> {
        let message = StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // 没有订阅者时发送失败，与Redis PUBLISH返回0的语义相同
        if self.events.send(message).is_err() {
            debug!(channel, "事件发布时没有订阅者");
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> BulwarkResult<EventStream> {
        let wanted: HashSet<String> = channels.iter().cloned().collect();
        let receiver = self.events.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "订阅者处理过慢，丢弃部分事件");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| futures::future::ready(wanted.contains(&message.channel)));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn fixed_window_acquire(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        ttl: Duration,
    ) -> BulwarkResult<WindowOutcome> {
        let now = self.now_ms();
        let mut state = self.state();
        let current = match state.text(key, now)? {
            Some(text) => text
                .parse::<u64>()
                .map_err(|e| BulwarkError::store_error(format!("计数器 {key} 不是整数: {e}")))?,
            None => 0,
        };
        if current + cost > limit {
            return Ok(WindowOutcome {
                allowed: false,
                count: current,
                release_ms: None,
            });
        }
        let count = current + cost;
        if cost > 0 {
            let deadline = match state.live(key, now) {
                Some(slot) => slot.expires_at_ms,
                None => ttl_deadline(now, Some(ttl)),
            };
            state.put(key, SlotValue::Text(count.to_string()), deadline);
        }
        Ok(WindowOutcome {
            allowed: true,
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
        let clock_now = self.now_ms();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        let cutoff = (now_ms - window_ms) as f64;

        let mut entries = state.zset_mut(key, clock_now)?.map(std::mem::take).unwrap_or_default();
        entries.retain(|(_, score)| *score > cutoff);

        let mut count = entries.len() as u64;
        let allowed = count + cost <= limit;
        if allowed {
            for i in 0..cost {
                MemoryState::zset_insert(&mut entries, &format!("{now_ms}:{sequence}:{i}"), now_ms as f64);
            }
            count += cost;
        }
        let needed = if allowed {
            1
        } else {
            (count + cost).saturating_sub(limit).max(1)
        };
        let release_ms = entries
            .get((needed.min(entries.len() as u64) as usize).saturating_sub(1))
            .map(|(_, score)| *score as i64);
        if entries.is_empty() {
            state.slots.remove(key);
        } else {
            state.put(
                key,
                SlotValue::SortedSet(entries),
                Some(clock_now + window_ms.max(1)),
            );
        }
        Ok(WindowOutcome {
            allowed,
            count,
            release_ms,
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
        let clock_now = self.now_ms();
        let mut state = self.state();
        let (tokens, last_ms) = state.bucket(key, clock_now, capacity)?;
        let elapsed = (now_ms - last_ms).max(0) as f64 / 1000.0;
        let mut tokens = (tokens + elapsed * refill_per_sec).min(capacity);
        let allowed = tokens >= cost;
        if allowed {
            tokens -= cost;
        }
        state.put(
            key,
            SlotValue::Bucket {
                level: tokens,
                last_ms: now_ms.max(last_ms),
            },
            ttl_deadline(clock_now, Some(ttl)),
        );
        Ok(BucketOutcome {
            allowed,
            level: tokens,
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
        let clock_now = self.now_ms();
        let mut state = self.state();
        let (level, last_ms) = state.bucket(key, clock_now, 0.0)?;
        let elapsed = (now_ms - last_ms).max(0) as f64 / 1000.0;
        let mut level = (level - elapsed * leak_per_sec).max(0.0);
        let allowed = level + cost <= capacity;
        if allowed {
            level += cost;
        }
        state.put(
            key,
            SlotValue::Bucket {
                level,
                last_ms: now_ms.max(last_ms),
            },
            ttl_deadline(clock_now, Some(ttl)),
        );
        Ok(BucketOutcome { allowed, level })
    }
}

fn breaker_key(name: &str) -> String {
    format!("cb:{name}")
}

#[async_trait]
impl CircuitStateStore for InMemoryStore {
    async fn breaker_load(&self, name: &str) -> BulwarkResult<BreakerRecord> {
        let now = self.now_ms();
        let mut state = self.state();
        Ok(*state.breaker(&breaker_key(name), now)?)
    }

    async fn breaker_acquire(
        &self,
        name: &str,
        reset_timeout_ms: i64,
        now_ms: i64,
    ) -> BulwarkResult<BreakerAcquire> {
        let clock_now = self.now_ms();
        let mut state = self.state();
        Ok(state
            .breaker(&breaker_key(name), clock_now)?
            .acquire(reset_timeout_ms, now_ms))
    }

    async fn breaker_record_success(&self, name: &str, _now_ms: i64) -> BulwarkResult<BreakerUpdate> {
        let clock_now = self.now_ms();
        let mut state = self.state();
        Ok(state.breaker(&breaker_key(name), clock_now)?.record_success())
    }

    async fn breaker_record_failure(
        &self,
        name: &str,
        fail_max: u32,
        now_ms: i64,
    ) -> BulwarkResult<BreakerUpdate> {
        let clock_now = self.now_ms();
        let mut state = self.state();
        Ok(state
            .breaker(&breaker_key(name), clock_now)?
            .record_failure(fail_max, now_ms))
    }

    async fn breaker_force(
        &self,
        name: &str,
        target: CircuitState,
        now_ms: i64,
    ) -> BulwarkResult<BreakerUpdate> {
        let clock_now = self.now_ms();
        let mut state = self.state();
        Ok(state.breaker(&breaker_key(name), clock_now)?.force(target, now_ms))
    }
}
