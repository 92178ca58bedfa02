//! Lua脚本
//!
//! 每个脚本在Redis中原子执行。熔断器脚本的迁移规则与`BreakerRecord`保持一致。

use redis::Script;

const FIXED_WINDOW: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local cost = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
if current + cost > limit then
  return {0, current}
end
if cost > 0 then
  current = redis.call('INCRBY', KEYS[1], cost)
  if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
  end
end
return {1, current}
"#;

const SLIDING_WINDOW: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count + cost <= limit then
  for i = 1, cost do
    redis.call('ZADD', KEYS[1], now, ARGV[5] .. ':' .. i)
  end
  count = count + cost
  allowed = 1
end
if count > 0 then
  redis.call('PEXPIRE', KEYS[1], window)
end
local needed = 1
if allowed == 0 then
  needed = math.max(count + cost - limit, 1)
end
needed = math.min(needed, math.max(count, 1))
local release = redis.call('ZRANGE', KEYS[1], needed - 1, needed - 1, 'WITHSCORES')
local release_ms = -1
if release[2] then
  release_ms = tonumber(release[2])
end
return {allowed, count, release_ms}
"#;

const TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local state = redis.call('HMGET', KEYS[1], 'level', 'last_ms')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end
local elapsed = math.max(0, now - last) / 1000.0
tokens = math.min(capacity, tokens + elapsed * rate)
local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end
redis.call('HSET', KEYS[1], 'level', tostring(tokens), 'last_ms', string.format('%.0f', math.max(now, last)))
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {allowed, tostring(tokens)}
"#;

const LEAKY_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local state = redis.call('HMGET', KEYS[1], 'level', 'last_ms')
local level = tonumber(state[1]) or 0
local last = tonumber(state[2]) or now
local elapsed = math.max(0, now - last) / 1000.0
level = math.max(0, level - elapsed * rate)
local allowed = 0
if level + cost <= capacity then
  level = level + cost
  allowed = 1
end
redis.call('HSET', KEYS[1], 'level', tostring(level), 'last_ms', string.format('%.0f', math.max(now, last)))
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {allowed, tostring(level)}
"#;

const CLAIM_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #due > 0 then
  redis.call('ZREM', KEYS[1], unpack(due))
end
return due
"#;

/// 熔断器记录的读写与应答格式
///
/// 应答为字符串数组：permit, retry_after_ms, from_state, state, fail_counter,
/// success_counter, opened_at_ms, last_failure_ms, trial_started_ms（缺省为空串）。
const BREAKER_PRELUDE: &str = r#"
local function load(key)
  local v = redis.call('HMGET', key, 'state', 'fail_counter', 'success_counter',
    'opened_at_ms', 'last_failure_ms', 'trial_started_ms')
  return {
    state = v[1] or 'closed',
    fail = tonumber(v[2]) or 0,
    success = tonumber(v[3]) or 0,
    opened = tonumber(v[4]),
    last_failure = tonumber(v[5]),
    trial = tonumber(v[6]),
  }
end

local function put_optional(key, field, value)
  if value then
    redis.call('HSET', key, field, string.format('%.0f', value))
  else
    redis.call('HDEL', key, field)
  end
end

local function save(key, r)
  redis.call('HSET', key, 'state', r.state,
    'fail_counter', string.format('%.0f', r.fail),
    'success_counter', string.format('%.0f', r.success))
  put_optional(key, 'opened_at_ms', r.opened)
  put_optional(key, 'last_failure_ms', r.last_failure)
  put_optional(key, 'trial_started_ms', r.trial)
end

local function fmt(value)
  if value then
    return string.format('%.0f', value)
  end
  return ''
end

local function reply(r, permit, retry_after, from)
  return {permit, fmt(retry_after), from, r.state, fmt(r.fail), fmt(r.success),
    fmt(r.opened), fmt(r.last_failure), fmt(r.trial)}
end

local function open(r, now)
  r.state = 'open'
  r.opened = now
  r.trial = nil
end

local function close(r)
  r.state = 'closed'
  r.fail = 0
  r.success = 0
  r.opened = nil
  r.trial = nil
end
"#;

const BREAKER_LOAD: &str = r#"
local r = load(KEYS[1])
return reply(r, 'none', 0, r.state)
"#;

const BREAKER_ACQUIRE: &str = r#"
local reset = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local r = load(KEYS[1])
local from = r.state
local permit = 'admitted'
local retry_after = 0
if r.state == 'open' then
  local elapsed = now - (r.opened or now)
  if elapsed >= reset then
    r.state = 'half_open'
    r.trial = now
    permit = 'trial'
  else
    permit = 'rejected'
    retry_after = reset - elapsed
  end
elseif r.state == 'half_open' then
  if r.trial and now - r.trial < reset then
    permit = 'rejected'
    retry_after = reset - (now - r.trial)
  else
    r.trial = now
    permit = 'trial'
  end
end
if permit == 'trial' then
  save(KEYS[1], r)
end
return reply(r, permit, retry_after, from)
"#;

const BREAKER_SUCCESS: &str = r#"
local r = load(KEYS[1])
local from = r.state
if r.state == 'closed' then
  r.fail = 0
  r.success = r.success + 1
  save(KEYS[1], r)
elseif r.state == 'half_open' then
  close(r)
  save(KEYS[1], r)
end
return reply(r, 'none', 0, from)
"#;

const BREAKER_FAILURE: &str = r#"
local fail_max = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local r = load(KEYS[1])
local from = r.state
r.last_failure = now
if r.state == 'closed' then
  r.fail = r.fail + 1
  if r.fail >= fail_max then
    open(r, now)
  end
elseif r.state == 'half_open' then
  r.fail = r.fail + 1
  open(r, now)
end
save(KEYS[1], r)
return reply(r, 'none', 0, from)
"#;

const BREAKER_FORCE: &str = r#"
local target = ARGV[1]
local now = tonumber(ARGV[2])
local r = load(KEYS[1])
local from = r.state
if target == 'closed' then
  close(r)
elseif target == 'open' then
  open(r, now)
else
  r.state = 'half_open'
  r.trial = nil
end
save(KEYS[1], r)
return reply(r, 'none', 0, from)
"#;

/// 预编译的脚本集合
///
/// `Script`按SHA1调用，服务端缓存缺失时自动回退为EVAL。
pub struct StoreScripts {
    pub fixed_window: Script,
    pub sliding_window: Script,
    pub token_bucket: Script,
    pub leaky_bucket: Script,
    pub claim_due: Script,
    pub breaker_load: Script,
    pub breaker_acquire: Script,
    pub breaker_success: Script,
    pub breaker_failure: Script,
    pub breaker_force: Script,
}

fn breaker_script(body: &str) -> Script {
    Script::new(&format!("{BREAKER_PRELUDE}{body}"))
}

impl StoreScripts {
    pub fn new() -> Self {
        Self {
            fixed_window: Script::new(FIXED_WINDOW),
            sliding_window: Script::new(SLIDING_WINDOW),
            token_bucket: Script::new(TOKEN_BUCKET),
            leaky_bucket: Script::new(LEAKY_BUCKET),
            claim_due: Script::new(CLAIM_DUE),
            breaker_load: breaker_script(BREAKER_LOAD),
            breaker_acquire: breaker_script(BREAKER_ACQUIRE),
            breaker_success: breaker_script(BREAKER_SUCCESS),
            breaker_failure: breaker_script(BREAKER_FAILURE),
            breaker_force: breaker_script(BREAKER_FORCE),
        }
    }
}

impl Default for StoreScripts {
    fn default() -> Self {
        Self::new()
    }
}
