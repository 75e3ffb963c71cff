//! Redis-backed collaborators: the edge KV cache, the rate-limit counter, organization
//! wallets, and a Redis Streams log broker. Per-key serialization comes from running each
//! mutation as a single Lua script.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use super::billing::{
    DenialReason, ReserveOutcome, SCALE_FACTOR, WalletActor, WalletError, WalletSnapshot,
};
use super::dispatch::{BrokerClient, DispatchError};
use super::kv::{KvError, KvStore};
use super::limits::{CounterOutcome, RateLimitCounter, RateLimitError, RateLimitPolicy};
use super::{Clock, SystemClock};

const STREAM_MAX_LEN: u64 = 100_000;
/// Reservations not released within this lease are reclaimed by the next reserve.
const DEFAULT_WALLET_LEASE: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    wallet_lease: Duration,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("unexpected redis script response: {0:?}")]
    UnexpectedResponse(Vec<String>),
}

impl From<RedisStoreError> for KvError {
    fn from(err: RedisStoreError) -> Self {
        KvError::Backend(err.to_string())
    }
}

impl From<RedisStoreError> for RateLimitError {
    fn from(err: RedisStoreError) -> Self {
        RateLimitError::Backend(err.to_string())
    }
}

impl From<RedisStoreError> for WalletError {
    fn from(err: RedisStoreError) -> Self {
        WalletError::Backend(err.to_string())
    }
}

impl From<RedisStoreError> for DispatchError {
    fn from(err: RedisStoreError) -> Self {
        DispatchError::Backend(err.to_string())
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "llm-relay".to_string(),
            wallet_lease: DEFAULT_WALLET_LEASE,
        })
    }

    /// Sets how long an unreleased wallet reservation holds its slot.
    pub fn with_wallet_lease(mut self, lease: Duration) -> Self {
        self.wallet_lease = lease;
        self
    }

    fn wallet_lease_ms(&self) -> u64 {
        u64::try_from(self.wallet_lease.as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, RedisStoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_kv(&self, key: &str) -> String {
        format!("{}:kv:{key}", self.prefix)
    }

    fn key_rate_admitted(&self, name: &str) -> String {
        format!("{}:{name}:admitted", self.prefix)
    }

    fn key_rate_denied(&self, name: &str) -> String {
        format!("{}:{name}:denied", self.prefix)
    }

    fn key_wallet(&self, organization_id: &str) -> String {
        format!("{}:wallet:{organization_id}", self.prefix)
    }

    fn key_wallet_inflight(&self, organization_id: &str) -> String {
        format!("{}:wallet:{organization_id}:inflight", self.prefix)
    }

    fn key_wallet_events(&self, organization_id: &str) -> String {
        format!("{}:wallet:{organization_id}:events", self.prefix)
    }

    /// Applies a signed balance change, optionally guarded by a payment event id and
    /// releasing an attempt id in the same script. Returns false for a replayed event.
    async fn adjust_wallet(
        &self,
        organization_id: &str,
        delta: i128,
        unknown_delta: i64,
        event_id: Option<&str>,
        release_attempt: Option<&str>,
    ) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(WALLET_ADJUST_SCRIPT);
        let applied: i64 = script
            .key(self.key_wallet(organization_id))
            .key(self.key_wallet_inflight(organization_id))
            .key(self.key_wallet_events(organization_id))
            .arg(delta.div_euclid(SCALE_FACTOR).to_string())
            .arg(delta.rem_euclid(SCALE_FACTOR).to_string())
            .arg(SCALE_FACTOR.to_string())
            .arg(unknown_delta)
            .arg(event_id.unwrap_or_default())
            .arg(release_attempt.unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.connection().await?;
        conn.get(self.key_kv(key))
            .await
            .map_err(|err| RedisStoreError::from(err).into())
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let key = self.key_kv(key);
        let result: Result<(), redis::RedisError> = if ttl_seconds == 0 {
            conn.set(key, value).await
        } else {
            conn.set_ex(key, value, ttl_seconds).await
        };
        result.map_err(|err| RedisStoreError::from(err).into())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .del(self.key_kv(key))
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }
}

const RATE_LIMIT_SCRIPT: &str = r#"
local admitted_key = KEYS[1]
local denied_key = KEYS[2]
local max_count = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local bucket_ms = 1000

local window_start = math.floor(math.max(now_ms - window_ms, 0) / bucket_ms)
local bucket = math.floor(now_ms / bucket_ms)

local function prune(key)
  local fields = redis.call("HGETALL", key)
  local total = 0
  local oldest = nil
  for i = 1, #fields, 2 do
    local b = tonumber(fields[i])
    if b < window_start then
      redis.call("HDEL", key, fields[i])
    else
      total = total + tonumber(fields[i + 1])
      if oldest == nil or b < oldest then
        oldest = b
      end
    end
  end
  return total, oldest
end

local usage, oldest = prune(admitted_key)
local denied = prune(denied_key)

local admitted = 0
if usage + 1 <= max_count then
  admitted = 1
  usage = usage + 1
  redis.call("HINCRBY", admitted_key, tostring(bucket), 1)
  if oldest == nil or bucket < oldest then
    oldest = bucket
  end
else
  denied = denied + 1
  redis.call("HINCRBY", denied_key, tostring(bucket), 1)
end

local ttl = math.ceil(window_ms / 1000) + 1
redis.call("EXPIRE", admitted_key, ttl)
redis.call("EXPIRE", denied_key, ttl)

local reset = 0
if oldest ~= nil then
  reset = math.ceil(math.max(oldest * bucket_ms + window_ms - now_ms, 0) / 1000)
end
return { admitted, usage, denied, reset }
"#;

#[async_trait]
impl RateLimitCounter for RedisStore {
    async fn hit(
        &self,
        name: &str,
        policy: RateLimitPolicy,
        now_ms: u64,
    ) -> Result<CounterOutcome, RateLimitError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(RATE_LIMIT_SCRIPT);
        let result: Vec<i64> = script
            .key(self.key_rate_admitted(name))
            .key(self.key_rate_denied(name))
            .arg(policy.max_count)
            .arg(policy.window_seconds.saturating_mul(1000))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;

        let field = |idx: usize| {
            result
                .get(idx)
                .copied()
                .and_then(|value| u64::try_from(value).ok())
                .ok_or_else(|| {
                    RateLimitError::Backend("unexpected rate limit script response".to_string())
                })
        };
        Ok(CounterOutcome {
            admitted: field(0)? == 1,
            usage: field(1)?,
            denied: field(2)?,
            reset_seconds: field(3)?,
        })
    }
}

const WALLET_RESERVE_SCRIPT: &str = r#"
local wallet_key = KEYS[1]
local inflight_key = KEYS[2]
local attempt_id = ARGV[1]
local now_ms = tonumber(ARGV[2])
local lease_ms = tonumber(ARGV[3])

redis.call("ZREMRANGEBYSCORE", inflight_key, "-inf", now_ms)

local cents = tonumber(redis.call("HGET", wallet_key, "balance_cents") or "0") or 0
if cents <= 10 then
  return { "ERR", "balance_too_low", tostring(cents) }
end

local max_inflight = 500
if cents < 10 then
  max_inflight = 0
elseif cents < 20 then
  max_inflight = 5
elseif cents < 100 then
  max_inflight = 10
elseif cents < 500 then
  max_inflight = 100
end

local unknown = tonumber(redis.call("HGET", wallet_key, "unknown_cost_count") or "0") or 0
local reason = "too_many_inflight"
if unknown > 0 then
  max_inflight = math.floor(max_inflight / 2)
  reason = "reduced_limits"
end

local inflight = redis.call("ZCARD", inflight_key) + 1
if inflight > max_inflight then
  return { "ERR", reason, tostring(inflight), tostring(max_inflight) }
end

redis.call("ZADD", inflight_key, now_ms + lease_ms, attempt_id)
redis.call("PEXPIRE", inflight_key, lease_ms)
return { "OK", tostring(inflight), tostring(max_inflight) }
"#;

const WALLET_ADJUST_SCRIPT: &str = r#"
local wallet_key = KEYS[1]
local inflight_key = KEYS[2]
local events_key = KEYS[3]
local delta_cents = ARGV[1]
local delta_rem = ARGV[2]
local scale = ARGV[3]
local unknown_delta = tonumber(ARGV[4]) or 0
local event_id = ARGV[5]
local attempt_id = ARGV[6]

if event_id ~= "" and redis.call("SADD", events_key, event_id) == 0 then
  return 0
end
if attempt_id ~= "" then
  redis.call("ZREM", inflight_key, attempt_id)
end

redis.call("HINCRBY", wallet_key, "balance_cents", delta_cents)
local rem = redis.call("HINCRBY", wallet_key, "balance_rem", delta_rem)
if rem >= tonumber(scale) then
  redis.call("HINCRBY", wallet_key, "balance_rem", "-" .. scale)
  redis.call("HINCRBY", wallet_key, "balance_cents", 1)
end

if unknown_delta ~= 0 then
  local unknown = redis.call("HINCRBY", wallet_key, "unknown_cost_count", unknown_delta)
  if unknown < 0 then
    redis.call("HSET", wallet_key, "unknown_cost_count", 0)
  end
end
return 1
"#;

fn parse_u32(raw: Option<&String>) -> u32 {
    raw.and_then(|value| value.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl WalletActor for RedisStore {
    async fn reserve(
        &self,
        organization_id: &str,
        attempt_id: &str,
    ) -> Result<ReserveOutcome, WalletError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(WALLET_RESERVE_SCRIPT);
        let result: Vec<String> = script
            .key(self.key_wallet(organization_id))
            .key(self.key_wallet_inflight(organization_id))
            .arg(attempt_id)
            .arg(SystemClock.now_millis())
            .arg(self.wallet_lease_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;

        let outcome = match (
            result.first().map(String::as_str),
            result.get(1).map(String::as_str),
        ) {
            (Some("OK"), _) => ReserveOutcome::Reserved {
                inflight: parse_u32(result.get(1)),
                max_inflight: parse_u32(result.get(2)),
            },
            (Some("ERR"), Some("balance_too_low")) => {
                ReserveOutcome::Denied(DenialReason::BalanceTooLow {
                    balance_cents: result
                        .get(2)
                        .and_then(|raw| raw.parse().ok())
                        .unwrap_or_default(),
                })
            }
            (Some("ERR"), Some("too_many_inflight")) => {
                ReserveOutcome::Denied(DenialReason::TooManyInflight {
                    inflight: parse_u32(result.get(2)),
                    max_inflight: parse_u32(result.get(3)),
                })
            }
            (Some("ERR"), Some("reduced_limits")) => {
                ReserveOutcome::Denied(DenialReason::ReducedLimits {
                    inflight: parse_u32(result.get(2)),
                    max_inflight: parse_u32(result.get(3)),
                })
            }
            _ => return Err(RedisStoreError::UnexpectedResponse(result).into()),
        };
        Ok(outcome)
    }

    async fn release(&self, organization_id: &str, attempt_id: &str) -> Result<bool, WalletError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .zrem(self.key_wallet_inflight(organization_id), attempt_id)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(removed > 0)
    }

    async fn settle(
        &self,
        organization_id: &str,
        attempt_id: &str,
        cost: i128,
    ) -> Result<(), WalletError> {
        self.adjust_wallet(organization_id, -cost, 0, None, Some(attempt_id))
            .await?;
        Ok(())
    }

    async fn mark_unknown_cost(
        &self,
        organization_id: &str,
        attempt_id: &str,
    ) -> Result<(), WalletError> {
        self.adjust_wallet(organization_id, 0, 1, None, Some(attempt_id))
            .await?;
        Ok(())
    }

    async fn settle_unknown_cost(
        &self,
        organization_id: &str,
        cost: i128,
    ) -> Result<(), WalletError> {
        self.adjust_wallet(organization_id, -cost, -1, None, None)
            .await?;
        Ok(())
    }

    async fn add_credits(
        &self,
        organization_id: &str,
        amount: i128,
        event_id: &str,
    ) -> Result<bool, WalletError> {
        Ok(self
            .adjust_wallet(organization_id, amount, 0, Some(event_id), None)
            .await?)
    }

    async fn snapshot(&self, organization_id: &str) -> Result<WalletSnapshot, WalletError> {
        let mut conn = self.connection().await?;
        let (cents, unknown): (Option<i64>, Option<u32>) = conn
            .hget(
                self.key_wallet(organization_id),
                &["balance_cents", "unknown_cost_count"],
            )
            .await
            .map_err(RedisStoreError::from)?;
        let inflight: u32 = conn
            .zcount(
                self.key_wallet_inflight(organization_id),
                format!("({}", SystemClock.now_millis()),
                "+inf",
            )
            .await
            .map_err(RedisStoreError::from)?;
        Ok(WalletSnapshot {
            balance_cents: i128::from(cents.unwrap_or(0)),
            inflight,
            unknown_cost_count: unknown.unwrap_or(0),
        })
    }
}

/// Publishes logs onto a Redis stream with `XADD`, trimmed to an approximate length.
#[derive(Clone, Debug)]
pub struct RedisStreamBroker {
    store: RedisStore,
    stream: String,
}

impl RedisStreamBroker {
    pub fn new(store: RedisStore, stream: impl Into<String>) -> Self {
        Self {
            store,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl BrokerClient for RedisStreamBroker {
    async fn publish(&self, key: &str, payload: &str) -> Result<(), DispatchError> {
        let mut conn = self.store.connection().await?;
        let stream = format!("{}:{}", self.store.prefix, self.stream);
        let _: String = redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::gateway::billing::cents_to_scaled;

    fn env_nonempty(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn redis_url() -> Option<String> {
        env_nonempty("LLM_RELAY_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
    }

    static PREFIX_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn test_store(url: String) -> RedisStore {
        let n = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        RedisStore::new(url)
            .expect("store")
            .with_prefix(format!("llm_relay_test:{nanos}:{n}"))
    }

    #[tokio::test]
    async fn kv_round_trips_and_deletes() {
        let Some(url) = redis_url() else {
            return;
        };
        let store = test_store(url);
        store.ping().await.expect("ping");

        store.put("a", b"value".to_vec(), 60).await.expect("put");
        assert_eq!(store.get("a").await.expect("get"), Some(b"value".to_vec()));
        store.delete("a").await.expect("delete");
        assert_eq!(store.get("a").await.expect("get"), None);
    }

    #[tokio::test]
    async fn rate_counter_denies_past_max_count() {
        let Some(url) = redis_url() else {
            return;
        };
        let store = test_store(url);
        let policy = RateLimitPolicy::new(3, 5);
        let now_ms = 1_700_000_000_000;

        for expected_usage in 1..=3 {
            let outcome = store.hit("rl:org-1", policy, now_ms).await.expect("hit");
            assert!(outcome.admitted);
            assert_eq!(outcome.usage, expected_usage);
        }
        let outcome = store.hit("rl:org-1", policy, now_ms).await.expect("hit");
        assert!(!outcome.admitted);
        assert_eq!(outcome.denied, 1);
        assert_eq!(outcome.reset_seconds, 5);

        let later = store
            .hit("rl:org-1", policy, now_ms + 6_000)
            .await
            .expect("hit");
        assert!(later.admitted);
        assert_eq!(later.usage, 1);
    }

    #[tokio::test]
    async fn wallet_reserves_settles_and_credits_once() {
        let Some(url) = redis_url() else {
            return;
        };
        let store = test_store(url);

        assert!(matches!(
            store.reserve("org-1", "a-0").await.expect("reserve"),
            ReserveOutcome::Denied(DenialReason::BalanceTooLow { balance_cents: 0 })
        ));

        assert!(store
            .add_credits("org-1", cents_to_scaled(15.0), "evt-1")
            .await
            .expect("credit"));
        assert!(!store
            .add_credits("org-1", cents_to_scaled(15.0), "evt-1")
            .await
            .expect("credit"));

        for n in 0..5 {
            assert!(matches!(
                store.reserve("org-1", &format!("a-{n}")).await.expect("reserve"),
                ReserveOutcome::Reserved { max_inflight: 5, .. }
            ));
        }
        assert!(matches!(
            store.reserve("org-1", "a-5").await.expect("reserve"),
            ReserveOutcome::Denied(DenialReason::TooManyInflight { inflight: 6, max_inflight: 5 })
        ));

        store
            .settle("org-1", "a-0", cents_to_scaled(0.5))
            .await
            .expect("settle");
        store.mark_unknown_cost("org-1", "a-1").await.expect("mark");
        let snapshot = store.snapshot("org-1").await.expect("snapshot");
        assert_eq!(snapshot.balance_cents, 14);
        assert_eq!(snapshot.inflight, 3);
        assert_eq!(snapshot.unknown_cost_count, 1);

        store
            .settle_unknown_cost("org-1", cents_to_scaled(0.5))
            .await
            .expect("settle unknown");
        let snapshot = store.snapshot("org-1").await.expect("snapshot");
        assert_eq!(snapshot.balance_cents, 14);
        assert_eq!(snapshot.unknown_cost_count, 0);
    }

    #[tokio::test]
    async fn abandoned_wallet_reservations_expire_with_their_lease() {
        let Some(url) = redis_url() else {
            return;
        };
        let store = test_store(url).with_wallet_lease(Duration::from_millis(200));
        assert!(store
            .add_credits("org-1", cents_to_scaled(15.0), "evt-1")
            .await
            .expect("credit"));

        for n in 0..5 {
            assert!(matches!(
                store.reserve("org-1", &format!("a-{n}")).await.expect("reserve"),
                ReserveOutcome::Reserved { .. }
            ));
        }
        assert!(matches!(
            store.reserve("org-1", "a-5").await.expect("reserve"),
            ReserveOutcome::Denied(DenialReason::TooManyInflight { .. })
        ));

        // Nobody releases these; the lease hands the slots back.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.snapshot("org-1").await.expect("snapshot").inflight, 0);
        assert!(matches!(
            store.reserve("org-1", "a-6").await.expect("reserve"),
            ReserveOutcome::Reserved { inflight: 1, .. }
        ));
    }
}
