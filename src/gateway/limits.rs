//! Per-organization request rate limiting by billing tier.
//!
//! Each organization owns one counter (`rl:<organization_id>`). The counter keeps a sliding
//! window of one-second buckets; only admitted requests are counted against the quota.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Clock;
use super::actor::{KeyedActors, actor_name};

const BUCKET_MS: u64 = 1000;
/// Idle in-process counters are swept once per this many hits.
const PRUNE_EVERY_HITS: u64 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Growth,
    Enterprise,
}

impl Tier {
    /// Unknown tiers are treated as free.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pro" => Tier::Pro,
            "growth" => Tier::Growth,
            "enterprise" => Tier::Enterprise,
            _ => Tier::Free,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Growth => "growth",
            Tier::Enterprise => "enterprise",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_seconds: u64,
    pub max_count: u64,
}

impl RateLimitPolicy {
    pub const fn new(max_count: u64, window_seconds: u64) -> Self {
        Self {
            window_seconds,
            max_count,
        }
    }

    /// `<max_count>;w=<window_seconds>`
    pub fn header_value(&self) -> String {
        format!("{};w={}", self.max_count, self.window_seconds)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitTable {
    pub free: RateLimitPolicy,
    pub pro: RateLimitPolicy,
    pub growth: RateLimitPolicy,
    pub enterprise: RateLimitPolicy,
}

impl Default for RateLimitTable {
    fn default() -> Self {
        Self {
            free: RateLimitPolicy::new(84, 5),
            pro: RateLimitPolicy::new(834, 5),
            growth: RateLimitPolicy::new(834, 5),
            enterprise: RateLimitPolicy::new(8334, 5),
        }
    }
}

impl RateLimitTable {
    pub fn policy(&self, tier: Tier) -> RateLimitPolicy {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Growth => self.growth,
            Tier::Enterprise => self.enterprise,
        }
    }
}

/// What to do when the counter cannot be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit counter unavailable: {0}")]
    Backend(String),
    #[error("rate limit counter timed out after {0:?}")]
    Timeout(Duration),
}

/// Counter state after one hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterOutcome {
    pub admitted: bool,
    /// Admitted requests in the window, including this one when admitted.
    pub usage: u64,
    /// Denied requests in the window, including this one when denied.
    pub denied: u64,
    pub reset_seconds: u64,
}

/// Serialized per-name counter: the in-process registry or a Redis script.
#[async_trait]
pub trait RateLimitCounter: Send + Sync {
    async fn hit(
        &self,
        name: &str,
        policy: RateLimitPolicy,
        now_ms: u64,
    ) -> Result<CounterOutcome, RateLimitError>;
}

#[derive(Debug, Default)]
pub struct WindowCounter {
    admitted: BTreeMap<u64, u64>,
    denied: BTreeMap<u64, u64>,
    window_ms: u64,
}

impl WindowCounter {
    pub fn hit(&mut self, policy: RateLimitPolicy, now_ms: u64) -> CounterOutcome {
        let window_ms = policy.window_seconds.saturating_mul(1000);
        self.window_ms = window_ms;
        let window_start = now_ms.saturating_sub(window_ms) / BUCKET_MS;
        self.admitted = self.admitted.split_off(&window_start);
        self.denied = self.denied.split_off(&window_start);

        let bucket = now_ms / BUCKET_MS;
        let usage = self.admitted.values().sum::<u64>();
        let admitted = usage + 1 <= policy.max_count;
        if admitted {
            *self.admitted.entry(bucket).or_default() += 1;
        } else {
            *self.denied.entry(bucket).or_default() += 1;
        }

        let reset_seconds = self
            .admitted
            .keys()
            .next()
            .map(|oldest| {
                let resets_at = (oldest * BUCKET_MS).saturating_add(window_ms);
                resets_at.saturating_sub(now_ms).div_ceil(1000)
            })
            .unwrap_or(0);

        CounterOutcome {
            admitted,
            usage: usage + u64::from(admitted),
            denied: self.denied.values().sum(),
            reset_seconds,
        }
    }

    /// True once every bucket has left the window of the last policy applied.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        let newest = self
            .admitted
            .keys()
            .next_back()
            .into_iter()
            .chain(self.denied.keys().next_back())
            .max();
        match newest {
            None => true,
            Some(bucket) => {
                (bucket + 1)
                    .saturating_mul(BUCKET_MS)
                    .saturating_add(self.window_ms)
                    <= now_ms
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryRateLimitCounter {
    actors: KeyedActors<WindowCounter>,
    hits: AtomicU64,
}

impl MemoryRateLimitCounter {
    /// Removes counters whose whole window has passed. Returns how many were dropped.
    pub async fn prune_expired(&self, now_ms: u64) -> usize {
        self.actors
            .prune(|counter| counter.is_expired(now_ms))
            .await
    }
}

#[async_trait]
impl RateLimitCounter for MemoryRateLimitCounter {
    async fn hit(
        &self,
        name: &str,
        policy: RateLimitPolicy,
        now_ms: u64,
    ) -> Result<CounterOutcome, RateLimitError> {
        let outcome = self
            .actors
            .with(name, |counter| counter.hit(policy, now_ms))
            .await;
        if (self.hits.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY_HITS == 0 {
            let pruned = self.prune_expired(now_ms).await;
            tracing::debug!(pruned, "pruned idle rate-limit counters");
        }
        Ok(outcome)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub is_rate_limited: bool,
    /// Denials past `max_count` in one window are not logged.
    pub should_log_in_db: bool,
    pub increment_amount: u64,
    pub policy: RateLimitPolicy,
    pub remaining: u64,
    pub reset_seconds: u64,
}

impl RateLimitDecision {
    fn from_outcome(policy: RateLimitPolicy, outcome: CounterOutcome) -> Self {
        Self {
            is_rate_limited: !outcome.admitted,
            should_log_in_db: outcome.admitted || outcome.denied <= policy.max_count,
            increment_amount: u64::from(outcome.admitted),
            policy,
            remaining: policy.max_count.saturating_sub(outcome.usage),
            reset_seconds: outcome.reset_seconds,
        }
    }

    fn unchecked(policy: RateLimitPolicy) -> Self {
        Self {
            is_rate_limited: false,
            should_log_in_db: true,
            increment_amount: 0,
            policy,
            remaining: policy.max_count,
            reset_seconds: 0,
        }
    }

    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "helicone-ratelimit-limit",
            HeaderValue::from(self.policy.max_count),
        );
        headers.insert("helicone-ratelimit-remaining", HeaderValue::from(self.remaining));
        if let Ok(policy) = HeaderValue::from_str(&self.policy.header_value()) {
            headers.insert("helicone-ratelimit-policy", policy);
        }
        if self.is_rate_limited {
            headers.insert("retry-after", HeaderValue::from(self.reset_seconds.max(1)));
        }
        headers
    }
}

pub struct RateLimiter {
    counter: Arc<dyn RateLimitCounter>,
    table: RateLimitTable,
    failure_mode: FailureMode,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        counter: Arc<dyn RateLimitCounter>,
        table: RateLimitTable,
        failure_mode: FailureMode,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            counter,
            table,
            failure_mode,
            clock,
            timeout,
        }
    }

    pub fn table(&self) -> &RateLimitTable {
        &self.table
    }

    pub async fn check(
        &self,
        organization_id: &str,
        tier: &str,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let tier = Tier::parse(tier);
        let policy = self.table.policy(tier);
        let name = actor_name("rl", organization_id);
        let now_ms = self.clock.now_millis();

        let outcome = tokio::time::timeout(self.timeout, self.counter.hit(&name, policy, now_ms))
            .await
            .map_err(|_| RateLimitError::Timeout(self.timeout))
            .and_then(|result| result);

        match outcome {
            Ok(outcome) => {
                let decision = RateLimitDecision::from_outcome(policy, outcome);
                if decision.is_rate_limited {
                    tracing::info!(
                        organization_id,
                        tier = tier.as_str(),
                        limit = policy.max_count,
                        window_seconds = policy.window_seconds,
                        "organization rate limited"
                    );
                }
                Ok(decision)
            }
            Err(err) => match self.failure_mode {
                FailureMode::Open => {
                    tracing::warn!(organization_id, error = %err, "rate limit check failed; failing open");
                    Ok(RateLimitDecision::unchecked(policy))
                }
                FailureMode::Closed => {
                    tracing::warn!(organization_id, error = %err, "rate limit check failed; failing closed");
                    Err(err)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;

    struct BrokenCounter;

    #[async_trait]
    impl RateLimitCounter for BrokenCounter {
        async fn hit(
            &self,
            _name: &str,
            _policy: RateLimitPolicy,
            _now_ms: u64,
        ) -> Result<CounterOutcome, RateLimitError> {
            Err(RateLimitError::Backend("connection refused".to_string()))
        }
    }

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryRateLimitCounter::default()),
            RateLimitTable::default(),
            FailureMode::Open,
            clock,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn unknown_tiers_are_free() {
        assert_eq!(Tier::parse("ENTERPRISE"), Tier::Enterprise);
        assert_eq!(Tier::parse("team-plus"), Tier::Free);
        let table = RateLimitTable::default();
        assert_eq!(table.policy(Tier::Growth), table.policy(Tier::Pro));
        assert_eq!(table.policy(Tier::Free).header_value(), "84;w=5");
    }

    #[tokio::test]
    async fn one_past_the_quota_is_denied_for_every_tier() {
        for tier in ["free", "pro", "growth", "enterprise"] {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let limiter = limiter(clock.clone());
            let max = limiter.table().policy(Tier::parse(tier)).max_count;

            for i in 0..max {
                let decision = limiter.check("org-1", tier).await.unwrap();
                assert!(!decision.is_rate_limited, "{tier} request {i}");
                assert_eq!(decision.increment_amount, 1);
            }
            let denied = limiter.check("org-1", tier).await.unwrap();
            assert!(denied.is_rate_limited, "{tier}");
            assert_eq!(denied.remaining, 0);
            assert!(denied.should_log_in_db);
            assert_eq!(denied.increment_amount, 0);

            let other = limiter.check("org-2", tier).await.unwrap();
            assert!(!other.is_rate_limited);
        }
    }

    #[tokio::test]
    async fn requests_spaced_past_the_window_are_never_denied() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let limiter = limiter(clock.clone());
        for _ in 0..3 {
            for _ in 0..84 {
                assert!(!limiter.check("org-1", "free").await.unwrap().is_rate_limited);
            }
            clock.advance(Duration::from_secs(6));
        }
    }

    #[tokio::test]
    async fn window_slides_bucket_by_bucket() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let limiter = limiter(clock.clone());
        for _ in 0..40 {
            limiter.check("org-1", "free").await.unwrap();
        }
        clock.advance(Duration::from_secs(3));
        for _ in 0..44 {
            limiter.check("org-1", "free").await.unwrap();
        }
        assert!(limiter.check("org-1", "free").await.unwrap().is_rate_limited);

        // The first 40 fall out of the window; the later 44 are still counted.
        clock.advance(Duration::from_secs(3));
        let decision = limiter.check("org-1", "free").await.unwrap();
        assert!(!decision.is_rate_limited);
        assert_eq!(decision.remaining, 84 - 45);
    }

    #[test]
    fn denials_past_the_quota_stop_being_logged() {
        let policy = RateLimitPolicy::new(2, 5);
        let mut counter = WindowCounter::default();
        let decisions = (0..5)
            .map(|_| RateLimitDecision::from_outcome(policy, counter.hit(policy, 10_000)))
            .collect::<Vec<_>>();
        let logged = decisions
            .iter()
            .map(|decision| (decision.is_rate_limited, decision.should_log_in_db))
            .collect::<Vec<_>>();
        assert_eq!(
            logged,
            [(false, true), (false, true), (true, true), (true, true), (true, false)]
        );
        assert_eq!(decisions[2].reset_seconds, 5);
    }

    #[test]
    fn counters_expire_once_the_window_passes() {
        let policy = RateLimitPolicy::new(10, 5);
        let mut counter = WindowCounter::default();
        assert!(counter.is_expired(0));

        counter.hit(policy, 10_500);
        assert!(!counter.is_expired(15_999));
        assert!(counter.is_expired(16_000));
    }

    #[tokio::test]
    async fn idle_counters_are_pruned_after_their_window() {
        let counter = MemoryRateLimitCounter::default();
        let policy = RateLimitPolicy::new(10, 5);
        for org in 0..(PRUNE_EVERY_HITS - 1) {
            counter
                .hit(&format!("rl:org-{org}"), policy, 1_000)
                .await
                .unwrap();
        }
        assert_eq!(counter.actors.len().await, (PRUNE_EVERY_HITS - 1) as usize);

        // The next hit lands on the sweep and finds every older window closed.
        counter.hit("rl:late", policy, 60_000).await.unwrap();
        assert_eq!(counter.actors.len().await, 1);
        assert_eq!(counter.prune_expired(60_000).await, 0);
    }

    #[tokio::test]
    async fn counter_failures_follow_the_failure_mode() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let open = RateLimiter::new(
            Arc::new(BrokenCounter),
            RateLimitTable::default(),
            FailureMode::Open,
            clock.clone(),
            Duration::from_secs(1),
        );
        let decision = open.check("org-1", "pro").await.unwrap();
        assert!(!decision.is_rate_limited);
        assert_eq!(decision.remaining, 834);

        let closed = RateLimiter::new(
            Arc::new(BrokenCounter),
            RateLimitTable::default(),
            FailureMode::Closed,
            clock,
            Duration::from_secs(1),
        );
        assert!(matches!(
            closed.check("org-1", "pro").await,
            Err(RateLimitError::Backend(_))
        ));
    }

    #[test]
    fn decision_headers() {
        let decision = RateLimitDecision::from_outcome(
            RateLimitPolicy::new(84, 5),
            CounterOutcome {
                admitted: false,
                usage: 84,
                denied: 1,
                reset_seconds: 3,
            },
        );
        let headers = decision.headers();
        assert_eq!(headers.get("helicone-ratelimit-limit").unwrap(), "84");
        assert_eq!(headers.get("helicone-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("helicone-ratelimit-policy").unwrap(), "84;w=5");
        assert_eq!(headers.get("retry-after").unwrap(), "3");
    }
}
