use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_overflows: u64,
    pub rate_limited: u64,
    pub billing_denied: u64,
    pub attempts: u64,
    pub fallback_successes: u64,
    pub backend_failures: u64,
    pub logs_dispatched: u64,
    pub logs_failed: u64,
}

/// Process-wide counters shared by every request task.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_overflows: AtomicU64,
    rate_limited: AtomicU64,
    billing_denied: AtomicU64,
    attempts: AtomicU64,
    fallback_successes: AtomicU64,
    backend_failures: AtomicU64,
    logs_dispatched: AtomicU64,
    logs_failed: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests, 1);
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits, 1);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses, 1);
    }

    pub fn record_cache_overflow(&self) {
        bump(&self.cache_overflows, 1);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited, 1);
    }

    pub fn record_billing_denied(&self) {
        bump(&self.billing_denied, 1);
    }

    /// `attempts` counts candidates tried, including the successful one.
    pub fn record_forward(&self, attempts: u64, succeeded_on_fallback: bool) {
        bump(&self.attempts, attempts);
        if succeeded_on_fallback {
            bump(&self.fallback_successes, 1);
        }
    }

    pub fn record_backend_failure(&self) {
        bump(&self.backend_failures, 1);
    }

    pub fn record_log_dispatched(&self) {
        bump(&self.logs_dispatched, 1);
    }

    pub fn record_log_failed(&self) {
        bump(&self.logs_failed, 1);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            requests: load(&self.requests),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            cache_overflows: load(&self.cache_overflows),
            rate_limited: load(&self.rate_limited),
            billing_denied: load(&self.billing_denied),
            attempts: load(&self.attempts),
            fallback_successes: load(&self.fallback_successes),
            backend_failures: load(&self.backend_failures),
            logs_dispatched: load(&self.logs_dispatched),
            logs_failed: load(&self.logs_failed),
        }
    }
}
