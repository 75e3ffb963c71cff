//! LLM request gateway: authentication, response caching, rate limiting, billing admission,
//! model fallback across providers, and asynchronous request logging.

pub mod actor;
pub mod billing;
pub mod body;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod fetch_cache;
pub mod forwarder;
pub mod http;
pub mod identity;
pub mod ids;
pub mod kv;
pub mod limits;
pub mod observability;
pub mod pipeline;
pub mod providers;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod request;
pub mod router;
pub mod store;
pub mod tasks;
pub mod telemetry;
pub mod translation;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use billing::BillingError;
use cache::CacheConfigError;
use forwarder::AttemptError;
use limits::{RateLimitDecision, RateLimitError};
use request::{AuthError, RequestError};
use store::StoreError;

pub use billing::{BillingController, MemoryWallets, WalletActor};
pub use cache::{CachePolicy, ResponseCache};
pub use config::{ConfigError, GatewayConfig};
pub use dispatch::{LogDispatcher, LogMessage, QueueMode};
pub use forwarder::Forwarder;
pub use http::{GatewayHttpState, router as http_router};
pub use identity::{AuthIdentity, Authenticator};
pub use kv::{KvStore, MemoryKvStore};
pub use limits::{MemoryRateLimitCounter, RateLimiter};
pub use observability::{Observability, ObservabilitySnapshot};
pub use pipeline::{Gateway, GatewayParts};
pub use providers::{ProviderName, ProviderTable};
pub use request::InboundRequest;
pub use store::MemoryStore;
pub use tasks::BackgroundTasks;
pub use transport::{HttpTransport, Transport};

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;

    fn now_epoch_seconds(&self) -> u64 {
        self.now_millis() / 1000
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Settable clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    CacheConfig(#[from] CacheConfigError),
    #[error("organization lookup failed: {0}")]
    Store(#[from] StoreError),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("rate limit exceeded: {} requests per {}s", .0.policy.max_count, .0.policy.window_seconds)]
    RateLimited(RateLimitDecision),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("{}", .0.message)]
    Attempt(#[from] AttemptError),
    #[error("request body must be a json object")]
    InvalidBody,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Request(RequestError::Auth(err)) | GatewayError::Auth(err) => {
                auth_status(err)
            }
            GatewayError::Request(RequestError::LoopDetected { .. }) => StatusCode::LOOP_DETECTED,
            GatewayError::Request(_) | GatewayError::CacheConfig(_) | GatewayError::InvalidBody => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Store(_) | GatewayError::Timeout { .. } | GatewayError::RateLimit(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::RateLimited(_) | GatewayError::Billing(BillingError::Denied(_)) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::Billing(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Attempt(err) => {
                StatusCode::from_u16(err.http_code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Machine-readable error family for the JSON error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Request(RequestError::Auth(_)) | GatewayError::Auth(_) => {
                "authentication_error"
            }
            GatewayError::Request(RequestError::LoopDetected { .. }) => "loop_detected",
            GatewayError::Request(_) | GatewayError::InvalidBody => "invalid_request_error",
            GatewayError::CacheConfig(_) => "cache_config_error",
            GatewayError::Store(_) | GatewayError::Timeout { .. } => "service_unavailable",
            GatewayError::RateLimited(_) | GatewayError::RateLimit(_) => "rate_limit_error",
            GatewayError::Billing(_) => "billing_error",
            GatewayError::Attempt(_) => "gateway_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Request(RequestError::Auth(err)) | GatewayError::Auth(err) => {
                match err {
                    AuthError::Ambiguous => "ambiguous_credentials",
                    AuthError::Malformed => "malformed_credentials",
                    AuthError::Missing => "missing_credentials",
                    AuthError::Invalid | AuthError::ProxyKeyMismatch => "invalid_credentials",
                    AuthError::UsageLimitExceeded { .. } => "usage_limit_exceeded",
                    AuthError::Store(_) => "identity_store_unavailable",
                }
            }
            GatewayError::Request(RequestError::LoopDetected { .. }) => "loop_detected",
            GatewayError::Request(_) => "invalid_body",
            GatewayError::InvalidBody => "invalid_body",
            GatewayError::CacheConfig(_) => "invalid_cache_bucket_size",
            GatewayError::Store(_) => "organization_store_unavailable",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::RateLimit(_) => "rate_limiter_unavailable",
            GatewayError::Billing(BillingError::Denied(_)) => "billing_denied",
            GatewayError::Billing(_) => "wallet_unavailable",
            GatewayError::Attempt(err) => err.kind.as_str(),
        }
    }
}

fn auth_status(err: &AuthError) -> StatusCode {
    match err {
        AuthError::UsageLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        AuthError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNAUTHORIZED,
    }
}
