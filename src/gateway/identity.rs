//! Gateway credential resolution.
//!
//! Every inbound credential is classified once by shape and resolved through the identity
//! store. Results are cached in the KV store keyed by the SHA-256 of the raw credential. Cached
//! entries hold ids only: the upstream key bound to a proxy or customer-portal key is skipped
//! on serialization and read back from the store for each request.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::fetch_cache::CacheOrFetch;
use super::kv::KvStore;
use super::providers::ProviderName;
use super::request::{AuthError, InboundRequest};
use super::store::{IdentityStore, StoreError, UsageLimit, UsageLimitUnit, proxy_key_id};
use crate::auth::sigv4::sha256_hex;

pub const IDENTITY_CACHE_TTL_SECS: u64 = 12 * 60 * 60;

const CUSTOMER_PORTAL_PREFIX: &str = "sk-helicone-cp-";
const PROXY_KEY_PREFIX: &str = "sk-helicone-proxy-";

static API_KEY_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(sk|pk)-helicone-(eu-)?[a-z0-9]{7}-[a-z0-9]{7}-[a-z0-9]{7}-[a-z0-9]{7}$").ok()
});

pub fn is_api_key_shape(raw: &str) -> bool {
    API_KEY_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(raw))
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthIdentity {
    ApiKey {
        organization_id: String,
        key_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    ProxyKey {
        organization_id: String,
        proxy_key_id: String,
        provider: ProviderName,
        #[serde(skip)]
        provider_key: String,
        #[serde(default)]
        limits: Vec<UsageLimit>,
    },
    CustomerPortalKey {
        organization_id: String,
        key_id: String,
        provider: ProviderName,
        #[serde(skip)]
        provider_key: String,
    },
    Session {
        organization_id: String,
        user_id: String,
    },
}

impl std::fmt::Debug for AuthIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resolved = self.resolved();
        f.debug_struct(self.kind())
            .field("organization_id", &resolved.organization_id)
            .field("user_id", &resolved.user_id)
            .field("key_id", &resolved.key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub organization_id: String,
    pub user_id: Option<String>,
    pub key_id: Option<String>,
}

impl AuthIdentity {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthIdentity::ApiKey { .. } => "api_key",
            AuthIdentity::ProxyKey { .. } => "proxy_key",
            AuthIdentity::CustomerPortalKey { .. } => "customer_portal_key",
            AuthIdentity::Session { .. } => "session",
        }
    }

    pub fn organization_id(&self) -> &str {
        match self {
            AuthIdentity::ApiKey {
                organization_id, ..
            }
            | AuthIdentity::ProxyKey {
                organization_id, ..
            }
            | AuthIdentity::CustomerPortalKey {
                organization_id, ..
            }
            | AuthIdentity::Session {
                organization_id, ..
            } => organization_id,
        }
    }

    pub fn resolved(&self) -> ResolvedIdentity {
        let (user_id, key_id) = match self {
            AuthIdentity::ApiKey { key_id, user_id, .. } => (user_id.clone(), Some(key_id.clone())),
            AuthIdentity::ProxyKey { proxy_key_id, .. } => (None, Some(proxy_key_id.clone())),
            AuthIdentity::CustomerPortalKey { key_id, .. } => (None, Some(key_id.clone())),
            AuthIdentity::Session { user_id, .. } => (Some(user_id.clone()), None),
        };
        ResolvedIdentity {
            organization_id: self.organization_id().to_string(),
            user_id,
            key_id,
        }
    }

    /// Upstream key bound to the gateway credential itself, if any.
    pub fn provider_override(&self) -> Option<(ProviderName, &str)> {
        match self {
            AuthIdentity::ProxyKey {
                provider,
                provider_key,
                ..
            }
            | AuthIdentity::CustomerPortalKey {
                provider,
                provider_key,
                ..
            } => Some((*provider, provider_key.as_str())),
            AuthIdentity::ApiKey { .. } | AuthIdentity::Session { .. } => None,
        }
    }
}

/// Shape of the presented credential, decided before any store lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayCredential<'a> {
    CustomerPortalKey(&'a str),
    ProxyKey(&'a str),
    Session {
        token: &'a str,
        organization_id: &'a str,
    },
    ApiKey(&'a str),
}

impl GatewayCredential<'_> {
    fn cache_key(&self) -> String {
        match self {
            GatewayCredential::CustomerPortalKey(raw)
            | GatewayCredential::ProxyKey(raw)
            | GatewayCredential::ApiKey(raw) => sha256_hex(raw.as_bytes()),
            GatewayCredential::Session {
                token,
                organization_id,
            } => sha256_hex(format!("{organization_id}:{token}").as_bytes()),
        }
    }
}

pub fn classify(request: &InboundRequest) -> Result<GatewayCredential<'_>, AuthError> {
    if let Some(key) = request.gateway_key() {
        if key.starts_with(CUSTOMER_PORTAL_PREFIX) {
            return Ok(GatewayCredential::CustomerPortalKey(key));
        }
        if key.starts_with(PROXY_KEY_PREFIX) {
            return Ok(GatewayCredential::ProxyKey(key));
        }
        if is_api_key_shape(key) {
            return Ok(GatewayCredential::ApiKey(key));
        }
        return Err(AuthError::Invalid);
    }
    match (request.header("helicone-jwt"), request.header("helicone-org-id")) {
        (Some(token), Some(organization_id)) if !token.is_empty() => Ok(GatewayCredential::Session {
            token,
            organization_id,
        }),
        _ => Err(AuthError::Missing),
    }
}

pub struct Authenticator {
    store: Arc<dyn IdentityStore>,
    cache: CacheOrFetch<str, AuthIdentity>,
    timeout: Duration,
}

impl Authenticator {
    pub fn new(store: Arc<dyn IdentityStore>, kv: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self {
            store,
            cache: CacheOrFetch::new(kv, "auth_identity", IDENTITY_CACHE_TTL_SECS),
            timeout,
        }
    }

    /// Resolves the caller and attaches the identity to `request`.
    pub async fn resolve(&self, request: &mut InboundRequest) -> Result<AuthIdentity, AuthError> {
        let identity = {
            let credential = classify(request)?;
            let cache_key = credential.cache_key();
            let mut identity = self
                .cache
                .get_or_fetch(&cache_key, || self.lookup(credential))
                .await?
                .ok_or(AuthError::Invalid)?;
            self.attach_provider_key(&mut identity, credential).await?;
            self.check_usage_limits(&identity).await?;
            identity
        };
        tracing::debug!(
            kind = identity.kind(),
            organization_id = identity.organization_id(),
            "caller authenticated"
        );
        request.set_identity(identity.clone());
        Ok(identity)
    }

    async fn lookup(
        &self,
        credential: GatewayCredential<'_>,
    ) -> Result<Option<AuthIdentity>, AuthError> {
        match credential {
            GatewayCredential::ApiKey(raw) => {
                let hash = sha256_hex(raw.as_bytes());
                let record = self.bounded(self.store.api_key_by_hash(&hash)).await?;
                Ok(record.map(|record| AuthIdentity::ApiKey {
                    organization_id: record.organization_id,
                    key_id: record.key_id,
                    user_id: record.user_id,
                }))
            }
            GatewayCredential::ProxyKey(raw) => {
                let id = proxy_key_id(raw).ok_or(AuthError::Invalid)?;
                let Some(record) = self.bounded(self.store.proxy_key(id)).await? else {
                    return Ok(None);
                };
                let presented = sha256_hex(raw.as_bytes());
                if !constant_time_eq(&presented, &record.hashed_key) {
                    return Err(AuthError::ProxyKeyMismatch);
                }
                Ok(Some(AuthIdentity::ProxyKey {
                    organization_id: record.organization_id,
                    proxy_key_id: record.id,
                    provider: record.provider,
                    provider_key: record.provider_key,
                    limits: record.limits,
                }))
            }
            GatewayCredential::CustomerPortalKey(raw) => {
                let hash = sha256_hex(raw.as_bytes());
                let record = self
                    .bounded(self.store.customer_portal_key_by_hash(&hash))
                    .await?;
                Ok(record.map(|record| AuthIdentity::CustomerPortalKey {
                    organization_id: record.organization_id,
                    key_id: record.key_id,
                    provider: record.provider,
                    provider_key: record.provider_key,
                }))
            }
            GatewayCredential::Session {
                token,
                organization_id,
            } => {
                let session = self
                    .bounded(self.store.verify_session(token, organization_id))
                    .await?;
                Ok(session.map(|session| AuthIdentity::Session {
                    organization_id: session.organization_id,
                    user_id: session.user_id,
                }))
            }
        }
    }

    /// Fills in the bound upstream key of an identity that came from the cache without it.
    /// A key deleted since it was cached no longer authenticates.
    async fn attach_provider_key(
        &self,
        identity: &mut AuthIdentity,
        credential: GatewayCredential<'_>,
    ) -> Result<(), AuthError> {
        match identity {
            AuthIdentity::ProxyKey {
                proxy_key_id,
                provider_key,
                ..
            } if provider_key.is_empty() => {
                let record = self
                    .bounded(self.store.proxy_key(proxy_key_id))
                    .await?
                    .ok_or(AuthError::Invalid)?;
                *provider_key = record.provider_key;
            }
            AuthIdentity::CustomerPortalKey { provider_key, .. } if provider_key.is_empty() => {
                let GatewayCredential::CustomerPortalKey(raw) = credential else {
                    return Err(AuthError::Invalid);
                };
                let hash = sha256_hex(raw.as_bytes());
                let record = self
                    .bounded(self.store.customer_portal_key_by_hash(&hash))
                    .await?
                    .ok_or(AuthError::Invalid)?;
                *provider_key = record.provider_key;
            }
            _ => {}
        }
        Ok(())
    }

    /// Usage limits are evaluated on every request, cached identity or not.
    async fn check_usage_limits(&self, identity: &AuthIdentity) -> Result<(), AuthError> {
        let AuthIdentity::ProxyKey {
            proxy_key_id,
            limits,
            ..
        } = identity
        else {
            return Ok(());
        };
        for limit in limits {
            let usage = self
                .bounded(self.store.proxy_key_usage(proxy_key_id, limit.window_seconds))
                .await?;
            let used = match limit.unit {
                UsageLimitUnit::Requests => usage.requests as f64,
                UsageLimitUnit::Cents => usage.cents,
            };
            if used >= limit.quota {
                tracing::info!(
                    proxy_key_id = proxy_key_id.as_str(),
                    unit = ?limit.unit,
                    used,
                    quota = limit.quota,
                    "proxy key usage limit reached"
                );
                return Err(AuthError::UsageLimitExceeded {
                    key_id: proxy_key_id.clone(),
                });
            }
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, AuthError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AuthError::Store(format!("timed out after {:?}", self.timeout)))?
            .map_err(|err| AuthError::Store(err.to_string()))
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
