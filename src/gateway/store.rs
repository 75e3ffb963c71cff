//! Backing-store collaborators: organizations, gateway keys, provider credentials.
//!
//! The relational schema lives outside the gateway; these traits are the query surface the
//! pipeline needs. `MemoryStore` implements all of them and can be seeded from a JSON file.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use super::credentials::ProviderCredential;
use super::providers::ProviderName;
use super::{Clock, SystemClock};
use crate::auth::sigv4::sha256_hex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("read store seed failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse store seed failed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub id: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default)]
    pub cloud_billing: bool,
}

fn default_tier() -> String {
    "free".to_string()
}

impl OrganizationRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: default_tier(),
            cloud_billing: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLimitUnit {
    Requests,
    Cents,
}

/// Per proxy-key quota over a trailing window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageLimit {
    pub unit: UsageLimitUnit,
    pub quota: f64,
    pub window_seconds: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyUsage {
    pub requests: u64,
    pub cents: f64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyKeyRecord {
    pub id: String,
    pub organization_id: String,
    /// Hex SHA-256 of the complete proxy key.
    pub hashed_key: String,
    pub provider: ProviderName,
    pub provider_key: String,
    #[serde(default)]
    pub limits: Vec<UsageLimit>,
}

impl std::fmt::Debug for ProxyKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyKeyRecord")
            .field("id", &self.id)
            .field("organization_id", &self.organization_id)
            .field("hashed_key", &"<redacted>")
            .field("provider", &self.provider)
            .field("provider_key", &"<redacted>")
            .field("limits", &self.limits)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CustomerPortalKeyRecord {
    pub key_id: String,
    pub organization_id: String,
    pub provider: ProviderName,
    pub provider_key: String,
}

impl std::fmt::Debug for CustomerPortalKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomerPortalKeyRecord")
            .field("key_id", &self.key_id)
            .field("organization_id", &self.organization_id)
            .field("provider", &self.provider)
            .field("provider_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub organization_id: String,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Gateway API key by hex SHA-256 of the raw key.
    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    async fn proxy_key(&self, proxy_key_id: &str) -> Result<Option<ProxyKeyRecord>, StoreError>;

    async fn proxy_key_usage(
        &self,
        proxy_key_id: &str,
        window_seconds: u64,
    ) -> Result<KeyUsage, StoreError>;

    /// Appends one completed request (and its cost, when known) to a proxy key's usage.
    async fn record_proxy_key_usage(
        &self,
        proxy_key_id: &str,
        at_ms: u64,
        cents: f64,
    ) -> Result<(), StoreError>;

    async fn customer_portal_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<CustomerPortalKeyRecord>, StoreError>;

    async fn verify_session(
        &self,
        token: &str,
        organization_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;
}

#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationRecord>, StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn provider_credential(
        &self,
        organization_id: &str,
        provider: ProviderName,
    ) -> Result<Option<ProviderCredential>, StoreError>;
}

/// Seed file layout for `MemoryStore`. Raw keys are hashed on load.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub organizations: Vec<OrganizationRecord>,
    #[serde(default)]
    pub api_keys: Vec<SeedApiKey>,
    #[serde(default)]
    pub proxy_keys: Vec<SeedProxyKey>,
    #[serde(default)]
    pub customer_portal_keys: Vec<SeedCustomerPortalKey>,
    #[serde(default)]
    pub sessions: Vec<SeedSession>,
    #[serde(default)]
    pub credentials: Vec<SeedCredential>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedApiKey {
    pub key: String,
    #[serde(flatten)]
    pub record: ApiKeyRecord,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedProxyKey {
    pub key: String,
    pub organization_id: String,
    pub provider: ProviderName,
    pub provider_key: String,
    #[serde(default)]
    pub limits: Vec<UsageLimit>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedCustomerPortalKey {
    pub key: String,
    #[serde(flatten)]
    pub record: CustomerPortalKeyRecord,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedSession {
    pub token: String,
    #[serde(flatten)]
    pub record: SessionRecord,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedCredential {
    pub organization_id: String,
    #[serde(flatten)]
    pub credential: ProviderCredential,
}

#[derive(Debug, Default)]
struct MemoryState {
    organizations: HashMap<String, OrganizationRecord>,
    api_keys: HashMap<String, ApiKeyRecord>,
    proxy_keys: HashMap<String, ProxyKeyRecord>,
    proxy_usage: HashMap<String, Vec<UsageEvent>>,
    customer_portal_keys: HashMap<String, CustomerPortalKeyRecord>,
    sessions: HashMap<String, SessionRecord>,
    credentials: HashMap<(String, ProviderName), ProviderCredential>,
}

#[derive(Debug, Clone, Copy)]
struct UsageEvent {
    at_ms: u64,
    cents: f64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let mut state = MemoryState::default();
        for org in seed.organizations {
            state.organizations.insert(org.id.clone(), org);
        }
        for key in seed.api_keys {
            state.api_keys.insert(sha256_hex(key.key.as_bytes()), key.record);
        }
        for key in seed.proxy_keys {
            let Some(id) = proxy_key_id(&key.key) else {
                tracing::warn!("skipping seeded proxy key without a trailing uuid");
                continue;
            };
            state.proxy_keys.insert(
                id.to_string(),
                ProxyKeyRecord {
                    id: id.to_string(),
                    organization_id: key.organization_id,
                    hashed_key: sha256_hex(key.key.as_bytes()),
                    provider: key.provider,
                    provider_key: key.provider_key,
                    limits: key.limits,
                },
            );
        }
        for key in seed.customer_portal_keys {
            state
                .customer_portal_keys
                .insert(sha256_hex(key.key.as_bytes()), key.record);
        }
        for session in seed.sessions {
            state.sessions.insert(session.token, session.record);
        }
        for entry in seed.credentials {
            let provider = entry.credential.provider;
            state
                .credentials
                .insert((entry.organization_id, provider), entry.credential);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        let seed: StoreSeed = serde_json::from_str(&raw)?;
        Ok(Self::from_seed(seed))
    }

    pub async fn upsert_organization(&self, organization: OrganizationRecord) {
        let mut state = self.state.write().await;
        state
            .organizations
            .insert(organization.id.clone(), organization);
    }

    pub async fn insert_api_key(&self, raw_key: &str, record: ApiKeyRecord) {
        let mut state = self.state.write().await;
        state.api_keys.insert(sha256_hex(raw_key.as_bytes()), record);
    }

    pub async fn insert_proxy_key(&self, record: ProxyKeyRecord) {
        let mut state = self.state.write().await;
        state.proxy_keys.insert(record.id.clone(), record);
    }

    pub async fn insert_customer_portal_key(&self, raw_key: &str, record: CustomerPortalKeyRecord) {
        let mut state = self.state.write().await;
        state
            .customer_portal_keys
            .insert(sha256_hex(raw_key.as_bytes()), record);
    }

    pub async fn insert_session(&self, token: &str, record: SessionRecord) {
        let mut state = self.state.write().await;
        state.sessions.insert(token.to_string(), record);
    }

    pub async fn upsert_credential(&self, organization_id: &str, credential: ProviderCredential) {
        let mut state = self.state.write().await;
        state.credentials.insert(
            (organization_id.to_string(), credential.provider),
            credential,
        );
    }

    pub async fn remove_credential(&self, organization_id: &str, provider: ProviderName) {
        let mut state = self.state.write().await;
        state
            .credentials
            .remove(&(organization_id.to_string(), provider));
    }

}

/// The trailing uuid of a proxy key is its id.
pub fn proxy_key_id(raw_key: &str) -> Option<&str> {
    let start = raw_key.len().checked_sub(36)?;
    let id = raw_key.get(start..)?;
    super::ids::is_uuid(id).then_some(id)
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self.state.read().await.api_keys.get(key_hash).cloned())
    }

    async fn proxy_key(&self, proxy_key_id: &str) -> Result<Option<ProxyKeyRecord>, StoreError> {
        Ok(self.state.read().await.proxy_keys.get(proxy_key_id).cloned())
    }

    async fn proxy_key_usage(
        &self,
        proxy_key_id: &str,
        window_seconds: u64,
    ) -> Result<KeyUsage, StoreError> {
        let now_ms = SystemClock.now_millis();
        let since = now_ms.saturating_sub(window_seconds.saturating_mul(1000));
        let state = self.state.read().await;
        let mut usage = KeyUsage::default();
        for event in state
            .proxy_usage
            .get(proxy_key_id)
            .into_iter()
            .flatten()
            .filter(|event| event.at_ms >= since)
        {
            usage.requests += 1;
            usage.cents += event.cents;
        }
        Ok(usage)
    }

    async fn record_proxy_key_usage(
        &self,
        proxy_key_id: &str,
        at_ms: u64,
        cents: f64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .proxy_usage
            .entry(proxy_key_id.to_string())
            .or_default()
            .push(UsageEvent { at_ms, cents });
        Ok(())
    }

    async fn customer_portal_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<CustomerPortalKeyRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .customer_portal_keys
            .get(key_hash)
            .cloned())
    }

    async fn verify_session(
        &self,
        token: &str,
        organization_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(token)
            .filter(|session| session.organization_id == organization_id)
            .cloned())
    }
}

#[async_trait]
impl OrganizationStore for MemoryStore {
    async fn organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .organizations
            .get(organization_id)
            .cloned())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn provider_credential(
        &self,
        organization_id: &str,
        provider: ProviderName,
    ) -> Result<Option<ProviderCredential>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .credentials
            .get(&(organization_id.to_string(), provider))
            .cloned())
    }
}
