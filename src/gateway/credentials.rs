use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fetch_cache::{CacheOrFetch, InvalidationHook};
use super::kv::KvStore;
use super::providers::{AuthStyle, ProviderName};
use super::store::{CredentialStore, StoreError};
use super::transport::OutboundRequest;
use crate::auth::{SigV4Signer, SigV4Timestamp};

const CREDENTIAL_CACHE_TTL_SECS: u64 = 60 * 60;

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSecret {
    ApiKey {
        key: String,
    },
    AccessKeys {
        access_key: String,
        secret_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
}

impl std::fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSecret::ApiKey { .. } => f.write_str("ApiKey(<redacted>)"),
            CredentialSecret::AccessKeys { .. } => f.write_str("AccessKeys(<redacted>)"),
        }
    }
}

/// One organization's upstream credential for one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub key_id: String,
    pub provider: ProviderName,
    pub secret: CredentialSecret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Provider specific settings (`project_id`, `resource_name`, `api_version`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

impl ProviderCredential {
    /// Bearer-style credential supplied by the caller rather than the store.
    pub fn caller_supplied(provider: ProviderName, key: impl Into<String>) -> Self {
        Self {
            key_id: format!("caller:{provider}"),
            provider,
            secret: CredentialSecret::ApiKey { key: key.into() },
            region: None,
            settings: BTreeMap::new(),
        }
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        if name == "region" {
            if let Some(region) = self.region.as_deref() {
                return Some(region);
            }
        }
        self.settings
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no {provider} credential configured for organization {organization_id}")]
    Missing {
        provider: ProviderName,
        organization_id: String,
    },
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
    #[error("credential lookup timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("{provider} requires an access key pair")]
    MissingAccessKeys { provider: ProviderName },
    #[error("{provider} requires an api key")]
    MissingApiKey { provider: ProviderName },
    #[error("{provider} signing requires a region")]
    MissingRegion { provider: ProviderName },
    #[error("invalid header value for {header}")]
    InvalidHeader { header: String },
    #[error(transparent)]
    SigV4(#[from] crate::RelayError),
}

/// Fetch-through credential lookup with invalidation by credential id.
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    cache: CacheOrFetch<str, ProviderCredential>,
    index: CacheOrFetch<str, String>,
    timeout: Duration,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>, kv: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self {
            store,
            cache: CacheOrFetch::new(kv.clone(), "provider_credential", CREDENTIAL_CACHE_TTL_SECS),
            index: CacheOrFetch::new(kv, "provider_credential_index", CREDENTIAL_CACHE_TTL_SECS),
            timeout,
        }
    }

    /// Registers a derived cache that must be evicted whenever a credential id is invalidated.
    pub fn with_invalidation_hook(mut self, hook: Arc<dyn InvalidationHook>) -> Self {
        self.index = self.index.with_invalidation_hook(hook);
        self
    }

    fn cache_key(provider: ProviderName, organization_id: &str) -> String {
        format!("{organization_id}:{provider}")
    }

    pub async fn get_credential(
        &self,
        provider: ProviderName,
        organization_id: &str,
    ) -> Result<ProviderCredential, CredentialError> {
        let cache_key = Self::cache_key(provider, organization_id);
        if let Some(credential) = self.cache.get_cached(&cache_key).await {
            return Ok(credential);
        }

        let fetched = tokio::time::timeout(
            self.timeout,
            self.store.provider_credential(organization_id, provider),
        )
        .await
        .map_err(|_| CredentialError::Timeout(self.timeout))??;

        let Some(credential) = fetched else {
            return Err(CredentialError::Missing {
                provider,
                organization_id: organization_id.to_string(),
            });
        };
        self.cache.put(&cache_key, &credential).await;
        self.index.put(&credential.key_id, &cache_key).await;
        Ok(credential)
    }

    /// Evicts the credential with `key_id` and every cache derived from it.
    pub async fn invalidate(&self, key_id: &str) {
        if let Some(cache_key) = self.index.get_cached(key_id).await {
            self.cache.invalidate(&cache_key).await;
        }
        self.index.invalidate(key_id).await;
        tracing::info!(key_id, "provider credential invalidated");
    }
}

/// Applies provider authentication to `request`, replacing any previous auth headers.
pub fn sign(
    request: &mut OutboundRequest,
    credential: &ProviderCredential,
) -> Result<(), SigningError> {
    let provider = credential.provider;
    for (name, value) in provider.static_headers() {
        request
            .headers
            .insert(*name, HeaderValue::from_static(value));
    }

    match provider.auth_style() {
        AuthStyle::Bearer => {
            let key = api_key(credential)?;
            set_header(&mut request.headers, "authorization", &format!("Bearer {key}"))
        }
        AuthStyle::Header(name) => {
            request.headers.remove("authorization");
            let key = api_key(credential)?;
            set_header(&mut request.headers, name, key)
        }
        AuthStyle::SigV4 { service } => {
            let CredentialSecret::AccessKeys {
                access_key,
                secret_key,
                session_token,
            } = &credential.secret
            else {
                return Err(SigningError::MissingAccessKeys { provider });
            };
            let region = credential
                .setting("region")
                .ok_or(SigningError::MissingRegion { provider })?;
            let signer = SigV4Signer::new(
                access_key,
                secret_key,
                session_token.clone(),
                region,
                service,
            )?;

            let mut signed = std::collections::BTreeMap::new();
            if let Some(content_type) = request
                .headers
                .get("content-type")
                .and_then(|value| value.to_str().ok())
            {
                signed.insert("content-type".to_string(), content_type.to_string());
            }
            let result = signer.sign(
                request.method.as_str(),
                request.url.as_str(),
                &signed,
                &request.body,
                SigV4Timestamp::now()?,
            )?;
            result.headers.apply_to(&mut request.headers)?;
            Ok(())
        }
    }
}

fn api_key(credential: &ProviderCredential) -> Result<&str, SigningError> {
    match &credential.secret {
        CredentialSecret::ApiKey { key } if !key.trim().is_empty() => Ok(key.as_str()),
        _ => Err(SigningError::MissingApiKey {
            provider: credential.provider,
        }),
    }
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), SigningError> {
    let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| SigningError::InvalidHeader {
        header: name.to_string(),
    })?;
    let value = HeaderValue::from_str(value).map_err(|_| SigningError::InvalidHeader {
        header: name.to_string(),
    })?;
    headers.insert(header, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::kv::MemoryKvStore;
    use crate::gateway::store::MemoryStore;
    use axum::http::Method;
    use bytes::Bytes;
    use reqwest::Url;

    fn openai_credential(key_id: &str, key: &str) -> ProviderCredential {
        ProviderCredential {
            key_id: key_id.to_string(),
            provider: ProviderName::OpenAi,
            secret: CredentialSecret::ApiKey {
                key: key.to_string(),
            },
            region: None,
            settings: BTreeMap::new(),
        }
    }

    fn request(url: &str) -> OutboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        OutboundRequest {
            method: Method::POST,
            url: Url::parse(url).unwrap(),
            headers,
            body: Bytes::from_static(br#"{"max_tokens":8}"#),
        }
    }

    #[tokio::test]
    async fn cached_credential_survives_store_changes_until_invalidated() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_credential("org-1", openai_credential("cred-1", "sk-old"))
            .await;
        let manager = CredentialManager::new(
            store.clone(),
            Arc::new(MemoryKvStore::default()),
            Duration::from_secs(1),
        );

        let first = manager
            .get_credential(ProviderName::OpenAi, "org-1")
            .await
            .unwrap();
        assert_eq!(first.key_id, "cred-1");

        store
            .upsert_credential("org-1", openai_credential("cred-2", "sk-new"))
            .await;
        let cached = manager
            .get_credential(ProviderName::OpenAi, "org-1")
            .await
            .unwrap();
        assert_eq!(cached.key_id, "cred-1");

        manager.invalidate("cred-1").await;
        let refreshed = manager
            .get_credential(ProviderName::OpenAi, "org-1")
            .await
            .unwrap();
        assert_eq!(refreshed.key_id, "cred-2");
    }

    #[tokio::test]
    async fn missing_credential_is_a_distinct_error() {
        let manager = CredentialManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryKvStore::default()),
            Duration::from_secs(1),
        );
        let err = manager
            .get_credential(ProviderName::Anthropic, "org-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Missing {
                provider: ProviderName::Anthropic,
                ..
            }
        ));
    }

    #[test]
    fn header_providers_use_their_own_auth_header() {
        let mut credential = openai_credential("cred-1", "sk-ant");
        credential.provider = ProviderName::Anthropic;
        let mut req = request("https://api.anthropic.com/v1/messages");
        req.headers
            .insert("authorization", HeaderValue::from_static("Bearer caller"));

        sign(&mut req, &credential).unwrap();
        assert!(req.headers.get("authorization").is_none());
        assert_eq!(req.headers.get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(req.headers.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn bedrock_requests_are_sigv4_signed() {
        let credential = ProviderCredential {
            key_id: "cred-aws".to_string(),
            provider: ProviderName::Bedrock,
            secret: CredentialSecret::AccessKeys {
                access_key: "AKIDEXAMPLE".to_string(),
                secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
                session_token: None,
            },
            region: Some("us-east-1".to_string()),
            settings: BTreeMap::new(),
        };
        let mut req = request(
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/anthropic.claude-3-haiku/invoke",
        );

        sign(&mut req, &credential).unwrap();
        let authorization = req.headers.get("authorization").unwrap().to_str().unwrap();
        assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(authorization.contains("/us-east-1/bedrock/aws4_request"));
        assert!(authorization.contains("SignedHeaders=content-type;host;"));
        assert!(req.headers.contains_key("x-amz-date"));
        assert!(req.headers.contains_key("x-amz-content-sha256"));
    }

    #[test]
    fn bedrock_rejects_plain_api_keys() {
        let mut credential = openai_credential("cred-1", "sk");
        credential.provider = ProviderName::Bedrock;
        credential.region = Some("us-east-1".to_string());
        let mut req = request("https://bedrock-runtime.us-east-1.amazonaws.com/model/x/invoke");
        assert!(matches!(
            sign(&mut req, &credential),
            Err(SigningError::MissingAccessKeys { .. })
        ));
    }
}
