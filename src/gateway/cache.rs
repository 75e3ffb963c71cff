//! Bucketed response cache over the KV store.
//!
//! One logical request maps to up to `bucket_max_size` parallel entries. Reads pick one
//! populated entry at random; writes fill the first empty slot and fail once all are full.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::random_index;
use super::kv::{KvError, KvStore};
use super::request::InboundRequest;
use crate::auth::sigv4::sha256_hex;

pub const MAX_BUCKET_SIZE: u16 = 20;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const MAX_CACHE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

pub const CACHE_STATUS_HEADER: &str = "helicone-cache";
pub const CACHE_BUCKET_IDX_HEADER: &str = "helicone-cache-bucket-idx";

const KEYED_HEADER_PREFIXES: [&str; 3] = ["helicone-auth", "authorization", "helicone-cache"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheConfigError {
    #[error("Helicone-Cache-Bucket-Max-Size must be a positive integer, got {0:?}")]
    InvalidBucketSize(String),
    #[error("Helicone-Cache-Bucket-Max-Size {requested} exceeds the maximum of {max}")]
    BucketSizeTooLarge { requested: u16, max: u16 },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache bucket full: all {bucket_max_size} slots are populated")]
    Overflow { bucket_max_size: u16 },
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("cache entry encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("response body is not utf-8 and cannot be cached")]
    NonUtf8Body,
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-request cache behavior derived from headers. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    pub should_read: bool,
    pub should_write: bool,
    pub cache_control: String,
    pub ttl_seconds: u64,
    pub bucket_max_size: u16,
}

impl CachePolicy {
    pub fn disabled() -> Self {
        Self {
            should_read: false,
            should_write: false,
            cache_control: format!("max-age={DEFAULT_CACHE_TTL_SECS}"),
            ttl_seconds: DEFAULT_CACHE_TTL_SECS,
            bucket_max_size: 1,
        }
    }

    pub fn from_headers(headers: &HeaderMap, is_streaming: bool) -> Result<Self, CacheConfigError> {
        let enabled = header_flag(headers, "helicone-cache-enabled");
        let should_write = !is_streaming && (enabled || header_flag(headers, "helicone-cache-save"));
        let should_read = !is_streaming && (enabled || header_flag(headers, "helicone-cache-read"));

        let bucket_max_size = match header_str(headers, "helicone-cache-bucket-max-size") {
            None => 1,
            Some(raw) => {
                let size = raw
                    .trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|size| *size > 0)
                    .ok_or_else(|| CacheConfigError::InvalidBucketSize(raw.to_string()))?;
                if size > MAX_BUCKET_SIZE {
                    return Err(CacheConfigError::BucketSizeTooLarge {
                        requested: size,
                        max: MAX_BUCKET_SIZE,
                    });
                }
                size
            }
        };

        let cache_control = header_str(headers, "cache-control")
            .map(str::to_string)
            .unwrap_or_else(|| format!("max-age={DEFAULT_CACHE_TTL_SECS}"));
        let ttl_seconds = ttl_from_cache_control(&cache_control);

        Ok(Self {
            should_read,
            should_write,
            cache_control,
            ttl_seconds,
            bucket_max_size,
        })
    }

    pub fn is_active(&self) -> bool {
        self.should_read || self.should_write
    }
}

/// `s-maxage` wins over `max-age`; missing or unparsable falls back to the default.
pub fn ttl_from_cache_control(value: &str) -> u64 {
    let mut max_age = None;
    let mut s_maxage = None;
    for directive in value.split(',') {
        let Some((name, seconds)) = directive.trim().split_once('=') else {
            continue;
        };
        let Ok(seconds) = seconds.trim().trim_matches('"').parse::<u64>() else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "s-maxage" => s_maxage = Some(seconds),
            "max-age" => max_age = Some(seconds),
            _ => {}
        }
    }
    s_maxage
        .or(max_age)
        .unwrap_or(DEFAULT_CACHE_TTL_SECS)
        .min(MAX_CACHE_TTL_SECS)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name).is_some_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        )
    })
}

/// Stored envelope: status, headers and body text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CachedResponse {
    pub fn from_parts(
        status: StatusCode,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<Self, CacheError> {
        let body = std::str::from_utf8(body)
            .map_err(|_| CacheError::NonUtf8Body)?
            .to_string();
        let headers = headers
            .iter()
            .filter(|(name, _)| !name.as_str().starts_with("helicone-cache"))
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        Ok(Self {
            status: status.as_u16(),
            headers,
            body,
        })
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        headers
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheHit {
    pub response: CachedResponse,
    pub bucket_index: u16,
}

impl CacheHit {
    /// Stored headers plus the hit markers.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = self.response.header_map();
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
        headers.insert(CACHE_BUCKET_IDX_HEADER, HeaderValue::from(self.bucket_index));
        headers
    }
}

/// Digest input shared by every slot of one logical request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
    material: String,
}

impl CacheKey {
    pub fn for_request(request: &InboundRequest) -> Self {
        let mut keyed = request
            .headers()
            .iter()
            .filter(|(name, _)| {
                KEYED_HEADER_PREFIXES
                    .iter()
                    .any(|prefix| name.as_str().starts_with(prefix))
            })
            .filter_map(|(name, value)| Some(format!("{}:{}", name.as_str(), value.to_str().ok()?)))
            .collect::<Vec<_>>();
        keyed.sort();

        let mut material = request.url();
        material.push_str(request.unsafe_text());
        for header in keyed {
            material.push_str(&header);
        }
        Self { material }
    }

    /// Hex digest for slot `index`; slot 0 carries no index suffix.
    pub fn slot(&self, index: u16) -> String {
        if index == 0 {
            sha256_hex(self.material.as_bytes())
        } else {
            sha256_hex(format!("{}{index}", self.material).as_bytes())
        }
    }
}

pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    prefix: String,
    timeout: Duration,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self {
            kv,
            prefix: "response_cache".to_string(),
            timeout,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn storage_key(&self, key: &CacheKey, index: u16) -> String {
        format!("{}:{}", self.prefix, key.slot(index))
    }

    async fn probe(&self, key: &CacheKey, policy: &CachePolicy) -> Vec<Result<Option<Vec<u8>>, CacheError>> {
        let probes = (0..policy.bucket_max_size).map(|index| {
            let storage_key = self.storage_key(key, index);
            async move {
                tokio::time::timeout(self.timeout, self.kv.get(&storage_key))
                    .await
                    .map_err(|_| CacheError::Timeout(self.timeout))?
                    .map_err(CacheError::from)
            }
        });
        join_all(probes).await
    }

    /// A populated slot chosen uniformly at random, or `None` on a miss. Backend failures
    /// read as a miss.
    pub async fn lookup(&self, request: &InboundRequest, policy: &CachePolicy) -> Option<CacheHit> {
        if !policy.should_read {
            return None;
        }
        let key = CacheKey::for_request(request);
        let mut populated = Vec::new();
        for (index, probe) in self.probe(&key, policy).await.into_iter().enumerate() {
            match probe {
                Ok(Some(raw)) => match serde_json::from_slice::<CachedResponse>(&raw) {
                    Ok(response) => populated.push((index as u16, response)),
                    Err(err) => tracing::warn!(index, error = %err, "dropping undecodable cache entry"),
                },
                Ok(None) => {}
                Err(err) => tracing::warn!(index, error = %err, "cache read failed"),
            }
        }
        if populated.is_empty() {
            return None;
        }
        let (bucket_index, response) = populated.swap_remove(random_index(populated.len()));
        Some(CacheHit {
            response,
            bucket_index,
        })
    }

    /// Writes `response` into the first empty slot and returns its index.
    pub async fn store(
        &self,
        request: &InboundRequest,
        response: &CachedResponse,
        policy: &CachePolicy,
    ) -> Result<u16, CacheError> {
        self.store_keyed(&CacheKey::for_request(request), response, policy)
            .await
    }

    /// `store` with the key computed up front, for writes that outlive the request.
    pub async fn store_keyed(
        &self,
        key: &CacheKey,
        response: &CachedResponse,
        policy: &CachePolicy,
    ) -> Result<u16, CacheError> {
        let mut free = None;
        for (index, probe) in self.probe(key, policy).await.into_iter().enumerate() {
            if probe?.is_none() {
                free = Some(index as u16);
                break;
            }
        }
        let index = free.ok_or(CacheError::Overflow {
            bucket_max_size: policy.bucket_max_size,
        })?;

        let payload = serde_json::to_vec(response)?;
        tokio::time::timeout(
            self.timeout,
            self.kv
                .put(&self.storage_key(key, index), payload, policy.ttl_seconds),
        )
        .await
        .map_err(|_| CacheError::Timeout(self.timeout))??;
        tracing::debug!(bucket_index = index, ttl_seconds = policy.ttl_seconds, "response cached");
        Ok(index)
    }
}
