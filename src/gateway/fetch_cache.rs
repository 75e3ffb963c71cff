//! Fetch-through caching over the KV store with explicit invalidation.

use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::kv::KvStore;

/// Receives the key of every explicit invalidation so derived caches can evict too.
#[async_trait]
pub trait InvalidationHook: Send + Sync {
    async fn invalidated(&self, key: &str);
}

pub struct CacheOrFetch<K: ?Sized, V> {
    kv: Arc<dyn KvStore>,
    namespace: String,
    ttl_seconds: u64,
    hooks: Vec<Arc<dyn InvalidationHook>>,
    _marker: PhantomData<fn(&K) -> V>,
}

impl<K, V> CacheOrFetch<K, V>
where
    K: Display + ?Sized + Sync,
    V: Serialize + DeserializeOwned + Send,
{
    pub fn new(kv: Arc<dyn KvStore>, namespace: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            ttl_seconds,
            hooks: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn with_invalidation_hook(mut self, hook: Arc<dyn InvalidationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    fn storage_key(&self, key: &K) -> String {
        format!("{}:{key}", self.namespace)
    }

    /// Cached value for `key`. Store failures and undecodable entries read as a miss.
    pub async fn get_cached(&self, key: &K) -> Option<V> {
        let storage_key = self.storage_key(key);
        match self.kv.get(&storage_key).await {
            Ok(Some(raw)) => match serde_json::from_slice(&raw) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::debug!(key = %storage_key, error = %err, "dropping undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key = %storage_key, error = %err, "cache read failed; fetching");
                None
            }
        }
    }

    pub async fn put(&self, key: &K, value: &V) {
        let storage_key = self.storage_key(key);
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(key = %storage_key, error = %err, "cache encode failed");
                return;
            }
        };
        if let Err(err) = self.kv.put(&storage_key, payload, self.ttl_seconds).await {
            tracing::warn!(key = %storage_key, error = %err, "cache write failed");
        }
    }

    /// Returns the cached value, or runs `fetch` and caches a `Some` result.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &K, fetch: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(value) = self.get_cached(key).await {
            return Ok(Some(value));
        }
        let fetched = fetch().await?;
        if let Some(value) = fetched.as_ref() {
            self.put(key, value).await;
        }
        Ok(fetched)
    }

    /// Evicts `key` and notifies every registered hook.
    pub async fn invalidate(&self, key: &K) {
        let storage_key = self.storage_key(key);
        if let Err(err) = self.kv.delete(&storage_key).await {
            tracing::warn!(key = %storage_key, error = %err, "cache invalidation failed");
        }
        let key = key.to_string();
        for hook in &self.hooks {
            hook.invalidated(&key).await;
        }
    }
}

#[async_trait]
impl<V> InvalidationHook for CacheOrFetch<str, V>
where
    V: Serialize + DeserializeOwned + Send,
{
    async fn invalidated(&self, key: &str) {
        self.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::kv::MemoryKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fetches_once_then_serves_from_cache() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::default());
        let cache = CacheOrFetch::<str, String>::new(kv, "org", 60);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_fetch("a", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(Some("value".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("value"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn misses_are_not_cached() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::default());
        let cache = CacheOrFetch::<str, String>::new(kv, "org", 60);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = cache
                .get_or_fetch("a", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(None)
                })
                .await
                .unwrap();
            assert!(value.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_evicts_derived_caches() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::default());
        let derived = Arc::new(CacheOrFetch::<str, u32>::new(kv.clone(), "derived", 60));
        let primary = CacheOrFetch::<str, u32>::new(kv, "primary", 60)
            .with_invalidation_hook(derived.clone());

        primary.put("k", &1).await;
        derived.put("k", &2).await;

        primary.invalidate("k").await;
        assert_eq!(primary.get_cached("k").await, None);
        assert_eq!(derived.get_cached("k").await, None);
    }
}
