use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use super::{Clock, SystemClock};

/// Expired entries are dropped on read, and swept from the whole map once per this many puts.
const SWEEP_EVERY_PUTS: u64 = 256;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
    #[error("kv value is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Edge key-value store: get and put-with-TTL over opaque bytes.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    expires_at_ms: u64,
}

pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, KvEntry>>,
    clock: Arc<dyn Clock>,
    puts: AtomicU64,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryKvStore {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            puts: AtomicU64::new(0),
        }
    }

    pub async fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|entry| entry.expires_at_ms > now)
            .count()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if entry.expires_at_ms <= now {
            entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), KvError> {
        if ttl_seconds == 0 {
            return Ok(());
        }
        let now = self.clock.now_millis();
        let expires_at_ms = now.saturating_add(ttl_seconds.saturating_mul(1000));
        let mut entries = self.entries.lock().await;
        if (self.puts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY_PUTS == 0 {
            entries.retain(|_, entry| entry.expires_at_ms > now);
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
