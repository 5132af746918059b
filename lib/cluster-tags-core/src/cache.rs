//! Shared key-value cache holding per-node bundles

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Prefix shared by every key this process writes
pub const AGENT_CACHE_PREFIX: &str = "agent";

/// Values are type-erased; readers downcast to the type they expect
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Lifetime of a cache entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiration {
    /// Entry stays until explicitly deleted
    Never,
    /// Entry expires after the given duration
    After(Duration),
}

/// Build a cache key of the form `agent/<part>/<part>...`
pub fn build_cache_key(parts: &[&str]) -> String {
    let mut key = AGENT_CACHE_PREFIX.to_string();
    for part in parts {
        key.push('/');
        key.push_str(part);
    }
    key
}

/// SharedCache is the process-wide store bundles are published to
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Get a value, `None` when absent or expired
    async fn get(&self, key: &str) -> Option<CacheValue>;

    /// Insert or replace a value
    async fn set(&self, key: String, value: CacheValue, expiration: Expiration);

    /// Remove a value if present
    async fn delete(&self, key: &str);
}

struct CacheEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory SharedCache with lazy expiry
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Remove expired entries, returning how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
        purged
    }

    /// Number of stored entries, including expired ones not yet purged
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Keys currently stored
    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<CacheValue> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    async fn set(&self, key: String, value: CacheValue, expiration: Expiration) {
        let expires_at = match expiration {
            Expiration::Never => None,
            Expiration::After(ttl) => Some(Instant::now() + ttl),
        };
        let mut entries = self.entries.write().await;
        entries.insert(key, CacheEntry { value, expires_at });
    }

    async fn delete(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }
}
