// ============================================================================
// Key/Value Cache - Read-Through TTL Cache
// ============================================================================
//
// Thread-safe, in-memory cache for store rows on the request hot path.
// Every call is best-effort: a cache failure falls back to the authoritative
// store and is logged, never surfaced to the caller.
//
// Industry standard: Redis-backed for distributed deployments, in-memory
// DashMap for a single instance.
//
// ============================================================================

pub mod keys;
pub mod lock;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-scoped cache handle. Values are opaque byte blobs; the typed
/// helpers encode through `serde_json`.
pub struct CacheService {
    entries: Arc<DashMap<String, CacheEntry>>,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheService {
    pub fn new(enabled: bool) -> Arc<Self> {
        let service = Arc::new(Self {
            entries: Arc::new(DashMap::new()),
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });

        // Background sweep for expired entries
        let sweep = Arc::downgrade(&service);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(60)).await;
                let Some(cache) = sweep.upgrade() else { break };
                let now = Instant::now();
                let before = cache.entries.len();
                cache.entries.retain(|_, entry| now < entry.expires_at);
                let removed = before.saturating_sub(cache.entries.len());
                if removed > 0 {
                    cache.evictions.fetch_add(removed as u64, Ordering::Relaxed);
                    tracing::debug!(removed, "cache sweep removed expired entries");
                }
            }
        });

        service
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if !self.enabled || ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry { value, expires_at: Instant::now() + ttl },
        );
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        // Read under the shard guard, mutate after it is released.
        let lookup = match self.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Some(Some(entry.value.clone())),
            Some(_) => Some(None),
            None => None,
        };
        match lookup {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                self.entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn delete(&self, keys: &[&str]) {
        for key in keys {
            self.entries.remove(*key);
        }
    }

    /// Invalidate every key under a prefix. Used for the quota-usage entries,
    /// whose window fragment is not known to the writer.
    pub fn delete_prefix(&self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| Instant::now() < entry.expires_at)
            .unwrap_or(false)
    }

    /// Typed set. Encoding failures are logged and dropped; the store remains
    /// authoritative.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, bytes, ttl),
            Err(e) => tracing::warn!(key, error = %e, "cache encode failed"),
        }
    }

    /// Typed get. A blob that no longer decodes counts as a miss and is
    /// dropped.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "cache decode failed, dropping entry");
                self.entries.remove(key);
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
