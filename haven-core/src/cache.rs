//! Memoization layer for embeddings and full responses.
//!
//! The pipeline treats every cache read and write as allowed to fail:
//! a miss, an error, and a disabled cache all fall through to the
//! non-cached path. Keys are derived from normalized input text so that
//! whitespace variants of the same message share entries.

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

/// A shared, concurrency-safe string cache with per-entry TTL.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Look up a key. `None` covers miss, expiry, and backend failure alike.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a value. Failures are swallowed; the caller never learns.
    async fn set(&self, key: &str, value: String, ttl: Duration);
}

/// Derive a cache key from normalized text.
///
/// Namespace prefixes ("llm", "emb") keep response and embedding entries
/// from colliding. The digest is truncated: 12 hex characters are plenty
/// at cache-sized cardinalities.
pub fn cache_key(namespace: &str, text: &str) -> String {
    let normalized = text.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{namespace}:{hex}")
}

/// Cache that stores nothing. Used when caching is disabled.
#[derive(Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) {}
}

/// Bounded in-memory LRU cache with TTL expiry on read.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Build the cache selected by configuration: a `MemoryCache` when
    /// enabled, otherwise a `NoopCache`.
    pub fn from_config(config: &CacheConfig) -> std::sync::Arc<dyn Cache> {
        if config.enabled {
            std::sync::Arc::new(MemoryCache::new(config.capacity))
        } else {
            std::sync::Arc::new(NoopCache)
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            // A poisoned lock means a panic elsewhere; treat as a miss.
            Err(_) => return None,
        };
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => {
                return Some(value.clone());
            }
            Some(_) => {} // expired, fall through and evict
            None => return None,
        }
        entries.pop(key);
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key.to_string(), (value, Instant::now() + ttl));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = MemoryCache::new(8);
        cache
            .set("llm:abc", "a reply".into(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("llm:abc").await.as_deref(), Some("a reply"));
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let cache = MemoryCache::new(8);
        assert!(cache.get("llm:missing").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = MemoryCache::new(8);
        cache
            .set("llm:old", "stale".into(), Duration::from_millis(5))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("llm:old").await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", "1".into(), ttl).await;
        cache.set("b", "2".into(), ttl).await;
        cache.set("c", "3".into(), ttl).await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_noop_cache_never_stores() {
        let cache = NoopCache;
        cache.set("k", "v".into(), Duration::from_secs(60)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[test]
    fn test_cache_key_normalizes_whitespace_and_case() {
        assert_eq!(
            cache_key("llm", "  How can I manage anxiety?  "),
            cache_key("llm", "how can i manage anxiety?")
        );
    }

    #[test]
    fn test_cache_key_namespaces_do_not_collide() {
        assert_ne!(cache_key("llm", "text"), cache_key("emb", "text"));
    }

    #[test]
    fn test_from_config_respects_enabled_flag() {
        let disabled = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        // Only behavior is observable; a disabled cache must never hit.
        let cache = MemoryCache::from_config(&disabled);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            cache.set("k", "v".into(), Duration::from_secs(60)).await;
            assert!(cache.get("k").await.is_none());
        });
    }
}
