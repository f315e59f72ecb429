//! Embedding cache
//!
//! Content-addressed cache over the key-value seam. Keys include the model
//! name so a model swap can never serve vectors from the wrong space.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dealership_core::KeyValueStore;
use sha2::{Digest, Sha256};

/// Cache entry TTL (24 hours)
const CACHE_TTL: Duration = Duration::from_secs(86_400);

/// Hit/miss counters with derived hit rate
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// TTL'd embedding cache keyed by `SHA-256(model ":" text)`
pub struct EmbeddingCache {
    kv: Arc<dyn KeyValueStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Deterministic cache key: `embedding:v1:<first 32 hex of SHA-256>`
    pub fn cache_key(model: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        format!("embedding:v1:{}", &hex::encode(hasher.finalize())[..32])
    }

    pub async fn get(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        let key = Self::cache_key(model, text);
        match self.kv.get(&key).await {
            Some(raw) => match serde_json::from_str::<Vec<f32>>(&raw) {
                Ok(vector) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(vector)
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "dropping unreadable cache entry");
                    self.kv.delete(&key).await;
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(&self, model: &str, text: &str, embedding: &[f32]) {
        let key = Self::cache_key(model, text);
        match serde_json::to_string(embedding) {
            Ok(serialized) => self.kv.set(&key, serialized, CACHE_TTL).await,
            Err(e) => tracing::warn!(key = %key, error = %e, "failed to serialize embedding"),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealership_core::InMemoryKvStore;

    #[test]
    fn test_cache_key_format() {
        let key = EmbeddingCache::cache_key("voyage-3.5-large", "hello");
        assert!(key.starts_with("embedding:v1:"));
        assert_eq!(key.len(), "embedding:v1:".len() + 32);
    }

    #[test]
    fn test_cache_key_includes_model() {
        let a = EmbeddingCache::cache_key("model-a", "hello");
        let b = EmbeddingCache::cache_key("model-b", "hello");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_roundtrip_is_bitwise_equal() {
        let cache = EmbeddingCache::new(Arc::new(InMemoryKvStore::new()));
        let vector = vec![0.125f32, -0.5, 3.0];
        cache.put("m", "text", &vector).await;

        let restored = cache.get("m", "text").await.unwrap();
        assert_eq!(restored, vector);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_miss_is_counted() {
        let cache = EmbeddingCache::new(Arc::new(InMemoryKvStore::new()));
        assert!(cache.get("m", "absent").await.is_none());
        assert_eq!(cache.stats().misses, 1);
        assert!(cache.stats().hit_rate() < f64::EPSILON);
    }
}
