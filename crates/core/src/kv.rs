//! Key-value store seam
//!
//! The embedding cache, answer cache, and conversation history live in an
//! external key-value store with per-key TTL. The engine only consumes
//! get/set semantics; durability belongs to the deployment. The in-memory
//! implementation backs tests and single-node setups.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

/// TTL'd key-value operations
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value; expired entries read as absent
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a value with a time-to-live
    async fn set(&self, key: &str, value: String, ttl: Duration);

    async fn delete(&self, key: &str);
}

/// In-process store with lazy expiry
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().1 > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some(entry) if entry.value().1 > Instant::now() => Some(entry.value().0.clone()),
            Some(_) => {
                drop(self.entries.remove(key));
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = InMemoryKvStore::new();
        store
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_expired_entry_reads_absent() {
        let store = InMemoryKvStore::new();
        store.set("k", "v".to_string(), Duration::ZERO).await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryKvStore::new();
        store
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await;
        store.delete("k").await;
        assert_eq!(store.get("k").await, None);
    }
}
