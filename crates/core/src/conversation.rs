//! Conversation history
//!
//! Multi-turn context lives in the external key-value store keyed by
//! conversation id with a one-hour TTL. The engine appends turns and reads
//! a bounded window; it does not own durability.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kv::KeyValueStore;

/// One completed exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user: String,
    pub assistant: String,
    pub timestamp: DateTime<Utc>,
}

/// Turns kept per conversation on write
const STORE_CAP: usize = 10;
/// Turns handed to the generator
const PROMPT_CAP: usize = 5;
/// History TTL
const HISTORY_TTL: Duration = Duration::from_secs(3600);

/// Bounded conversation history over the key-value seam
#[derive(Clone)]
pub struct ConversationStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ConversationStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(conversation_id: &str) -> String {
        format!("conversation:{conversation_id}")
    }

    /// Full stored history (up to the store cap)
    pub async fn history(&self, conversation_id: &str) -> Vec<ConversationTurn> {
        let Some(raw) = self.kv.get(&Self::key(conversation_id)).await else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(conversation_id, error = %e, "dropping unreadable history");
            Vec::new()
        })
    }

    /// The window passed to the generator (last 5 turns)
    pub async fn prompt_window(&self, conversation_id: &str) -> Vec<ConversationTurn> {
        let history = self.history(conversation_id).await;
        let skip = history.len().saturating_sub(PROMPT_CAP);
        history.into_iter().skip(skip).collect()
    }

    /// Append one exchange, capping the stored sequence to the last 10 turns.
    ///
    /// Writes are linearizable per conversation id through the store's
    /// single-key semantics; cross-conversation ordering is undefined.
    pub async fn append(&self, conversation_id: &str, user: &str, assistant: &str) {
        let mut history = self.history(conversation_id).await;
        history.push(ConversationTurn {
            user: user.to_string(),
            assistant: assistant.to_string(),
            timestamp: Utc::now(),
        });

        let skip = history.len().saturating_sub(STORE_CAP);
        let bounded: Vec<_> = history.into_iter().skip(skip).collect();

        match serde_json::to_string(&bounded) {
            Ok(serialized) => {
                self.kv
                    .set(&Self::key(conversation_id), serialized, HISTORY_TTL)
                    .await;
            }
            Err(e) => tracing::error!(conversation_id, error = %e, "failed to serialize history"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    #[tokio::test]
    async fn test_append_and_history() {
        let store = ConversationStore::new(Arc::new(InMemoryKvStore::new()));
        store.append("c1", "hi", "hello").await;
        store.append("c1", "price?", "it is $28,000").await;

        let history = store.history("c1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].user, "price?");
    }

    #[tokio::test]
    async fn test_store_cap_keeps_last_ten() {
        let store = ConversationStore::new(Arc::new(InMemoryKvStore::new()));
        for i in 0..15 {
            store.append("c1", &format!("q{i}"), &format!("a{i}")).await;
        }

        let history = store.history("c1").await;
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].user, "q5");
        assert_eq!(history[9].user, "q14");
    }

    #[tokio::test]
    async fn test_prompt_window_is_last_five() {
        let store = ConversationStore::new(Arc::new(InMemoryKvStore::new()));
        for i in 0..8 {
            store.append("c1", &format!("q{i}"), &format!("a{i}")).await;
        }

        let window = store.prompt_window("c1").await;
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].user, "q3");
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let store = ConversationStore::new(Arc::new(InMemoryKvStore::new()));
        store.append("c1", "a", "b").await;
        assert!(store.history("c2").await.is_empty());
    }
}
