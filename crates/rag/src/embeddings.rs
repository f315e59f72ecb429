//! Embedding client
//!
//! Batched text-to-vector conversion against a REST embedding service, with
//! a content-addressed cache, bounded retries, and per-call timeouts. All
//! network calls are gated by the embedding circuit breaker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dealership_config::EmbeddingConfig;
use dealership_core::{BreakerError, CircuitBreaker};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheStats, EmbeddingCache};
use crate::RagError;

/// Input length limit enforced before any API call
const MAX_INPUT_CHARS: usize = 32_000;
/// Per-call timeout for single embeddings
const SINGLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-call timeout for batch embeddings
const BATCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Retry attempts for single embeddings (backoff 1s, 2s, 4s)
const MAX_RETRIES: u32 = 3;
/// Default texts per API call
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Retrieval-side hint forwarded to the embedding model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Document,
    Query,
}

impl InputType {
    fn as_str(&self) -> &'static str {
        match self {
            InputType::Document => "document",
            InputType::Query => "query",
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    input_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Running counters for production monitoring
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingStats {
    pub generated: u64,
    pub api_calls: u64,
    pub api_errors: u64,
    pub cache: CacheStats,
}

impl EmbeddingStats {
    pub fn error_rate(&self) -> f64 {
        if self.api_calls == 0 {
            0.0
        } else {
            self.api_errors as f64 / self.api_calls as f64
        }
    }
}

/// Aligned batch result; failed or invalid slots carry zero vectors so
/// downstream indexing is never blocked.
#[derive(Debug)]
pub struct BatchEmbeddings {
    pub vectors: Vec<Vec<f32>>,
    pub errors: Vec<String>,
}

/// Embedding service client
pub struct EmbeddingClient {
    client: Client,
    config: EmbeddingConfig,
    cache: EmbeddingCache,
    breaker: Arc<CircuitBreaker>,
    generated: AtomicU64,
    api_calls: AtomicU64,
    api_errors: AtomicU64,
}

impl EmbeddingClient {
    pub fn new(
        config: EmbeddingConfig,
        cache: EmbeddingCache,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: Client::new(),
            config,
            cache,
            breaker,
            generated: AtomicU64::new(0),
            api_calls: AtomicU64::new(0),
            api_errors: AtomicU64::new(0),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Zero vector used for invalid or failed batch slots
    pub fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.config.dimension]
    }

    /// Embed one text.
    ///
    /// Rejects empty and over-long input, consults the cache, then calls the
    /// service with a 30s deadline and up to 3 attempts (1s/2s/4s backoff
    /// plus jitter). A dimension mismatch is logged but the vector is still
    /// returned.
    pub async fn embed_single(
        &self,
        text: &str,
        input_type: InputType,
    ) -> Result<Vec<f32>, RagError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RagError::Embedding(
                "cannot embed empty or whitespace-only text".to_string(),
            ));
        }
        if text.chars().count() > MAX_INPUT_CHARS {
            return Err(RagError::Embedding(format!(
                "text too long, maximum {MAX_INPUT_CHARS} characters"
            )));
        }

        if let Some(cached) = self.cache.get(&self.config.model, text).await {
            return Ok(cached);
        }

        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            let input = [text.to_string()];
            match self.call_api(&input, input_type, SINGLE_TIMEOUT).await {
                Ok(mut embeddings) if !embeddings.is_empty() => {
                    let embedding = embeddings.swap_remove(0);
                    self.validate_dimension(&embedding);
                    self.generated.fetch_add(1, Ordering::Relaxed);
                    self.cache.put(&self.config.model, text, &embedding).await;
                    return Ok(embedding);
                }
                Ok(_) => {
                    last_error = Some(RagError::Embedding(
                        "empty response from embedding service".to_string(),
                    ));
                }
                Err(e) => {
                    if matches!(e, RagError::Unavailable(_)) {
                        // Circuit is open; retrying would not reach the service
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }

            if attempt + 1 < MAX_RETRIES {
                let backoff = Duration::from_secs(1 << attempt);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tracing::warn!(
                    attempt = attempt + 1,
                    backoff_secs = backoff.as_secs(),
                    "embedding call failed, retrying"
                );
                tokio::time::sleep(backoff + jitter).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| RagError::Embedding("embedding generation failed".to_string())))
    }

    /// Embed many texts preserving input order.
    ///
    /// Invalid texts (empty or over-long) and texts in failed batches get
    /// zero-vector placeholders; per-text cache hits shrink the outgoing
    /// batch. The call itself never fails.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        input_type: InputType,
        batch_size: usize,
    ) -> BatchEmbeddings {
        let batch_size = batch_size.clamp(1, DEFAULT_BATCH_SIZE);
        let mut vectors = vec![Vec::new(); texts.len()];
        let mut errors = Vec::new();

        // Partition into valid (index, trimmed text) pairs and zero-filled rejects
        let mut valid: Vec<(usize, String)> = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.chars().count() > MAX_INPUT_CHARS {
                tracing::warn!(index = i, "skipping invalid text, zero-filling slot");
                vectors[i] = self.zero_vector();
            } else {
                valid.push((i, trimmed.to_string()));
            }
        }

        for window in valid.chunks(batch_size) {
            let mut uncached: Vec<(usize, String)> = Vec::new();
            for (original_idx, text) in window {
                match self.cache.get(&self.config.model, text).await {
                    Some(cached) => vectors[*original_idx] = cached,
                    None => uncached.push((*original_idx, text.clone())),
                }
            }

            if uncached.is_empty() {
                continue;
            }

            let inputs: Vec<String> = uncached.iter().map(|(_, t)| t.clone()).collect();
            match self.call_api(&inputs, input_type, BATCH_TIMEOUT).await {
                Ok(embeddings) => {
                    for (slot, embedding) in uncached.iter().zip(embeddings.into_iter()) {
                        if embedding.is_empty() {
                            vectors[slot.0] = self.zero_vector();
                            continue;
                        }
                        self.validate_dimension(&embedding);
                        self.generated.fetch_add(1, Ordering::Relaxed);
                        self.cache.put(&self.config.model, &slot.1, &embedding).await;
                        vectors[slot.0] = embedding;
                    }
                    // A short response zero-fills the remaining slots
                    for (idx, _) in &uncached {
                        if vectors[*idx].is_empty() {
                            vectors[*idx] = self.zero_vector();
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, batch = window.len(), "batch embedding failed, zero-filling");
                    errors.push(format!("batch embedding failed: {e}"));
                    for (idx, _) in &uncached {
                        vectors[*idx] = self.zero_vector();
                    }
                }
            }
        }

        BatchEmbeddings { vectors, errors }
    }

    /// One breaker-gated API call with a hard deadline
    async fn call_api(
        &self,
        input: &[String],
        input_type: InputType,
        deadline: Duration,
    ) -> Result<Vec<Vec<f32>>, RagError> {
        self.api_calls.fetch_add(1, Ordering::Relaxed);

        let request = EmbedRequest {
            model: &self.config.model,
            input,
            input_type: input_type.as_str(),
        };
        let url = format!("{}/v1/embeddings", self.config.endpoint);

        let result = self
            .breaker
            .call(async {
                let send = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.config.api_key)
                    .json(&request)
                    .send();

                let response = tokio::time::timeout(deadline, send)
                    .await
                    .map_err(|_| {
                        RagError::Embedding(format!(
                            "embedding request timed out after {}s",
                            deadline.as_secs()
                        ))
                    })?
                    .map_err(|e| RagError::Embedding(format!("embedding request failed: {e}")))?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(RagError::Embedding(format!(
                        "embedding service returned {status}: {body}"
                    )));
                }

                let parsed: EmbedResponse = response.json().await.map_err(|e| {
                    RagError::Embedding(format!("failed to parse embedding response: {e}"))
                })?;
                Ok(parsed.embeddings)
            })
            .await;

        match result {
            Ok(embeddings) => Ok(embeddings),
            Err(BreakerError::Open { name, retry_in }) => {
                self.api_errors.fetch_add(1, Ordering::Relaxed);
                Err(RagError::Unavailable(format!(
                    "{name} circuit open, retry in {retry_in:.1}s"
                )))
            }
            Err(BreakerError::Inner(e)) => {
                self.api_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn validate_dimension(&self, embedding: &[f32]) {
        if embedding.len() != self.config.dimension {
            tracing::warn!(
                got = embedding.len(),
                expected = self.config.dimension,
                "unexpected embedding dimension"
            );
        }
    }

    pub fn stats(&self) -> EmbeddingStats {
        EmbeddingStats {
            generated: self.generated.load(Ordering::Relaxed),
            api_calls: self.api_calls.load(Ordering::Relaxed),
            api_errors: self.api_errors.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealership_core::InMemoryKvStore;

    fn client() -> EmbeddingClient {
        let config = EmbeddingConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            api_key: String::new(),
            model: "test-model".to_string(),
            dimension: 4,
        };
        EmbeddingClient::new(
            config,
            EmbeddingCache::new(Arc::new(InMemoryKvStore::new())),
            Arc::new(CircuitBreaker::embedding_service()),
        )
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let client = client();
        let err = client.embed_single("   ", InputType::Query).await;
        assert!(matches!(err, Err(RagError::Embedding(_))));
    }

    #[tokio::test]
    async fn test_oversize_text_rejected() {
        let client = client();
        let text = "x".repeat(MAX_INPUT_CHARS + 1);
        let err = client.embed_single(&text, InputType::Document).await;
        assert!(matches!(err, Err(RagError::Embedding(_))));
    }

    #[tokio::test]
    async fn test_batch_zero_fills_invalid_slots() {
        let client = client();
        let texts = vec![String::new(), "   ".to_string()];
        let result = client
            .embed_batch(&texts, InputType::Document, DEFAULT_BATCH_SIZE)
            .await;

        assert_eq!(result.vectors.len(), 2);
        assert_eq!(result.vectors[0], client.zero_vector());
        assert_eq!(result.vectors[1], client.zero_vector());
    }

    #[tokio::test]
    async fn test_cached_single_skips_api() {
        let client = client();
        // Pre-seed the cache so no network call is attempted
        client.cache.put("test-model", "camry", &[1.0, 2.0, 3.0, 4.0]).await;

        let vector = client.embed_single("camry", InputType::Query).await.unwrap();
        assert_eq!(vector, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(client.stats().api_calls, 0);
        assert_eq!(client.stats().cache.hits, 1);
    }

    #[tokio::test]
    async fn test_batch_uses_cache_and_zero_fills_failures() {
        let client = client();
        client.cache.put("test-model", "cached text", &[9.0, 9.0, 9.0, 9.0]).await;

        let texts = vec!["cached text".to_string(), "uncached text".to_string()];
        let result = client
            .embed_batch(&texts, InputType::Document, DEFAULT_BATCH_SIZE)
            .await;

        // Cached slot kept, unreachable endpoint zero-fills the other slot
        assert_eq!(result.vectors[0], vec![9.0, 9.0, 9.0, 9.0]);
        assert_eq!(result.vectors[1], client.zero_vector());
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn test_input_type_wire_values() {
        assert_eq!(InputType::Document.as_str(), "document");
        assert_eq!(InputType::Query.as_str(), "query");
    }
}
