//! Cross-encoder re-ranker client
//!
//! Scores a short candidate list jointly against the query. The retriever
//! treats every failure here as recoverable and falls back to fused order.

use std::time::Duration;

use dealership_config::RerankConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::RagError;

/// Candidate list limit accepted by the model
pub const MAX_DOCUMENTS: usize = 20;
/// Per-document character limit
const MAX_DOC_CHARS: usize = 2000;
/// Per-call deadline
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts with exponential backoff (1s, 2s)
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<String>,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankScore>,
}

/// One scored candidate, by input index
#[derive(Debug, Clone, Deserialize)]
pub struct RerankScore {
    pub index: usize,
    pub relevance_score: f32,
}

/// Re-rank API client
pub struct RerankClient {
    client: Client,
    config: RerankConfig,
}

impl RerankClient {
    /// Returns `None` when no endpoint is configured (re-ranking disabled)
    pub fn from_config(config: RerankConfig) -> Option<Self> {
        if config.endpoint.is_empty() {
            return None;
        }
        Some(Self {
            client: Client::new(),
            config,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Score `documents` against `query`, descending by relevance.
    ///
    /// At most 20 documents are sent, each truncated to 2000 characters.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankScore>, RagError> {
        if documents.is_empty() || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let documents: Vec<String> = documents
            .iter()
            .take(MAX_DOCUMENTS)
            .map(|doc| truncate_chars(doc, MAX_DOC_CHARS))
            .collect();
        let top_n = top_n.min(documents.len());

        let request = RerankRequest {
            model: &self.config.model,
            query,
            documents,
            top_n,
        };
        let url = format!("{}/v1/rerank", self.config.endpoint);

        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            let send = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&request)
                .send();

            let outcome = async {
                let response = tokio::time::timeout(CALL_TIMEOUT, send)
                    .await
                    .map_err(|_| RagError::Rerank("rerank call timed out after 30s".to_string()))?
                    .map_err(|e| RagError::Rerank(format!("rerank request failed: {e}")))?;

                if !response.status().is_success() {
                    let status = response.status();
                    return Err(RagError::Rerank(format!("rerank service returned {status}")));
                }

                response
                    .json::<RerankResponse>()
                    .await
                    .map_err(|e| RagError::Rerank(format!("unreadable rerank response: {e}")))
            }
            .await;

            match outcome {
                Ok(parsed) => return Ok(parsed.results),
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "rerank attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt + 1 < MAX_RETRIES {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| RagError::Rerank("rerank failed".to_string())))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_endpoint() {
        assert!(RerankClient::from_config(RerankConfig::default()).is_none());

        let enabled = RerankConfig {
            endpoint: "http://localhost:9300".to_string(),
            ..Default::default()
        };
        assert!(RerankClient::from_config(enabled).is_some());
    }

    #[test]
    fn test_truncation_appends_ellipsis() {
        let long = "x".repeat(3000);
        let truncated = truncate_chars(&long, MAX_DOC_CHARS);
        assert_eq!(truncated.chars().count(), MAX_DOC_CHARS + 3);
        assert!(truncated.ends_with("..."));

        assert_eq!(truncate_chars("short", MAX_DOC_CHARS), "short");
    }

    #[tokio::test]
    async fn test_empty_inputs_short_circuit() {
        let client = RerankClient::from_config(RerankConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert!(client.rerank("query", &[], 5).await.unwrap().is_empty());
        assert!(client
            .rerank("  ", &["doc".to_string()], 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_response_parsing() {
        let parsed: RerankResponse = serde_json::from_str(
            r#"{"results":[{"index":2,"relevance_score":0.91},{"index":0,"relevance_score":0.4}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].index, 2);
    }
}
