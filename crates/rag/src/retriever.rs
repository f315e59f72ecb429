//! Hybrid retriever
//!
//! Concurrent dense + keyword fan-out with weighted Reciprocal Rank Fusion
//! and optional cross-encoder re-ranking. Either branch may fail without
//! taking down the request; only both branches failing surfaces an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dealership_config::RagTuning;
use dealership_core::RetrievedDocument;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::embeddings::{EmbeddingClient, InputType};
use crate::lexical::LexicalIndex;
use crate::reranker::{RerankClient, MAX_DOCUMENTS};
use crate::vector_store::VectorStore;
use crate::RagError;

/// RRF denominator constant
const RRF_K: f64 = 60.0;

/// Per-branch outcome counters
#[derive(Debug, Clone, Copy, Default)]
pub struct RetrieverStats {
    pub total_queries: u64,
    pub vector_errors: u64,
    pub keyword_errors: u64,
    pub rerank_errors: u64,
}

/// Hybrid retriever over both index clients
pub struct HybridRetriever {
    embedder: Arc<EmbeddingClient>,
    vector: Arc<VectorStore>,
    lexical: Arc<LexicalIndex>,
    reranker: Option<Arc<RerankClient>>,
    tuning: RagTuning,
    total_queries: AtomicU64,
    vector_errors: AtomicU64,
    keyword_errors: AtomicU64,
    rerank_errors: AtomicU64,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<EmbeddingClient>,
        vector: Arc<VectorStore>,
        lexical: Arc<LexicalIndex>,
        reranker: Option<Arc<RerankClient>>,
        tuning: RagTuning,
    ) -> Self {
        Self {
            embedder,
            vector,
            lexical,
            reranker,
            tuning,
            total_queries: AtomicU64::new(0),
            vector_errors: AtomicU64::new(0),
            keyword_errors: AtomicU64::new(0),
            rerank_errors: AtomicU64::new(0),
        }
    }

    /// Retrieve the most relevant documents for `query` in `namespace`.
    ///
    /// Filters are applied inside both branches so fusion only ever sees
    /// already-filtered candidates. An empty query returns an empty list
    /// without touching either index.
    pub async fn retrieve(
        &self,
        query: &str,
        namespace: &str,
        filters: Option<&HashMap<String, Value>>,
        top_k: usize,
        use_rerank: bool,
    ) -> Result<Vec<RetrievedDocument>, RagError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.total_queries.fetch_add(1, Ordering::Relaxed);

        let per_branch = self.tuning.top_k_retrieval;

        // Concurrent fan-out; each branch degrades to empty on failure
        let (vector_outcome, keyword_outcome) = tokio::join!(
            self.vector_branch(query, namespace, filters, per_branch),
            self.keyword_branch(query, namespace, filters, per_branch),
        );

        let (vector_docs, vector_failed) = vector_outcome;
        let (keyword_docs, keyword_failed) = keyword_outcome;

        if vector_failed && keyword_failed {
            return Err(RagError::Search(
                "both retrieval branches failed".to_string(),
            ));
        }
        if vector_docs.is_empty() && keyword_docs.is_empty() {
            return Ok(Vec::new());
        }

        let fused = self.fuse(vector_docs, keyword_docs);

        let mut results = if use_rerank && self.reranker.is_some() && !fused.is_empty() {
            self.rerank(query, fused, top_k).await
        } else {
            fused
        };

        results.truncate(top_k);

        let reranked = results
            .first()
            .map(|doc| doc.metadata.contains_key("rerank_score"))
            .unwrap_or(false);
        let timestamp = Utc::now().timestamp();
        for (i, doc) in results.iter_mut().enumerate() {
            doc.metadata
                .insert("final_rank".to_string(), Value::from(i + 1));
            doc.metadata.insert(
                "retrieval_method".to_string(),
                Value::from("hybrid_rrf"),
            );
            doc.metadata
                .insert("namespace".to_string(), Value::from(namespace));
            doc.metadata
                .insert("retrieval_timestamp".to_string(), Value::from(timestamp));
            doc.metadata
                .insert("reranked".to_string(), Value::from(reranked));
        }

        Ok(results)
    }

    /// Embed the query and search the vector index.
    ///
    /// Returns `(documents, failed)`; a failure here means the keyword
    /// branch carries the request alone.
    async fn vector_branch(
        &self,
        query: &str,
        namespace: &str,
        filters: Option<&HashMap<String, Value>>,
        top_k: usize,
    ) -> (Vec<RetrievedDocument>, bool) {
        let embedding = match self.embedder.embed_single(query, InputType::Query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                self.vector_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "query embedding failed, skipping vector branch");
                return (Vec::new(), true);
            }
        };

        let matches = self.vector.query(namespace, &embedding, top_k, filters).await;
        let documents = matches
            .into_iter()
            .map(|m| {
                let mut metadata = m.metadata;
                let content = metadata
                    .remove("text")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                metadata.insert("vector_score".to_string(), Value::from(m.score as f64));
                metadata.insert("search_id".to_string(), Value::from(m.id));
                RetrievedDocument { content, metadata }
            })
            .collect();

        (documents, false)
    }

    async fn keyword_branch(
        &self,
        query: &str,
        namespace: &str,
        filters: Option<&HashMap<String, Value>>,
        top_k: usize,
    ) -> (Vec<RetrievedDocument>, bool) {
        match self.lexical.search(namespace, query, top_k, filters).await {
            Ok(hits) => {
                let documents = hits
                    .into_iter()
                    .map(|hit| {
                        let mut metadata = hit.metadata;
                        metadata.insert("bm25_score".to_string(), Value::from(hit.bm25_score as f64));
                        metadata.insert("search_id".to_string(), Value::from(hit.id));
                        if !hit.highlights.is_empty() {
                            metadata.insert("highlights".to_string(), Value::from(hit.highlights));
                        }
                        RetrievedDocument {
                            content: hit.content,
                            metadata,
                        }
                    })
                    .collect();
                (documents, false)
            }
            Err(e) => {
                self.keyword_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "keyword search failed, skipping lexical branch");
                (Vec::new(), true)
            }
        }
    }

    /// Weighted Reciprocal Rank Fusion.
    ///
    /// Documents are deduplicated by content hash; a document ranked `r`
    /// (1-based) contributes `weight / (k + r)` per list. Ties resolve by
    /// original vector rank, then keyword rank.
    fn fuse(
        &self,
        vector_docs: Vec<RetrievedDocument>,
        keyword_docs: Vec<RetrievedDocument>,
    ) -> Vec<RetrievedDocument> {
        struct Fused {
            doc: RetrievedDocument,
            score: f64,
            vector_rank: Option<usize>,
            keyword_rank: Option<usize>,
        }

        let mut by_hash: HashMap<String, Fused> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for (rank, doc) in vector_docs.into_iter().enumerate() {
            let rank = rank + 1;
            let hash = fuse_key(&doc.content);
            let contribution = self.tuning.vector_weight / (RRF_K + rank as f64);
            let entry = by_hash.entry(hash.clone()).or_insert_with(|| {
                order.push(hash);
                Fused {
                    doc,
                    score: 0.0,
                    vector_rank: None,
                    keyword_rank: None,
                }
            });
            entry.score += contribution;
            entry.vector_rank.get_or_insert(rank);
        }

        for (rank, doc) in keyword_docs.into_iter().enumerate() {
            let rank = rank + 1;
            let hash = fuse_key(&doc.content);
            let contribution = self.tuning.bm25_weight / (RRF_K + rank as f64);
            let entry = by_hash.entry(hash.clone()).or_insert_with(|| {
                order.push(hash);
                Fused {
                    doc,
                    score: 0.0,
                    vector_rank: None,
                    keyword_rank: None,
                }
            });
            entry.score += contribution;
            entry.keyword_rank.get_or_insert(rank);
        }

        let mut fused: Vec<Fused> = order
            .into_iter()
            .filter_map(|hash| by_hash.remove(&hash))
            .collect();

        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_key = (
                        a.vector_rank.unwrap_or(usize::MAX),
                        a.keyword_rank.unwrap_or(usize::MAX),
                    );
                    let b_key = (
                        b.vector_rank.unwrap_or(usize::MAX),
                        b.keyword_rank.unwrap_or(usize::MAX),
                    );
                    a_key.cmp(&b_key)
                })
        });

        fused
            .into_iter()
            .map(|entry| {
                let mut doc = entry.doc;
                doc.metadata
                    .insert("rrf_score".to_string(), Value::from(entry.score));
                if let Some(rank) = entry.vector_rank {
                    doc.metadata.insert("vector_rank".to_string(), Value::from(rank));
                }
                if let Some(rank) = entry.keyword_rank {
                    doc.metadata
                        .insert("keyword_rank".to_string(), Value::from(rank));
                }
                doc
            })
            .collect()
    }

    /// Re-rank the fused head with the cross-encoder; any failure falls
    /// back to fused order.
    async fn rerank(
        &self,
        query: &str,
        fused: Vec<RetrievedDocument>,
        top_k: usize,
    ) -> Vec<RetrievedDocument> {
        let Some(reranker) = self.reranker.as_ref() else {
            return fused;
        };

        let candidates: Vec<String> = fused
            .iter()
            .take(MAX_DOCUMENTS)
            .map(|doc| doc.content.clone())
            .collect();

        match reranker.rerank(query, &candidates, top_k.min(candidates.len())).await {
            Ok(scores) if !scores.is_empty() => {
                let mut reranked = Vec::with_capacity(scores.len());
                let mut taken: Vec<Option<RetrievedDocument>> =
                    fused.into_iter().map(Some).collect();

                for (position, score) in scores.into_iter().enumerate() {
                    let Some(slot) = taken.get_mut(score.index) else {
                        tracing::warn!(index = score.index, "rerank returned invalid index");
                        continue;
                    };
                    if let Some(mut doc) = slot.take() {
                        doc.metadata.insert(
                            "rerank_score".to_string(),
                            Value::from(score.relevance_score as f64),
                        );
                        doc.metadata
                            .insert("rerank_position".to_string(), Value::from(position + 1));
                        doc.metadata.insert(
                            "rerank_model".to_string(),
                            Value::from(reranker.model()),
                        );
                        reranked.push(doc);
                    }
                }
                reranked
            }
            Ok(_) => fused,
            Err(e) => {
                self.rerank_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "re-ranking failed, keeping fused order");
                fused
            }
        }
    }

    pub fn stats(&self) -> RetrieverStats {
        RetrieverStats {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            vector_errors: self.vector_errors.load(Ordering::Relaxed),
            keyword_errors: self.keyword_errors.load(Ordering::Relaxed),
            rerank_errors: self.rerank_errors.load(Ordering::Relaxed),
        }
    }
}

/// Dedup key across branches: SHA-256 of the text body
fn fuse_key(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use dealership_config::{EmbeddingConfig, LexicalConfig, VectorStoreConfig};
    use dealership_core::{CircuitBreaker, InMemoryKvStore};

    fn retriever() -> HybridRetriever {
        let embedder = Arc::new(EmbeddingClient::new(
            EmbeddingConfig {
                endpoint: "http://127.0.0.1:1".to_string(),
                api_key: String::new(),
                model: "test".to_string(),
                dimension: 4,
            },
            EmbeddingCache::new(Arc::new(InMemoryKvStore::new())),
            Arc::new(CircuitBreaker::embedding_service()),
        ));
        let vector = Arc::new(
            VectorStore::new(
                VectorStoreConfig::default(),
                4,
                Arc::new(CircuitBreaker::vector_store()),
            )
            .unwrap(),
        );
        let lexical = Arc::new(LexicalIndex::new(LexicalConfig::default()));
        HybridRetriever::new(embedder, vector, lexical, None, RagTuning::default())
    }

    fn doc(content: &str) -> RetrievedDocument {
        RetrievedDocument::new(content)
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty() {
        let retriever = retriever();
        let results = retriever
            .retrieve("   ", "default", None, 5, true)
            .await
            .unwrap();
        assert!(results.is_empty());
        // Short-circuited before counting as a query
        assert_eq!(retriever.stats().total_queries, 0);
    }

    #[test]
    fn test_rrf_overlap_boosts_shared_document() {
        let retriever = retriever();

        let vector_docs = vec![doc("doc-a"), doc("doc-b")];
        let keyword_docs = vec![doc("doc-b"), doc("doc-c")];

        let fused = retriever.fuse(vector_docs, keyword_docs);
        assert_eq!(fused.len(), 3);

        // doc-b appears in both lists: 0.6/(60+2) + 0.4/(60+1)
        let expected_b = 0.6 / 62.0 + 0.4 / 61.0;
        let b = fused.iter().find(|d| d.content == "doc-b").unwrap();
        assert!((b.score("rrf_score").unwrap() - expected_b).abs() < 1e-9);
        assert_eq!(b.metadata.get("vector_rank"), Some(&Value::from(2)));
        assert_eq!(b.metadata.get("keyword_rank"), Some(&Value::from(1)));

        // doc-b outranks both single-list documents
        assert_eq!(fused[0].content, "doc-b");
    }

    #[test]
    fn test_rrf_sorted_non_increasing() {
        let retriever = retriever();
        let vector_docs = vec![doc("a"), doc("b"), doc("c")];
        let keyword_docs = vec![doc("c"), doc("d")];

        let fused = retriever.fuse(vector_docs, keyword_docs);
        let scores: Vec<f64> = fused
            .iter()
            .map(|d| d.score("rrf_score").unwrap())
            .collect();
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }

    #[test]
    fn test_rrf_dedup_bound() {
        let retriever = retriever();
        // Full overlap: fused size is |v| + |k| - overlap
        let vector_docs = vec![doc("x"), doc("y")];
        let keyword_docs = vec![doc("y"), doc("x")];

        let fused = retriever.fuse(vector_docs, keyword_docs);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn test_tie_break_prefers_vector_rank() {
        let retriever = retriever();
        // Equal weights make rank-1 contributions identical across branches
        let mut tuning = RagTuning::default();
        tuning.vector_weight = 0.5;
        tuning.bm25_weight = 0.5;
        let retriever = HybridRetriever { tuning, ..retriever };

        let fused = retriever.fuse(vec![doc("vec-only")], vec![doc("kw-only")]);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].content, "vec-only");
    }

    #[test]
    fn test_fuse_annotates_single_branch_docs() {
        let retriever = retriever();
        let fused = retriever.fuse(vec![], vec![doc("kw")]);

        assert_eq!(fused.len(), 1);
        assert!(fused[0].metadata.contains_key("keyword_rank"));
        assert!(!fused[0].metadata.contains_key("vector_rank"));
    }
}
