//! Lexical index client
//!
//! BM25 keyword search over an Elasticsearch-compatible cluster. One index
//! per namespace (`<prefix>-documents-<namespace>`) keeps tenants isolated
//! at the index level; the content hash is the primary key so re-indexing
//! the same chunk is an update, not a duplicate.

use std::collections::HashMap;

use dealership_config::LexicalConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::chunk::Chunk;
use crate::RagError;

/// Maximum chunks per bulk request
const BULK_BATCH: usize = 500;
/// Stored text prefix, matching the vector store metadata limit
const TEXT_PREFIX_CHARS: usize = 1000;

/// Cluster health states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LexicalStatus {
    Green,
    Yellow,
    Red,
}

/// Health report from the cluster
#[derive(Debug, Clone)]
pub struct LexicalHealth {
    pub status: LexicalStatus,
    pub document_count: u64,
}

/// A keyword search hit
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub id: String,
    pub content: String,
    /// BM25 relevance score
    pub bm25_score: f32,
    /// Highlighted fragments when the cluster returns them
    pub highlights: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

/// Elasticsearch-compatible BM25 index client
pub struct LexicalIndex {
    client: Client,
    config: LexicalConfig,
}

impl LexicalIndex {
    pub fn new(config: LexicalConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Index name for a namespace
    pub fn index_name(&self, namespace: &str) -> String {
        format!("{}-documents-{}", self.config.index_prefix, namespace)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.endpoint, path);
        let mut builder = self.client.request(method, url);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.basic_auth(user, Some(pass));
        }
        builder
    }

    /// Create the namespace index with BM25 similarity and field mappings
    /// if it does not exist yet.
    pub async fn ensure_index(&self, namespace: &str) -> Result<(), RagError> {
        let index = self.index_name(namespace);

        let exists = self
            .request(reqwest::Method::HEAD, &format!("/{index}"))
            .send()
            .await
            .map_err(|e| RagError::Connection(e.to_string()))?;
        if exists.status().is_success() {
            return Ok(());
        }

        let body = json!({
            "settings": {
                "refresh_interval": "1s",
                "similarity": {
                    "default": {
                        "type": "BM25",
                        "k1": self.config.bm25_k1,
                        "b": self.config.bm25_b
                    }
                }
            },
            "mappings": {
                "properties": {
                    "content": { "type": "text" },
                    "title": { "type": "text" },
                    "source": { "type": "keyword" },
                    "document_type": { "type": "keyword" },
                    "namespace": { "type": "keyword" },
                    "content_hash": { "type": "keyword" },
                    "vin": { "type": "keyword" },
                    "make": { "type": "keyword" },
                    "model": { "type": "keyword" },
                    "dealer_id": { "type": "keyword" },
                    "year": { "type": "integer" },
                    "price": { "type": "double" },
                    "mileage": { "type": "long" },
                    "chunk_index": { "type": "integer" },
                    "timestamp": { "type": "date" }
                }
            }
        });

        let response = self
            .request(reqwest::Method::PUT, &format!("/{index}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Index(format!(
                "failed to create index {index}: {status} {body}"
            )));
        }

        tracing::info!(index = %index, "created lexical index");
        Ok(())
    }

    /// Bulk-upsert chunks, keyed by content hash
    pub async fn index(&self, namespace: &str, chunks: &[Chunk]) -> Result<usize, RagError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        self.ensure_index(namespace).await?;
        let index = self.index_name(namespace);

        let mut indexed = 0;
        for batch in chunks.chunks(BULK_BATCH) {
            let mut body = String::new();
            for chunk in batch {
                let action = json!({ "index": { "_index": index, "_id": chunk.id } });
                let mut doc = json!({
                    "content": chunk.text_prefix(TEXT_PREFIX_CHARS),
                    "source": chunk.source,
                    "document_type": chunk.document_type,
                    "namespace": chunk.namespace,
                    "content_hash": chunk.id,
                    "chunk_index": chunk.chunk_index,
                    "timestamp": chunk.ingested_at.to_rfc3339(),
                });
                if let Some(obj) = doc.as_object_mut() {
                    for (key, value) in &chunk.metadata {
                        obj.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }

                body.push_str(&action.to_string());
                body.push('\n');
                body.push_str(&doc.to_string());
                body.push('\n');
            }

            let response = self
                .request(reqwest::Method::POST, "/_bulk")
                .header("content-type", "application/x-ndjson")
                .body(body)
                .send()
                .await
                .map_err(|e| RagError::Connection(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                return Err(RagError::Index(format!("bulk indexing failed: {status}")));
            }

            let parsed: BulkResponse = response
                .json()
                .await
                .map_err(|e| RagError::Index(format!("unreadable bulk response: {e}")))?;

            if parsed.errors {
                let failed = parsed.failed_count();
                tracing::warn!(failed, "bulk indexing finished with item failures");
                indexed += batch.len() - failed;
            } else {
                indexed += batch.len();
            }
        }

        Ok(indexed)
    }

    /// BM25 search within a namespace.
    ///
    /// `content` is matched with fuzziness, `title` carries a 2x boost.
    /// Structured filters become term/range clauses. An empty query
    /// returns an empty list without touching the cluster.
    pub async fn search(
        &self,
        namespace: &str,
        query: &str,
        top_k: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<LexicalHit>, RagError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let index = self.index_name(namespace);
        let filter_clauses = build_filter_clauses(filters);

        let body = json!({
            "size": top_k,
            "query": {
                "bool": {
                    "must": {
                        "multi_match": {
                            "query": query,
                            "fields": ["content", "title^2"],
                            "fuzziness": "AUTO"
                        }
                    },
                    "filter": filter_clauses
                }
            },
            "highlight": { "fields": { "content": {} } }
        });

        let response = self
            .request(reqwest::Method::POST, &format!("/{index}/_search"))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Connection(e.to_string()))?;

        // A missing index means nothing was ingested into this namespace yet
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(RagError::Search(format!("lexical search failed: {status}")));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| RagError::Search(format!("unreadable search response: {e}")))?;

        Ok(parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let mut metadata: HashMap<String, Value> = HashMap::new();
                let mut content = String::new();
                if let Value::Object(source) = hit.source {
                    for (key, value) in source {
                        if key == "content" {
                            content = value.as_str().unwrap_or_default().to_string();
                        } else {
                            metadata.insert(key, value);
                        }
                    }
                }
                LexicalHit {
                    id: hit.id,
                    content,
                    bm25_score: hit.score.unwrap_or(0.0),
                    highlights: hit
                        .highlight
                        .and_then(|mut h| h.remove("content"))
                        .unwrap_or_default(),
                    metadata,
                }
            })
            .collect())
    }

    /// Drop the namespace index entirely
    pub async fn delete_namespace(&self, namespace: &str) -> Result<(), RagError> {
        let index = self.index_name(namespace);
        let response = self
            .request(reqwest::Method::DELETE, &format!("/{index}"))
            .send()
            .await
            .map_err(|e| RagError::Connection(e.to_string()))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::info!(index = %index, "cleared lexical namespace");
            Ok(())
        } else {
            Err(RagError::Index(format!(
                "failed to delete index {index}: {}",
                response.status()
            )))
        }
    }

    /// Cluster health plus total indexed documents under this prefix
    pub async fn health(&self) -> Result<LexicalHealth, RagError> {
        let health: ClusterHealth = self
            .request(reqwest::Method::GET, "/_cluster/health")
            .send()
            .await
            .map_err(|e| RagError::Connection(e.to_string()))?
            .json()
            .await
            .map_err(|e| RagError::Connection(e.to_string()))?;

        let count_path = format!("/{}-documents-*/_count", self.config.index_prefix);
        let document_count = match self.request(reqwest::Method::GET, &count_path).send().await {
            Ok(response) => response
                .json::<CountResponse>()
                .await
                .map(|c| c.count)
                .unwrap_or(0),
            Err(_) => 0,
        };

        Ok(LexicalHealth {
            status: health.status,
            document_count,
        })
    }

    pub async fn is_healthy(&self) -> bool {
        matches!(
            self.health().await,
            Ok(LexicalHealth {
                status: LexicalStatus::Green | LexicalStatus::Yellow,
                ..
            })
        )
    }
}

/// Keyword/integer fields present in the index mapping; a term clause on
/// anything else would match zero documents in the cluster
const TERM_FILTER_FIELDS: [&str; 9] = [
    "source",
    "document_type",
    "namespace",
    "content_hash",
    "vin",
    "make",
    "model",
    "dealer_id",
    "year",
];
/// Numeric fields accepting `<field>_min` / `<field>_max` range bounds
const RANGE_FILTER_FIELDS: [&str; 4] = ["year", "price", "mileage", "timestamp"];

/// Translate the engine filter grammar into bool-filter clauses.
///
/// Only mapped fields produce clauses; the intent extractor's
/// `max_price` / `min_price` become bounds on the mapped `price` field,
/// and keys with no mapping (e.g. `fuel_type`) are ignored rather than
/// turned into term clauses that would empty the lexical branch.
fn build_filter_clauses(filters: Option<&HashMap<String, Value>>) -> Vec<Value> {
    let Some(filters) = filters else {
        return Vec::new();
    };

    let mut clauses = Vec::new();
    let mut ranges: HashMap<&str, serde_json::Map<String, Value>> = HashMap::new();

    for (key, value) in filters {
        if key == "max_price" {
            ranges
                .entry("price")
                .or_default()
                .insert("lte".to_string(), value.clone());
        } else if key == "min_price" {
            ranges
                .entry("price")
                .or_default()
                .insert("gte".to_string(), value.clone());
        } else if let Some(field) = key.strip_suffix("_min") {
            if RANGE_FILTER_FIELDS.contains(&field) {
                ranges
                    .entry(field)
                    .or_default()
                    .insert("gte".to_string(), value.clone());
            } else {
                tracing::debug!(field, "ignoring range filter on unmapped field");
            }
        } else if let Some(field) = key.strip_suffix("_max") {
            if RANGE_FILTER_FIELDS.contains(&field) {
                ranges
                    .entry(field)
                    .or_default()
                    .insert("lte".to_string(), value.clone());
            } else {
                tracing::debug!(field, "ignoring range filter on unmapped field");
            }
        } else if TERM_FILTER_FIELDS.contains(&key.as_str()) {
            let field = key.clone();
            clauses.push(json!({ "term": { field: value.clone() } }));
        } else {
            tracing::debug!(field = %key, "ignoring filter on unmapped field");
        }
    }

    for (field, bounds) in ranges {
        clauses.push(json!({ "range": { field: bounds } }));
    }

    clauses
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

impl BulkResponse {
    fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| {
                item.get("index")
                    .and_then(|i| i.get("error"))
                    .is_some()
            })
            .count()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score")]
    score: Option<f32>,
    #[serde(rename = "_source")]
    source: Value,
    #[serde(default)]
    highlight: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct ClusterHealth {
    status: LexicalStatus,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> LexicalIndex {
        LexicalIndex::new(LexicalConfig::default())
    }

    #[test]
    fn test_index_naming() {
        assert_eq!(
            index().index_name("tenant-1"),
            "dealership-rag-documents-tenant-1"
        );
    }

    #[tokio::test]
    async fn test_empty_query_short_circuits() {
        // No cluster is running in tests; an empty query must not need one
        let hits = index().search("default", "   ", 10, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_filter_clauses_translate_mapped_fields() {
        let mut filters = HashMap::new();
        filters.insert("make".to_string(), json!("Toyota"));
        filters.insert("year".to_string(), json!(2024));
        filters.insert("max_price".to_string(), json!(40000.0));
        filters.insert("price_min".to_string(), json!(20000.0));

        let clauses = build_filter_clauses(Some(&filters));

        // make + year terms, and one merged price range
        assert_eq!(clauses.len(), 3);
        assert!(clauses.contains(&json!({ "term": { "make": "Toyota" } })));
        assert!(clauses.contains(&json!({ "term": { "year": 2024 } })));
        assert!(clauses
            .contains(&json!({ "range": { "price": { "gte": 20000.0, "lte": 40000.0 } } })));
    }

    #[test]
    fn test_unmapped_fields_produce_no_clauses() {
        let mut filters = HashMap::new();
        filters.insert("fuel_type".to_string(), json!("Electric"));
        filters.insert("trim_min".to_string(), json!(1));
        filters.insert("max_price".to_string(), json!(40000.0));

        let clauses = build_filter_clauses(Some(&filters));

        // The price bound survives; nothing unmapped becomes a term clause
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0], json!({ "range": { "price": { "lte": 40000.0 } } }));
        assert!(clauses.iter().all(|c| c.get("term").is_none()));
    }

    #[test]
    fn test_no_filters_yield_no_clauses() {
        assert!(build_filter_clauses(None).is_empty());
        assert!(build_filter_clauses(Some(&HashMap::new())).is_empty());
    }

    #[test]
    fn test_bulk_failure_counting() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 200 } },
                { "index": { "_id": "b", "status": 400, "error": { "type": "mapper_parsing_exception" } } }
            ]
        }))
        .unwrap();
        assert_eq!(response.failed_count(), 1);
    }

    #[test]
    fn test_search_hit_parsing() {
        let parsed: SearchResponse = serde_json::from_value(json!({
            "hits": { "hits": [{
                "_id": "abc",
                "_score": 7.5,
                "_source": { "content": "Camry LE", "source": "inventory.csv", "year": 2024 },
                "highlight": { "content": ["<em>Camry</em> LE"] }
            }]}
        }))
        .unwrap();

        let hit = &parsed.hits.hits[0];
        assert_eq!(hit.id, "abc");
        assert_eq!(hit.score, Some(7.5));
    }
}
