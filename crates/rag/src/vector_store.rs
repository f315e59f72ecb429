//! Vector store client
//!
//! Namespaced upsert/query/delete against Qdrant. Namespace isolation is
//! enforced through a mandatory `namespace` payload field: every query
//! filter requires it, so cross-namespace reads are impossible through
//! this client. All calls are gated by the vector circuit breaker.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use dealership_config::VectorStoreConfig;
use dealership_core::{BreakerError, CircuitBreaker};
use qdrant_client::qdrant::{
    value::Kind, Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder,
    Distance, Filter, PointStruct, Range, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use std::sync::Arc;

use crate::RagError;

/// Maximum points per upsert request
const UPSERT_BATCH: usize = 100;
/// Upsert retry attempts (backoff 1s, 2s, 4s)
const UPSERT_RETRIES: u32 = 3;

/// A record bound for the vector index
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Stable content-derived id; retried upserts update, never duplicate
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: HashMap<String, Value>,
}

/// A match returned from a vector query
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
    pub metadata: HashMap<String, Value>,
}

/// Result of an upsert run; failures are partial, not fatal
#[derive(Debug, Default)]
pub struct UpsertOutcome {
    pub upserted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Index statistics for the stats surface
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub total_vectors: u64,
    pub dimension: usize,
    pub namespaces: HashMap<String, u64>,
}

/// Qdrant-backed vector index client
pub struct VectorStore {
    client: Qdrant,
    config: VectorStoreConfig,
    dimension: usize,
    breaker: Arc<CircuitBreaker>,
    /// Namespaces seen by this process, for stats reporting
    known_namespaces: DashMap<String, ()>,
}

impl VectorStore {
    pub fn new(
        config: VectorStoreConfig,
        dimension: usize,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, RagError> {
        let mut builder = Qdrant::from_url(&config.endpoint);
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            config,
            dimension,
            breaker,
            known_namespaces: DashMap::new(),
        })
    }

    /// Create the collection if it does not exist (cosine metric)
    pub async fn ensure_collection(&self) -> Result<(), RagError> {
        let exists = self
            .client
            .collection_exists(&self.config.collection)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.config.collection).vectors_config(
                        VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| RagError::VectorStore(e.to_string()))?;
            tracing::info!(
                collection = %self.config.collection,
                dimension = self.dimension,
                "created vector collection"
            );
        }

        Ok(())
    }

    /// Upsert records under a namespace in batches of at most 100.
    ///
    /// Each batch retries up to 3 times with exponential backoff; batches
    /// that keep failing are counted in the outcome instead of aborting
    /// the run. Stable ids make retried upserts idempotent.
    pub async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> UpsertOutcome {
        let mut outcome = UpsertOutcome::default();
        if records.is_empty() {
            return outcome;
        }
        self.known_namespaces.insert(namespace.to_string(), ());

        for batch in records.chunks(UPSERT_BATCH) {
            let points: Vec<PointStruct> = batch
                .iter()
                .map(|record| {
                    let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
                    payload.insert("namespace".to_string(), namespace.to_string().into());
                    for (key, value) in &record.metadata {
                        payload.insert(key.clone(), json_to_qdrant(value));
                    }
                    PointStruct::new(record.id.clone(), record.vector.clone(), payload)
                })
                .collect();

            match self.upsert_batch_with_retry(points).await {
                Ok(()) => outcome.upserted += batch.len(),
                Err(e) => {
                    tracing::error!(error = %e, batch = batch.len(), "vector upsert batch failed");
                    outcome.failed += batch.len();
                    outcome.errors.push(format!("vector upsert failed: {e}"));
                }
            }
        }

        outcome
    }

    async fn upsert_batch_with_retry(&self, points: Vec<PointStruct>) -> Result<(), RagError> {
        let mut last_error = None;

        for attempt in 0..UPSERT_RETRIES {
            let result = self
                .breaker
                .call(async {
                    self.client
                        .upsert_points(UpsertPointsBuilder::new(
                            &self.config.collection,
                            points.clone(),
                        ))
                        .await
                        .map_err(|e| RagError::VectorStore(e.to_string()))
                })
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(BreakerError::Open { name, retry_in }) => {
                    return Err(RagError::Unavailable(format!(
                        "{name} circuit open, retry in {retry_in:.1}s"
                    )));
                }
                Err(BreakerError::Inner(e)) => last_error = Some(e),
            }

            if attempt + 1 < UPSERT_RETRIES {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| RagError::VectorStore("upsert failed".to_string())))
    }

    /// Query the namespace by vector.
    ///
    /// Filter grammar: equality on `source`, `document_id`, `namespace`;
    /// numeric ranges via `<field>_min` / `<field>_max`. Errors are logged
    /// and degrade to an empty result so the lexical branch can carry the
    /// request.
    pub async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> Vec<VectorMatch> {
        let filter = build_filter(namespace, filters);

        let search = SearchPointsBuilder::new(&self.config.collection, vector.to_vec(), top_k as u64)
            .filter(filter)
            .with_payload(true);

        let result = self
            .breaker
            .call(async {
                self.client
                    .search_points(search)
                    .await
                    .map_err(|e| RagError::Search(e.to_string()))
            })
            .await;

        match result {
            Ok(response) => response
                .result
                .into_iter()
                .map(|point| {
                    let mut metadata = HashMap::new();
                    for (key, value) in point.payload {
                        metadata.insert(key, qdrant_to_json(value));
                    }
                    let id = point
                        .id
                        .and_then(|pid| pid.point_id_options)
                        .map(|opt| match opt {
                            qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u) => u,
                            qdrant_client::qdrant::point_id::PointIdOptions::Num(n) => n.to_string(),
                        })
                        .unwrap_or_default();

                    VectorMatch {
                        id,
                        score: point.score,
                        metadata,
                    }
                })
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, namespace, "vector query failed, returning empty");
                Vec::new()
            }
        }
    }

    /// Remove every record in a namespace
    pub async fn delete_namespace(&self, namespace: &str) -> Result<(), RagError> {
        let filter = Filter::must([Condition::matches("namespace", namespace.to_string())]);

        let result = self
            .breaker
            .call(async {
                self.client
                    .delete_points(
                        DeletePointsBuilder::new(&self.config.collection)
                            .points(filter)
                            .wait(true),
                    )
                    .await
                    .map_err(|e| RagError::VectorStore(e.to_string()))
            })
            .await;

        match result {
            Ok(_) => {
                tracing::info!(namespace, "cleared vector namespace");
                Ok(())
            }
            Err(BreakerError::Open { name, retry_in }) => Err(RagError::Unavailable(format!(
                "{name} circuit open, retry in {retry_in:.1}s"
            ))),
            Err(BreakerError::Inner(e)) => Err(e),
        }
    }

    /// Total and per-namespace vector counts
    pub async fn describe_stats(&self) -> Result<IndexStats, RagError> {
        let total = self.count(None).await?;

        let mut namespaces = HashMap::new();
        for entry in self.known_namespaces.iter() {
            let namespace = entry.key().clone();
            let count = self.count(Some(&namespace)).await?;
            namespaces.insert(namespace, count);
        }

        Ok(IndexStats {
            total_vectors: total,
            dimension: self.dimension,
            namespaces,
        })
    }

    async fn count(&self, namespace: Option<&str>) -> Result<u64, RagError> {
        let mut builder = CountPointsBuilder::new(&self.config.collection).exact(true);
        if let Some(ns) = namespace {
            builder = builder.filter(Filter::must([Condition::matches(
                "namespace",
                ns.to_string(),
            )]));
        }

        let result = self
            .breaker
            .call(async {
                self.client
                    .count(builder)
                    .await
                    .map_err(|e| RagError::VectorStore(e.to_string()))
            })
            .await;

        match result {
            Ok(response) => Ok(response.result.map(|r| r.count).unwrap_or(0)),
            Err(BreakerError::Open { name, retry_in }) => Err(RagError::Unavailable(format!(
                "{name} circuit open, retry in {retry_in:.1}s"
            ))),
            Err(BreakerError::Inner(e)) => Err(e),
        }
    }

    /// Liveness probe for the health surface
    pub async fn is_healthy(&self) -> bool {
        self.client.health_check().await.is_ok()
    }
}

/// Translate the engine filter grammar into a Qdrant filter.
///
/// The namespace condition is always present; caller filters add equality
/// on whitelisted string fields and `_min`/`_max` numeric ranges.
fn build_filter(namespace: &str, filters: Option<&HashMap<String, Value>>) -> Filter {
    let mut conditions = vec![Condition::matches("namespace", namespace.to_string())];

    if let Some(filters) = filters {
        // Collect ranges so that price_min and price_max merge into one condition
        let mut ranges: HashMap<String, Range> = HashMap::new();

        for (key, value) in filters {
            if let Some(field) = key.strip_suffix("_min") {
                if let Some(v) = value.as_f64() {
                    ranges.entry(field.to_string()).or_default().gte = Some(v);
                }
            } else if let Some(field) = key.strip_suffix("_max") {
                if let Some(v) = value.as_f64() {
                    ranges.entry(field.to_string()).or_default().lte = Some(v);
                }
            } else if matches!(key.as_str(), "source" | "document_id" | "namespace") {
                if let Some(s) = value.as_str() {
                    conditions.push(Condition::matches(key.clone(), s.to_string()));
                }
            }
        }

        for (field, range) in ranges {
            conditions.push(Condition::range(field, range));
        }
    }

    Filter::must(conditions)
}

fn json_to_qdrant(value: &Value) -> qdrant_client::qdrant::Value {
    use qdrant_client::qdrant::Value as QValue;
    match value {
        Value::String(s) => s.clone().into(),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or(0.0).into()
            }
        }
        Value::Null => QValue { kind: None },
        // Arrays and objects are stored as JSON strings; the engine only
        // filters on scalar fields
        other => other.to_string().into(),
    }
}

fn qdrant_to_json(value: qdrant_client::qdrant::Value) -> Value {
    match value.kind {
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null)
        }
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_always_scopes_namespace() {
        let filter = build_filter("tenant-1", None);
        assert_eq!(filter.must.len(), 1);
    }

    #[test]
    fn test_filter_merges_numeric_ranges() {
        let mut filters = HashMap::new();
        filters.insert("price_min".to_string(), Value::from(20000.0));
        filters.insert("price_max".to_string(), Value::from(40000.0));
        filters.insert("source".to_string(), Value::from("inventory.csv"));

        let filter = build_filter("default", Some(&filters));
        // namespace + source equality + one merged price range
        assert_eq!(filter.must.len(), 3);
    }

    #[test]
    fn test_filter_ignores_unknown_equality_fields() {
        let mut filters = HashMap::new();
        filters.insert("make".to_string(), Value::from("Toyota"));

        let filter = build_filter("default", Some(&filters));
        assert_eq!(filter.must.len(), 1);
    }

    #[test]
    fn test_json_value_roundtrip() {
        let original = Value::from(2024i64);
        let roundtripped = qdrant_to_json(json_to_qdrant(&original));
        assert_eq!(original, roundtripped);

        let text = Value::from("Camry");
        assert_eq!(qdrant_to_json(json_to_qdrant(&text)), text);
    }
}
