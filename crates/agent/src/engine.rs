//! Query engine
//!
//! Wires the full pipeline: sanitize -> classify -> namespace -> hybrid
//! retrieval -> optional DMS tool call -> grounded generation. DMS and
//! re-rank failures degrade to partial context; only embedding-plus-
//! lexical collapse or generation failure fails a request. Also hosts the
//! ingestion wrapper, namespace clearing, health, and stats surfaces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dealership_config::Settings;
use dealership_core::{
    sanitize_query, AgentIntent, BreakerError, CircuitBreaker, ConversationStore, Error,
    HealthReport, IngestRequest, IngestResponse, IngestStatus, IntentType, KeyValueStore,
    QueryRequest, QueryResponse, Result, RetrievedDocument, SourceType, Vehicle,
};
use dealership_dms::{build_adapter, DmsAdapter, DmsError};
use dealership_llm::{AnswerGenerator, ChatClient};
use dealership_rag::{
    EmbeddingCache, EmbeddingClient, HybridRetriever, IngestReport, IngestionPipeline,
    LexicalIndex, RecursiveSplitter, RerankClient, VectorStore,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::intent::IntentClassifier;

/// Deadline on the DMS side-channel call
const DMS_TIMEOUT: Duration = Duration::from_secs(10);
/// Answer cache TTL
const ANSWER_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Vehicles requested for inventory-intent tool calls
const DMS_INVENTORY_LIMIT: usize = 10;
/// Vehicles requested for sales-intent tool calls
const DMS_SALES_LIMIT: usize = 5;
/// Page size for background DMS ingestion
const DMS_INGEST_PAGE: usize = 100;

/// Builder so tests can swap the DMS adapter or key-value store
pub struct EngineBuilder {
    settings: Settings,
    kv: Arc<dyn KeyValueStore>,
    dms: Option<Arc<dyn DmsAdapter>>,
}

impl EngineBuilder {
    pub fn new(settings: Settings, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            settings,
            kv,
            dms: None,
        }
    }

    pub fn with_dms_adapter(mut self, dms: Arc<dyn DmsAdapter>) -> Self {
        self.dms = Some(dms);
        self
    }

    pub fn build(self) -> Result<Engine> {
        Engine::from_parts(self.settings, self.kv, self.dms)
    }
}

/// The query-processing engine
pub struct Engine {
    settings: Settings,
    embedder: Arc<EmbeddingClient>,
    vector: Arc<VectorStore>,
    lexical: Arc<LexicalIndex>,
    retriever: Arc<HybridRetriever>,
    pipeline: Arc<IngestionPipeline>,
    chat: Arc<ChatClient>,
    generator: AnswerGenerator,
    classifier: IntentClassifier,
    dms: Arc<dyn DmsAdapter>,
    conversations: ConversationStore,
    kv: Arc<dyn KeyValueStore>,
    vector_breaker: Arc<CircuitBreaker>,
    chat_breaker: Arc<CircuitBreaker>,
    embedding_breaker: Arc<CircuitBreaker>,
    dms_breaker: Arc<CircuitBreaker>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(settings: Settings, kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::from_parts(settings, kv, None)
    }

    pub fn builder(settings: Settings, kv: Arc<dyn KeyValueStore>) -> EngineBuilder {
        EngineBuilder::new(settings, kv)
    }

    fn from_parts(
        settings: Settings,
        kv: Arc<dyn KeyValueStore>,
        dms: Option<Arc<dyn DmsAdapter>>,
    ) -> Result<Self> {
        let vector_breaker = Arc::new(CircuitBreaker::vector_store());
        let chat_breaker = Arc::new(CircuitBreaker::chat_model());
        let embedding_breaker = Arc::new(CircuitBreaker::embedding_service());
        let dms_breaker = Arc::new(CircuitBreaker::dms());

        let embedder = Arc::new(EmbeddingClient::new(
            settings.embedding.clone(),
            EmbeddingCache::new(kv.clone()),
            embedding_breaker.clone(),
        ));
        let vector = Arc::new(
            VectorStore::new(
                settings.vector.clone(),
                settings.embedding.dimension,
                vector_breaker.clone(),
            )
            .map_err(Error::from)?,
        );
        let lexical = Arc::new(LexicalIndex::new(settings.lexical.clone()));
        let reranker = RerankClient::from_config(settings.rerank.clone()).map(Arc::new);

        let retriever = Arc::new(HybridRetriever::new(
            embedder.clone(),
            vector.clone(),
            lexical.clone(),
            reranker,
            settings.rag.clone(),
        ));

        let splitter = RecursiveSplitter::new(settings.rag.chunk_size, settings.rag.chunk_overlap);
        let pipeline = Arc::new(IngestionPipeline::new(
            splitter,
            embedder.clone(),
            vector.clone(),
            lexical.clone(),
        ));

        let chat = Arc::new(
            ChatClient::new(settings.chat.clone(), chat_breaker.clone()).map_err(Error::from)?,
        );
        let generator =
            AnswerGenerator::new(chat.clone(), settings.rag.max_tokens_generation);
        let classifier = IntentClassifier::new(Some(chat.clone()));

        let dms = dms.unwrap_or_else(|| build_adapter(&settings.dms));
        let conversations = ConversationStore::new(kv.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            settings,
            embedder,
            vector,
            lexical,
            retriever,
            pipeline,
            chat,
            generator,
            classifier,
            dms,
            conversations,
            kv,
            vector_breaker,
            chat_breaker,
            embedding_breaker,
            dms_breaker,
            shutdown_tx,
        })
    }

    /// One-time store preparation (vector collection, default index)
    pub async fn initialize(&self) -> Result<()> {
        self.vector.ensure_collection().await.map_err(Error::from)?;
        if let Err(e) = self.lexical.ensure_index("default").await {
            tracing::warn!(error = %e, "lexical index preparation failed, continuing");
        }
        Ok(())
    }

    /// Process one query end to end under the configured deadline.
    pub async fn process_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        request.validate()?;

        let sanitized = sanitize_query(&request.query);
        if sanitized.is_empty() {
            return Err(Error::Validation(
                "query is empty after sanitization".to_string(),
            ));
        }

        // Cached answers only apply to single-turn queries: conversation
        // context changes the correct answer.
        let cache_key = request
            .conversation_id
            .is_none()
            .then(|| answer_cache_key(&sanitized));
        if let Some(key) = &cache_key {
            if let Some(cached) = self.kv.get(key).await {
                if let Ok(mut response) = serde_json::from_str::<QueryResponse>(&cached) {
                    tracing::debug!("answer cache hit");
                    metrics::counter!("engine_answer_cache_hits").increment(1);
                    response.query_time_ms = started.elapsed().as_secs_f64() * 1000.0;
                    return Ok(response);
                }
            }
        }

        let deadline = Duration::from_secs(self.settings.rag.query_timeout_seconds);
        let mut response = tokio::time::timeout(deadline, self.run_pipeline(&request, &sanitized))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "query exceeded {}s deadline",
                    self.settings.rag.query_timeout_seconds
                ))
            })??;

        response.query_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::counter!("engine_queries_total").increment(1);
        metrics::histogram!("engine_query_time_ms").record(response.query_time_ms);

        if let Some(key) = cache_key {
            if let Ok(serialized) = serde_json::to_string(&response) {
                self.kv.set(&key, serialized, ANSWER_CACHE_TTL).await;
            }
        }

        Ok(response)
    }

    /// Classify -> retrieve -> tool-call -> synthesize
    async fn run_pipeline(
        &self,
        request: &QueryRequest,
        sanitized: &str,
    ) -> Result<QueryResponse> {
        let intent = self.classifier.classify(sanitized).await;
        let namespace = intent.intent.namespace();
        tracing::info!(
            intent = intent.intent.as_str(),
            confidence = intent.confidence,
            namespace,
            "classified query"
        );

        // Query-derived filters merge under caller-supplied ones
        let mut filters = IntentClassifier::extract_vehicle_filters(sanitized);
        if let Some(caller) = &request.filters {
            for (key, value) in caller {
                filters.insert(key.clone(), value.clone());
            }
        }
        let filters = (!filters.is_empty()).then_some(&filters);

        let mut context_docs = self
            .retriever
            .retrieve(sanitized, namespace, filters, request.top_k, true)
            .await
            .map_err(Error::from)?;

        if intent.intent.needs_dms_call() {
            if let Some(dms_doc) = self.dms_context(sanitized, &intent, filters).await {
                context_docs.insert(0, dms_doc);
            }
        }

        let history = match &request.conversation_id {
            Some(id) => self.conversations.prompt_window(id).await,
            None => Vec::new(),
        };

        let generated = self
            .generator
            .generate(sanitized, &context_docs, &history)
            .await
            .map_err(Error::from)?;

        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.conversations
            .append(&conversation_id, sanitized, &generated.answer)
            .await;

        Ok(QueryResponse {
            answer: generated.answer,
            sources: if request.include_sources {
                generated.sources
            } else {
                Vec::new()
            },
            conversation_id,
            query_time_ms: 0.0,
            model_used: generated.model,
            intent: Some(intent.intent),
        })
    }

    /// Fetch live DMS context for sales/service/inventory intents.
    ///
    /// Always returns a synthetic document: tool output on success, an
    /// error note on failure. The single silent case is a service intent
    /// with no extractable VIN, which skips the call entirely.
    async fn dms_context(
        &self,
        query: &str,
        intent: &AgentIntent,
        filters: Option<&HashMap<String, Value>>,
    ) -> Option<RetrievedDocument> {
        let call = self.call_dms_tool(query, intent, filters);
        let outcome = tokio::time::timeout(DMS_TIMEOUT, call).await;

        let body = match outcome {
            Ok(Ok(Some(body))) => body,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "dms tool call failed, inserting error note");
                format!("DMS lookup unavailable: {e}")
            }
            Err(_) => {
                tracing::warn!("dms tool call timed out, inserting error note");
                format!("DMS lookup timed out after {}s", DMS_TIMEOUT.as_secs())
            }
        };

        Some(
            RetrievedDocument::new(body)
                .with_metadata("source", "DMS")
                .with_metadata("document_type", "live_data")
                .with_metadata("intent", intent.intent.as_str()),
        )
    }

    async fn call_dms_tool(
        &self,
        _query: &str,
        intent: &AgentIntent,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Option<String>> {
        match intent.intent {
            IntentType::Inventory => {
                let vehicles = self
                    .dms_breaker
                    .call(self.dms.get_inventory(filters, DMS_INVENTORY_LIMIT, 0))
                    .await
                    .map_err(flatten_dms_error)?;
                Ok(Some(render_inventory("Live inventory", &vehicles, 5)))
            }
            IntentType::Sales => {
                let vehicles = self
                    .dms_breaker
                    .call(self.dms.get_inventory(None, DMS_SALES_LIMIT, 0))
                    .await
                    .map_err(flatten_dms_error)?;
                Ok(Some(render_inventory("Current offers", &vehicles, 5)))
            }
            IntentType::Service => {
                // No VIN in the query means nothing to look up; skip silently
                let Some(vin) = intent.entities.get("vin") else {
                    tracing::debug!("service intent without VIN, skipping dms call");
                    return Ok(None);
                };
                let records = self
                    .dms_breaker
                    .call(self.dms.get_service_history(vin))
                    .await
                    .map_err(flatten_dms_error)?;

                if records.is_empty() {
                    return Ok(Some(format!("No service records found for VIN {vin}.")));
                }
                let lines: Vec<String> = records
                    .iter()
                    .map(|r| {
                        format!(
                            "- {}: {} at {} miles, ${:.2}",
                            r.service_date.format("%Y-%m-%d"),
                            r.service_type,
                            r.mileage_at_service,
                            r.cost
                        )
                    })
                    .collect();
                Ok(Some(format!(
                    "Service history for VIN {vin}:\n{}",
                    lines.join("\n")
                )))
            }
            _ => Ok(None),
        }
    }

    /// Process a streaming query: text deltas flow through `tx` while the
    /// final structured response is returned at the end.
    pub async fn process_query_stream(
        &self,
        request: QueryRequest,
        tx: tokio::sync::mpsc::Sender<String>,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        request.validate()?;

        let sanitized = sanitize_query(&request.query);
        if sanitized.is_empty() {
            return Err(Error::Validation(
                "query is empty after sanitization".to_string(),
            ));
        }

        let intent = self.classifier.classify(&sanitized).await;
        let namespace = intent.intent.namespace();
        let filters = IntentClassifier::extract_vehicle_filters(&sanitized);
        let filters = (!filters.is_empty()).then_some(&filters);

        let mut context_docs = self
            .retriever
            .retrieve(&sanitized, namespace, filters, request.top_k, true)
            .await
            .map_err(Error::from)?;
        if intent.intent.needs_dms_call() {
            if let Some(dms_doc) = self.dms_context(&sanitized, &intent, filters).await {
                context_docs.insert(0, dms_doc);
            }
        }

        let history = match &request.conversation_id {
            Some(id) => self.conversations.prompt_window(id).await,
            None => Vec::new(),
        };

        let generated = self
            .generator
            .generate_stream(&sanitized, &context_docs, &history, tx)
            .await
            .map_err(Error::from)?;

        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.conversations
            .append(&conversation_id, &sanitized, &generated.answer)
            .await;

        Ok(QueryResponse {
            answer: generated.answer,
            sources: generated.sources,
            conversation_id,
            query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            model_used: generated.model,
            intent: Some(intent.intent),
        })
    }

    /// Ingestion surface. `text` and `file` run inline; `dms` detaches a
    /// background pagination task and returns immediately.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse> {
        let started = Instant::now();
        let namespace = request.namespace.as_deref();

        let report = match request.source_type {
            SourceType::Text => {
                let Some(content) = request.content.as_deref() else {
                    return Err(Error::Validation(
                        "text ingestion requires `content`".to_string(),
                    ));
                };
                self.pipeline
                    .ingest_text(content, &request.metadata, namespace)
                    .await
            }
            SourceType::File => {
                let Some(path) = request.source_identifier.as_deref() else {
                    return Err(Error::Validation(
                        "file ingestion requires `source_identifier`".to_string(),
                    ));
                };
                self.pipeline
                    .ingest_path(std::path::Path::new(path), &request.metadata, namespace)
                    .await
            }
            SourceType::Dms => {
                self.spawn_dms_ingestion(namespace.map(str::to_string));
                return Ok(IngestResponse {
                    status: IngestStatus::Accepted,
                    documents_processed: 0,
                    chunks_created: 0,
                    vectors_upserted: 0,
                    processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                    errors: Vec::new(),
                });
            }
            SourceType::Url => {
                return Err(Error::NotImplemented("url ingestion".to_string()));
            }
        };

        Ok(to_ingest_response(report, started))
    }

    /// Detached DMS inventory ingestion: paginate, render vehicles as
    /// synthetic documents, feed them through the pipeline. Observes the
    /// engine shutdown signal between pages.
    fn spawn_dms_ingestion(&self, namespace: Option<String>) {
        let dms = self.dms.clone();
        let pipeline = self.pipeline.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut offset = 0;
            let mut total_chunks = 0;

            loop {
                if *shutdown_rx.borrow_and_update() {
                    tracing::info!("dms ingestion task stopping on shutdown signal");
                    break;
                }

                let page = match dms.get_inventory(None, DMS_INGEST_PAGE, offset).await {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::error!(error = %e, offset, "dms ingestion page failed, stopping");
                        break;
                    }
                };
                if page.is_empty() {
                    break;
                }

                let documents: Vec<_> = page
                    .iter()
                    .map(|vehicle| {
                        let mut metadata = HashMap::new();
                        metadata.insert("source".to_string(), Value::from("DMS"));
                        metadata.insert("document_type".to_string(), Value::from("dms_inventory"));
                        metadata.insert("vin".to_string(), Value::from(vehicle.vin.clone()));
                        metadata.insert("make".to_string(), Value::from(vehicle.make.clone()));
                        metadata.insert("model".to_string(), Value::from(vehicle.model.clone()));
                        metadata.insert("year".to_string(), Value::from(vehicle.year));
                        if let Some(price) = vehicle.price {
                            metadata.insert("price".to_string(), Value::from(price));
                        }
                        dealership_rag::loader::LoadedDocument {
                            content: render_vehicle_document(vehicle),
                            metadata,
                        }
                    })
                    .collect();

                let got = page.len();
                let report = pipeline
                    .ingest_documents(documents, namespace.as_deref())
                    .await;
                total_chunks += report.chunks_created;
                for error in &report.errors {
                    tracing::warn!(error, "dms ingestion batch error");
                }

                if got < DMS_INGEST_PAGE {
                    break;
                }
                offset += DMS_INGEST_PAGE;
            }

            tracing::info!(total_chunks, "dms inventory ingestion finished");
        });
    }

    /// Clear a tenant: both indexes must drop the namespace
    pub async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        self.vector
            .delete_namespace(namespace)
            .await
            .map_err(Error::from)?;
        self.lexical
            .delete_namespace(namespace)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// Per-dependency booleans with degraded/unhealthy aggregation
    pub async fn health(&self) -> HealthReport {
        let (vector_ok, lexical_ok, dms_ok) = tokio::join!(
            self.vector.is_healthy(),
            self.lexical.is_healthy(),
            self.dms.health_check(),
        );

        let mut services = HashMap::new();
        services.insert("vector_store".to_string(), vector_ok);
        services.insert("lexical_index".to_string(), lexical_ok);
        services.insert("chat_model".to_string(), self.chat.is_configured());
        services.insert("dms".to_string(), dms_ok);

        HealthReport::from_services(services)
    }

    /// Aggregated counters for the stats surface
    pub async fn stats(&self) -> Value {
        let embedding = self.embedder.stats();
        let retrieval = self.retriever.stats();
        let dms = self.dms.stats();
        let index_stats = self.vector.describe_stats().await.ok();

        json!({
            "embedding": {
                "generated": embedding.generated,
                "api_calls": embedding.api_calls,
                "api_errors": embedding.api_errors,
                "cache_hits": embedding.cache.hits,
                "cache_misses": embedding.cache.misses,
                "cache_hit_rate": embedding.cache.hit_rate(),
            },
            "retrieval": {
                "total_queries": retrieval.total_queries,
                "vector_errors": retrieval.vector_errors,
                "keyword_errors": retrieval.keyword_errors,
                "rerank_errors": retrieval.rerank_errors,
            },
            "dms": {
                "adapter": self.dms.name(),
                "total_requests": dms.total_requests,
                "failed_requests": dms.failed_requests,
                "auth_failures": dms.auth_failures,
                "rate_limit_hits": dms.rate_limit_hits,
                "success_rate": dms.success_rate(),
            },
            "vector_index": index_stats.map(|s| json!({
                "total_vectors": s.total_vectors,
                "dimension": s.dimension,
                "namespaces": s.namespaces,
            })),
            "breakers": [
                breaker_json(&self.vector_breaker),
                breaker_json(&self.chat_breaker),
                breaker_json(&self.embedding_breaker),
                breaker_json(&self.dms_breaker),
            ],
        })
    }

    /// Prometheus text exposition for the circuit breakers
    pub fn breaker_metrics(&self) -> String {
        [
            self.vector_breaker.prometheus_metrics(),
            self.chat_breaker.prometheus_metrics(),
            self.embedding_breaker.prometheus_metrics(),
            self.dms_breaker.prometheus_metrics(),
        ]
        .join("\n")
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Signal background tasks to drain and stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn to_ingest_response(report: IngestReport, started: Instant) -> IngestResponse {
    let status = if report.errors.is_empty() {
        IngestStatus::Success
    } else if report.vectors_upserted > 0 {
        IngestStatus::PartialSuccess
    } else {
        IngestStatus::Failed
    };

    IngestResponse {
        status,
        documents_processed: report.documents_processed,
        chunks_created: report.chunks_created,
        vectors_upserted: report.vectors_upserted,
        processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        errors: report.errors,
    }
}

fn breaker_json(breaker: &CircuitBreaker) -> Value {
    let snapshot = breaker.snapshot();
    json!({
        "name": snapshot.name,
        "state": snapshot.state.as_str(),
        "failure_count": snapshot.failure_count,
        "total_calls": snapshot.total_calls,
        "failed_calls": snapshot.failed_calls,
        "circuit_opens": snapshot.circuit_opens,
    })
}

/// Cache key for single-turn answers: full SHA-256 of the sanitized query
fn answer_cache_key(sanitized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sanitized.to_lowercase().as_bytes());
    format!("query:{}", hex::encode(hasher.finalize()))
}

fn flatten_dms_error(err: BreakerError<DmsError>) -> Error {
    match err {
        BreakerError::Open { name, retry_in } => {
            Error::DependencyUnavailable(format!("{name} circuit open, retry in {retry_in:.1}s"))
        }
        BreakerError::Inner(e) => e.into(),
    }
}

fn render_inventory(label: &str, vehicles: &[Vehicle], limit: usize) -> String {
    if vehicles.is_empty() {
        return format!("{label}: no matching vehicles in the DMS right now.");
    }
    let lines: Vec<String> = vehicles
        .iter()
        .take(limit)
        .map(|v| format!("- {}", v.summary()))
        .collect();
    format!("{label} ({} vehicles):\n{}", vehicles.len(), lines.join("\n"))
}

fn render_vehicle_document(vehicle: &Vehicle) -> String {
    let mut lines = vec![vehicle.summary()];
    if let Some(color) = &vehicle.color_exterior {
        lines.push(format!("Exterior: {color}"));
    }
    if let Some(mileage) = vehicle.mileage {
        lines.push(format!("Mileage: {mileage} miles"));
    }
    if let Some(fuel) = &vehicle.fuel_type {
        lines.push(format!("Fuel type: {fuel}"));
    }
    if !vehicle.features.is_empty() {
        lines.push(format!("Features: {}", vehicle.features.join(", ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealership_core::InMemoryKvStore;
    use dealership_dms::MockAdapter;

    fn engine() -> Engine {
        Engine::builder(Settings::default(), Arc::new(InMemoryKvStore::new()))
            .with_dms_adapter(Arc::new(MockAdapter::with_seed(11)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_answer_cache_key_shape() {
        let key = answer_cache_key("how much is the camry");
        assert!(key.starts_with("query:"));
        assert_eq!(key.len(), "query:".len() + 64);
        // Case-insensitive normalization
        assert_eq!(key, answer_cache_key("How Much Is The Camry"));
    }

    #[tokio::test]
    async fn test_query_validation_bounds() {
        let engine = engine();

        let too_long = QueryRequest::new("a".repeat(1001));
        assert!(matches!(
            engine.process_query(too_long).await,
            Err(Error::Validation(_))
        ));

        let script_only = QueryRequest::new("<script>alert()</script>");
        assert!(matches!(
            engine.process_query(script_only).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ingest_text_requires_content() {
        let engine = engine();
        let request = IngestRequest {
            source_type: SourceType::Text,
            source_identifier: None,
            content: None,
            metadata: HashMap::new(),
            namespace: None,
        };
        assert!(matches!(
            engine.ingest(request).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ingest_url_not_implemented() {
        let engine = engine();
        let request = IngestRequest {
            source_type: SourceType::Url,
            source_identifier: Some("https://example.com".to_string()),
            content: None,
            metadata: HashMap::new(),
            namespace: None,
        };
        let err = engine.ingest(request).await.unwrap_err();
        assert_eq!(err.status_code(), 501);
    }

    #[tokio::test]
    async fn test_dms_context_inventory_success() {
        let engine = engine();
        let mut intent = AgentIntent::new(IntentType::Inventory, 0.9);
        intent.entities = HashMap::new();

        let doc = engine.dms_context("show me toyotas", &intent, None).await;
        let doc = doc.expect("inventory intent should produce a DMS document");
        assert_eq!(doc.source(), "DMS");
        assert!(doc.content.contains("Live inventory"));
    }

    #[tokio::test]
    async fn test_service_intent_without_vin_skips_dms() {
        let engine = engine();
        let intent = AgentIntent::new(IntentType::Service, 0.9);

        let doc = engine.dms_context("oil change schedule", &intent, None).await;
        assert!(doc.is_none());
    }

    #[tokio::test]
    async fn test_service_intent_with_vin_fetches_history() {
        let engine = engine();
        let vin = engine.dms.get_inventory(None, 1, 0).await.unwrap()[0]
            .vin
            .clone();
        let mut intent = AgentIntent::new(IntentType::Service, 0.9);
        intent.entities.insert("vin".to_string(), vin.clone());

        let doc = engine
            .dms_context("service history please", &intent, None)
            .await
            .expect("vin service lookup should produce a document");
        assert!(doc.content.contains(&vin));
    }

    #[tokio::test]
    async fn test_dms_circuit_open_inserts_error_note() {
        let engine = engine();
        // Force the breaker open
        for _ in 0..5 {
            let _ = engine
                .dms_breaker
                .call(async { Err::<(), _>(DmsError::Request("down".to_string())) })
                .await;
        }
        assert_eq!(
            engine.dms_breaker.state(),
            dealership_core::CircuitState::Open
        );

        let intent = AgentIntent::new(IntentType::Inventory, 0.9);
        let doc = engine
            .dms_context("show me inventory", &intent, None)
            .await
            .expect("open circuit should degrade to an error note");
        assert!(doc.content.contains("DMS lookup unavailable"));
    }

    #[test]
    fn test_render_inventory_formats_summary() {
        let rendered = render_inventory("Live inventory", &[], 5);
        assert!(rendered.contains("no matching vehicles"));
    }
}
