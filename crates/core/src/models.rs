//! Data models shared across the engine
//!
//! Request/response types for the query and ingestion surfaces, the
//! retrieved-document shape flowing between retriever and generator, intent
//! records, and the Vehicle view provided by DMS adapters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// An in-memory retrieval result.
///
/// Carries the text body plus free-form metadata holding the source
/// descriptor and the scores accumulated along the retrieval path
/// (`vector_score`, `bm25_score`, `rrf_score`, `rerank_score`, ranks).
/// Ephemeral: produced by the retriever, consumed by the generator, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    /// Document text body
    pub content: String,
    /// Source descriptor, scores, namespace and structured fields
    pub metadata: HashMap<String, Value>,
}

impl RetrievedDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Source descriptor, defaulting to "Unknown"
    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
    }

    /// Document-type tag, defaulting to "document"
    pub fn document_type(&self) -> &str {
        self.metadata
            .get("document_type")
            .and_then(Value::as_str)
            .unwrap_or("document")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.get("namespace").and_then(Value::as_str)
    }

    pub fn score(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }
}

/// Query intent categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    Sales,
    Service,
    Inventory,
    Predictive,
    #[default]
    General,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::Sales => "sales",
            IntentType::Service => "service",
            IntentType::Inventory => "inventory",
            IntentType::Predictive => "predictive",
            IntentType::General => "general",
        }
    }

    /// Retrieval namespace this intent routes to
    pub fn namespace(&self) -> &'static str {
        match self {
            IntentType::Sales => "sales",
            IntentType::Service => "service",
            IntentType::Inventory => "inventory",
            IntentType::Predictive => "predictive",
            IntentType::General => "default",
        }
    }

    /// Whether queries with this intent consult the DMS for live data
    pub fn needs_dms_call(&self) -> bool {
        matches!(
            self,
            IntentType::Sales | IntentType::Service | IntentType::Inventory
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sales" => Some(IntentType::Sales),
            "service" => Some(IntentType::Service),
            "inventory" => Some(IntentType::Inventory),
            "predictive" => Some(IntentType::Predictive),
            "general" => Some(IntentType::General),
            _ => None,
        }
    }
}

/// Classified intent with confidence and extracted entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIntent {
    pub intent: IntentType,
    /// Confidence in [0, 1]
    pub confidence: f32,
    pub sub_intent: Option<String>,
    /// Entity bag extracted from the query (make, year, max_price, ...)
    pub entities: HashMap<String, String>,
}

impl AgentIntent {
    pub fn new(intent: IntentType, confidence: f32) -> Self {
        Self {
            intent,
            confidence: confidence.clamp(0.0, 1.0),
            sub_intent: None,
            entities: HashMap::new(),
        }
    }
}

/// Maximum accepted query length, enforced before sanitization
pub const MAX_QUERY_LENGTH: usize = 1000;

/// Request for the query surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// User's question, 1..=1000 characters
    pub query: String,
    /// Conversation ID for multi-turn context
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Caller-supplied metadata filters
    #[serde(default)]
    pub filters: Option<HashMap<String, Value>>,
    /// Number of results to return, 1..=50
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Include source documents in the response
    #[serde(default = "default_true")]
    pub include_sources: bool,
    /// Stream the answer as it is generated
    #[serde(default)]
    pub stream: bool,
}

fn default_top_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: None,
            filters: None,
            top_k: default_top_k(),
            include_sources: true,
            stream: false,
        }
    }

    /// Bounds validation applied before sanitization
    pub fn validate(&self) -> Result<(), Error> {
        if self.query.is_empty() {
            return Err(Error::Validation("query must not be empty".into()));
        }
        if self.query.chars().count() > MAX_QUERY_LENGTH {
            return Err(Error::Validation(format!(
                "query exceeds {MAX_QUERY_LENGTH} characters"
            )));
        }
        if self.top_k == 0 || self.top_k > 50 {
            return Err(Error::Validation("top_k must be in 1..=50".into()));
        }
        Ok(())
    }
}

/// A cited source in a query response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub source: String,
    #[serde(rename = "type")]
    pub document_type: String,
    /// First 200 characters of the cited chunk
    pub content_snippet: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Response from the query surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub conversation_id: String,
    pub query_time_ms: f64,
    pub model_used: String,
    pub intent: Option<IntentType>,
}

/// Ingestion source kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Dms,
    Url,
    Text,
}

/// Request for the ingestion surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source_type: SourceType,
    /// File path or external system name
    #[serde(default)]
    pub source_identifier: Option<String>,
    /// Inline content for `text` sources
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Outcome of an ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    /// Finished with at least one batch failure
    PartialSuccess,
    Failed,
    /// Background task accepted, results land out-of-band
    Accepted,
}

/// Response from the ingestion surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: IngestStatus,
    pub documents_processed: usize,
    pub chunks_created: usize,
    pub vectors_upserted: usize,
    pub processing_time_ms: f64,
    pub errors: Vec<String>,
}

/// Aggregate health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health report over the engine's dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub services: HashMap<String, bool>,
}

impl HealthReport {
    /// Aggregate per-service booleans: all up => healthy, all down =>
    /// unhealthy, otherwise degraded.
    pub fn from_services(services: HashMap<String, bool>) -> Self {
        let up = services.values().filter(|ok| **ok).count();
        let status = if up == services.len() && !services.is_empty() {
            HealthStatus::Healthy
        } else if up == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        Self { status, services }
    }
}

/// Vehicle availability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Available,
    Sold,
    Reserved,
    InTransit,
    Service,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Available => "available",
            VehicleStatus::Sold => "sold",
            VehicleStatus::Reserved => "reserved",
            VehicleStatus::InTransit => "in_transit",
            VehicleStatus::Service => "service",
        }
    }
}

/// Vehicle category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleCategory {
    New,
    Used,
    Certified,
    LeaseReturn,
}

/// Vehicle view provided by DMS adapters.
///
/// Not owned by the engine; converted into transient retrieved documents
/// when surfaced as tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    /// Vehicle Identification Number, 17 characters
    pub vin: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    #[serde(default)]
    pub trim: String,
    #[serde(default)]
    pub color_exterior: Option<String>,
    #[serde(default)]
    pub color_interior: Option<String>,
    #[serde(default)]
    pub mileage: Option<u32>,
    #[serde(default)]
    pub price: Option<f64>,
    pub status: VehicleStatus,
    #[serde(default)]
    pub category: Option<VehicleCategory>,
    #[serde(default)]
    pub fuel_type: Option<String>,
    #[serde(default)]
    pub transmission: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub dealer_id: Option<String>,
    #[serde(default)]
    pub stock_number: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Vehicle {
    /// One-line summary used when serializing tool output into context
    pub fn summary(&self) -> String {
        let price = self
            .price
            .map(|p| format!("${p:.0}"))
            .unwrap_or_else(|| "price on request".to_string());
        format!(
            "{} {} {} {} - {} - VIN {} - {}",
            self.year,
            self.make,
            self.model,
            self.trim,
            price,
            self.vin,
            self.status.as_str()
        )
    }
}

/// A single service record from the DMS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_date: DateTime<Utc>,
    pub service_type: String,
    pub mileage_at_service: u32,
    pub cost: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_namespace_mapping() {
        assert_eq!(IntentType::Sales.namespace(), "sales");
        assert_eq!(IntentType::General.namespace(), "default");
        assert!(IntentType::Inventory.needs_dms_call());
        assert!(!IntentType::Predictive.needs_dms_call());
    }

    #[test]
    fn test_query_request_bounds() {
        let ok = QueryRequest::new("a".repeat(1000));
        assert!(ok.validate().is_ok());

        let too_long = QueryRequest::new("a".repeat(1001));
        assert!(too_long.validate().is_err());

        let mut bad_k = QueryRequest::new("hello");
        bad_k.top_k = 51;
        assert!(bad_k.validate().is_err());

        let empty = QueryRequest::new("");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_health_aggregation() {
        let mut services = HashMap::new();
        services.insert("qdrant".to_string(), true);
        services.insert("dms".to_string(), true);
        assert_eq!(
            HealthReport::from_services(services.clone()).status,
            HealthStatus::Healthy
        );

        services.insert("dms".to_string(), false);
        assert_eq!(
            HealthReport::from_services(services.clone()).status,
            HealthStatus::Degraded
        );

        services.insert("qdrant".to_string(), false);
        assert_eq!(
            HealthReport::from_services(services).status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_document_metadata_accessors() {
        let doc = RetrievedDocument::new("2024 Camry")
            .with_metadata("source", "inventory.csv")
            .with_metadata("namespace", "inventory")
            .with_metadata("rrf_score", 0.016);

        assert_eq!(doc.source(), "inventory.csv");
        assert_eq!(doc.namespace(), Some("inventory"));
        assert!(doc.score("rrf_score").unwrap() > 0.0);
        assert_eq!(doc.document_type(), "document");
    }
}
