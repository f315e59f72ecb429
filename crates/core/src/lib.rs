//! Core types for the dealership RAG engine
//!
//! This crate provides foundational pieces used across all other crates:
//! - The shared error taxonomy
//! - Circuit breaker for failure isolation of remote dependencies
//! - Retrieval, intent, and vehicle data models
//! - Query sanitization applied at the request boundary
//! - Conversation history types and the key-value store seam

pub mod breaker;
pub mod conversation;
pub mod error;
pub mod kv;
pub mod models;
pub mod sanitize;

pub use breaker::{BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use conversation::{ConversationStore, ConversationTurn};
pub use error::{Error, Result};
pub use kv::{InMemoryKvStore, KeyValueStore};
pub use models::{
    AgentIntent, HealthReport, HealthStatus, IngestRequest, IngestResponse, IngestStatus,
    IntentType, QueryRequest, QueryResponse, RetrievedDocument, ServiceRecord, SourceDocument,
    SourceType, Vehicle, VehicleCategory, VehicleStatus,
};
pub use sanitize::sanitize_query;
