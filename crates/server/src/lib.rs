//! HTTP surface for the dealership RAG engine
//!
//! Thin axum layer over the engine: query, ingestion (JSON and multipart
//! file upload), namespace clearing, health, and Prometheus metrics.
//! Authentication, TLS, and CORS policy belong to the deployment's edge.

pub mod http;
pub mod state;

pub use http::create_router;
pub use state::AppState;
