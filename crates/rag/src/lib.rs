//! Retrieval for the dealership RAG engine
//!
//! Features:
//! - Embedding client with content-addressed caching and retry/backoff
//! - Dense vector search via Qdrant with namespace isolation
//! - BM25 keyword search via an Elasticsearch-compatible cluster
//! - Hybrid fusion with weighted Reciprocal Rank Fusion
//! - Cross-encoder re-ranking with graceful fallback
//! - Ingestion pipeline: load -> split -> dedup -> embed -> dual-index

pub mod cache;
pub mod chunk;
pub mod embeddings;
pub mod ingest;
pub mod lexical;
pub mod loader;
pub mod reranker;
pub mod retriever;
pub mod splitter;
pub mod vector_store;

pub use cache::{CacheStats, EmbeddingCache};
pub use chunk::{content_hash, Chunk};
pub use embeddings::{BatchEmbeddings, EmbeddingClient, EmbeddingStats, InputType};
pub use ingest::{IngestReport, IngestionPipeline};
pub use lexical::{LexicalHealth, LexicalHit, LexicalIndex, LexicalStatus};
pub use loader::{load_directory, load_path, text_document, LoadedDocument};
pub use reranker::{RerankClient, RerankScore};
pub use retriever::{HybridRetriever, RetrieverStats};
pub use splitter::RecursiveSplitter;
pub use vector_store::{IndexStats, UpsertOutcome, VectorMatch, VectorRecord, VectorStore};

use thiserror::Error;

/// Retrieval errors
#[derive(Error, Debug)]
pub enum RagError {
    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("search error: {0}")]
    Search(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("rerank error: {0}")]
    Rerank(String),

    #[error("loader error: {0}")]
    Loader(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),
}

impl From<RagError> for dealership_core::Error {
    fn from(err: RagError) -> Self {
        match err {
            RagError::Unavailable(msg) => dealership_core::Error::DependencyUnavailable(msg),
            other => dealership_core::Error::Retrieval(other.to_string()),
        }
    }
}
