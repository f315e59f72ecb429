//! Ingestion pipeline
//!
//! Load -> split -> dedup -> embed -> dual-index. Both stores must be fed
//! before a run reports success so hybrid results stay consistent; the
//! lexical refresh interval may briefly favor the vector branch and that
//! is acceptable. The pipeline never fails at top level: every error lands
//! in the report instead.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::chunk::Chunk;
use crate::embeddings::{EmbeddingClient, InputType, DEFAULT_BATCH_SIZE};
use crate::lexical::LexicalIndex;
use crate::loader::{self, LoadedDocument};
use crate::splitter::RecursiveSplitter;
use crate::vector_store::{VectorRecord, VectorStore};

/// Stored text prefix for vector metadata
const TEXT_PREFIX_CHARS: usize = 1000;

/// Result of an ingestion run
#[derive(Debug, Default)]
pub struct IngestReport {
    pub documents_processed: usize,
    pub chunks_created: usize,
    pub vectors_upserted: usize,
    pub lexical_indexed: usize,
    pub errors: Vec<String>,
}

impl IngestReport {
    /// Partial when something was indexed despite errors, failed when
    /// nothing made it in
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty() && self.vectors_upserted > 0
    }

    pub fn is_failed(&self) -> bool {
        !self.errors.is_empty() && self.vectors_upserted == 0 && self.chunks_created > 0
    }
}

/// Parse -> chunk -> embed -> dual-index pipeline
pub struct IngestionPipeline {
    splitter: RecursiveSplitter,
    embedder: Arc<EmbeddingClient>,
    vector: Arc<VectorStore>,
    lexical: Arc<LexicalIndex>,
    /// Drop chunks with identical content hashes within one submission
    deduplicate: bool,
}

impl IngestionPipeline {
    pub fn new(
        splitter: RecursiveSplitter,
        embedder: Arc<EmbeddingClient>,
        vector: Arc<VectorStore>,
        lexical: Arc<LexicalIndex>,
    ) -> Self {
        Self {
            splitter,
            embedder,
            vector,
            lexical,
            deduplicate: true,
        }
    }

    pub fn without_dedup(mut self) -> Self {
        self.deduplicate = false;
        self
    }

    /// Normalize a namespace: lowercase, `[a-z0-9-]` only, empty maps to
    /// "default"
    pub fn normalize_namespace(namespace: Option<&str>) -> String {
        let cleaned: String = namespace
            .unwrap_or("")
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
            .collect();
        if cleaned.is_empty() {
            "default".to_string()
        } else {
            cleaned
        }
    }

    /// Ingest raw text
    pub async fn ingest_text(
        &self,
        content: &str,
        metadata: &HashMap<String, Value>,
        namespace: Option<&str>,
    ) -> IngestReport {
        let document = loader::text_document(content, metadata);
        self.ingest_documents(vec![document], namespace).await
    }

    /// Ingest a file or directory path
    pub async fn ingest_path(
        &self,
        path: &Path,
        metadata: &HashMap<String, Value>,
        namespace: Option<&str>,
    ) -> IngestReport {
        if path.is_dir() {
            let (documents, errors) = loader::load_directory(path, metadata);
            let mut report = self.ingest_documents(documents, namespace).await;
            report.errors.extend(errors);
            return report;
        }

        match loader::load_path(path, metadata) {
            Ok(documents) => self.ingest_documents(documents, namespace).await,
            Err(e) => IngestReport {
                errors: vec![e.to_string()],
                ..Default::default()
            },
        }
    }

    /// Run loaded documents through split -> dedup -> embed -> dual-index
    pub async fn ingest_documents(
        &self,
        documents: Vec<LoadedDocument>,
        namespace: Option<&str>,
    ) -> IngestReport {
        let started = Instant::now();
        let namespace = Self::normalize_namespace(namespace);
        let mut report = IngestReport {
            documents_processed: documents.len(),
            ..Default::default()
        };

        if documents.is_empty() {
            return report;
        }

        // Split
        let mut chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| self.splitter.split_document(doc, &namespace))
            .collect();

        // Dedup within the submission
        if self.deduplicate {
            let mut seen = HashSet::new();
            let before = chunks.len();
            chunks.retain(|chunk| seen.insert(chunk.id.clone()));
            let dropped = before - chunks.len();
            if dropped > 0 {
                tracing::debug!(dropped, "deduplicated chunks within submission");
            }
        }
        report.chunks_created = chunks.len();

        if chunks.is_empty() {
            return report;
        }

        // Embed
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embedded = self
            .embedder
            .embed_batch(&texts, InputType::Document, DEFAULT_BATCH_SIZE)
            .await;
        report.errors.extend(embedded.errors);

        // Vector upsert
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embedded.vectors.into_iter())
            .map(|(chunk, vector)| {
                let mut metadata = chunk.metadata.clone();
                metadata.insert(
                    "text".to_string(),
                    Value::from(chunk.text_prefix(TEXT_PREFIX_CHARS)),
                );
                metadata.insert("source".to_string(), Value::from(chunk.source.clone()));
                metadata.insert(
                    "document_type".to_string(),
                    Value::from(chunk.document_type.clone()),
                );
                metadata.insert("chunk_index".to_string(), Value::from(chunk.chunk_index));
                metadata.insert(
                    "timestamp".to_string(),
                    Value::from(chunk.ingested_at.to_rfc3339()),
                );
                metadata.insert("content_hash".to_string(), Value::from(chunk.id.clone()));

                VectorRecord {
                    id: chunk.id.clone(),
                    vector,
                    metadata,
                }
            })
            .collect();

        let outcome = self.vector.upsert(&namespace, &records).await;
        report.vectors_upserted = outcome.upserted;
        report.errors.extend(outcome.errors);

        // Lexical index
        match self.lexical.index(&namespace, &chunks).await {
            Ok(indexed) => report.lexical_indexed = indexed,
            Err(e) => {
                tracing::error!(error = %e, namespace, "lexical indexing failed");
                report.errors.push(format!("lexical indexing failed: {e}"));
            }
        }

        tracing::info!(
            namespace,
            documents = report.documents_processed,
            chunks = report.chunks_created,
            vectors = report.vectors_upserted,
            errors = report.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingestion run finished"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_normalization() {
        assert_eq!(IngestionPipeline::normalize_namespace(None), "default");
        assert_eq!(IngestionPipeline::normalize_namespace(Some("")), "default");
        assert_eq!(
            IngestionPipeline::normalize_namespace(Some("  Tenant-1 ")),
            "tenant-1"
        );
        assert_eq!(
            IngestionPipeline::normalize_namespace(Some("Bad_Name!")),
            "badname"
        );
    }

    #[test]
    fn test_report_status_derivation() {
        let clean = IngestReport {
            chunks_created: 4,
            vectors_upserted: 4,
            ..Default::default()
        };
        assert!(!clean.is_partial());
        assert!(!clean.is_failed());

        let partial = IngestReport {
            chunks_created: 4,
            vectors_upserted: 2,
            errors: vec!["one batch failed".to_string()],
            ..Default::default()
        };
        assert!(partial.is_partial());
        assert!(!partial.is_failed());

        let failed = IngestReport {
            chunks_created: 4,
            vectors_upserted: 0,
            errors: vec!["store down".to_string()],
            ..Default::default()
        };
        assert!(failed.is_failed());
    }
}
