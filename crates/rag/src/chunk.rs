//! Indexed chunk model
//!
//! The unit of content shared by the splitter, the embedding client, and
//! both index clients. Identifiers are content-addressed so re-ingesting
//! the same material updates existing records instead of duplicating them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stable identifier for a `(body, source)` pair: first 32 hex characters
/// of SHA-256 over the concatenation.
pub fn content_hash(content: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

/// A bounded piece of source text emitted by the splitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from `(content, source)`
    pub id: String,
    /// Chunk text body
    pub content: String,
    /// Origin path or external system name
    pub source: String,
    /// Document-type tag
    pub document_type: String,
    /// Position within the parent document
    pub chunk_index: usize,
    /// Target namespace for both indexes
    pub namespace: String,
    pub ingested_at: DateTime<Utc>,
    /// Inherited and extracted structured fields (make, vin, year, price, ...)
    pub metadata: HashMap<String, Value>,
}

impl Chunk {
    pub fn new(
        content: impl Into<String>,
        source: impl Into<String>,
        chunk_index: usize,
        namespace: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let source = source.into();
        let id = content_hash(&content, &source);
        Self {
            id,
            content,
            source,
            document_type: "document".to_string(),
            chunk_index,
            namespace: namespace.into(),
            ingested_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = document_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stored text prefix for index metadata (full body is input-only)
    pub fn text_prefix(&self, max_chars: usize) -> String {
        self.content.chars().take(max_chars).collect()
    }

    /// Human-readable chunk label carried in metadata
    pub fn chunk_label(&self) -> String {
        format!("chunk_{}_{}", self.chunk_index, &self.id[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_deterministic() {
        let a = Chunk::new("Camry LE $28,000", "inventory.csv", 0, "inventory");
        let b = Chunk::new("Camry LE $28,000", "inventory.csv", 3, "sales");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
    }

    #[test]
    fn test_id_varies_with_source() {
        let a = Chunk::new("Camry LE $28,000", "inventory.csv", 0, "inventory");
        let b = Chunk::new("Camry LE $28,000", "pricing.pdf", 0, "inventory");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_text_prefix_respects_char_boundary() {
        let chunk = Chunk::new("日本語テキスト with mixed content", "doc", 0, "default");
        let prefix = chunk.text_prefix(5);
        assert_eq!(prefix.chars().count(), 5);
    }

    #[test]
    fn test_chunk_label() {
        let chunk = Chunk::new("body", "src", 2, "default");
        let label = chunk.chunk_label();
        assert!(label.starts_with("chunk_2_"));
        assert_eq!(label.len(), "chunk_2_".len() + 8);
    }
}
