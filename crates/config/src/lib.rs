//! Configuration for the dealership RAG engine
//!
//! Settings are layered from an optional `config/default.toml` file and
//! `DEALERSHIP_`-prefixed environment variables (e.g.
//! `DEALERSHIP_RAG__CHUNK_SIZE=800`, double underscore for nesting).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// REST endpoint of the embedding service
    pub endpoint: String,
    pub api_key: String,
    /// Model name; part of the cache key so a model swap never serves
    /// stale vectors
    pub model: String,
    /// Expected vector dimension; mismatches are logged, not fatal
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8091".to_string(),
            api_key: String::new(),
            model: "voyage-3.5-large".to_string(),
            dimension: 1024,
        }
    }
}

/// Vector store (Qdrant) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub collection: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:6334".to_string(),
            api_key: None,
            collection: "dealership-rag".to_string(),
        }
    }
}

/// Lexical (BM25) index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalConfig {
    pub endpoint: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Index name prefix; per-namespace indexes are
    /// `<prefix>-documents-<namespace>`
    pub index_prefix: String,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            index_prefix: "dealership-rag".to_string(),
            bm25_k1: 1.2,
            bm25_b: 0.75,
        }
    }
}

/// Cross-encoder re-ranker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Empty endpoint disables re-ranking
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            model: "rerank-v3.5".to_string(),
        }
    }
}

/// Chat model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com".to_string(),
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".to_string(),
        }
    }
}

/// DMS adapter selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DmsAdapterKind {
    #[default]
    Mock,
    ProviderA,
    ProviderB,
}

/// DMS integration configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DmsConfig {
    pub adapter: DmsAdapterKind,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub dealer_code: String,
}

/// Retrieval and generation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagTuning {
    /// Max characters per chunk
    pub chunk_size: usize,
    /// Character overlap between adjacent chunks
    pub chunk_overlap: usize,
    /// Per-branch results before fusion
    pub top_k_retrieval: usize,
    /// Final cut after re-rank
    pub top_k_rerank: usize,
    /// Upper bound on answer length
    pub max_tokens_generation: usize,
    /// End-to-end deadline in seconds
    pub query_timeout_seconds: u64,
    /// RRF weight for the vector branch
    pub vector_weight: f64,
    /// RRF weight for the lexical branch (weights should sum to 1.0)
    pub bm25_weight: f64,
}

impl Default for RagTuning {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k_retrieval: 20,
            top_k_rerank: 5,
            max_tokens_generation: 1000,
            query_timeout_seconds: 30,
            vector_weight: 0.6,
            bm25_weight: 0.4,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request cap per client per minute
    pub rate_limit_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            rate_limit_per_minute: 100,
        }
    }
}

/// Top-level application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorStoreConfig,
    #[serde(default)]
    pub lexical: LexicalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub dms: DmsConfig,
    #[serde(default)]
    pub rag: RagTuning,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Settings {
    /// Load from `config/default.toml` (optional) plus environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::with_prefix("DEALERSHIP").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rag.chunk_overlap >= self.rag.chunk_size {
            return Err(ConfigError::Invalid(
                "chunk_overlap must be smaller than chunk_size".to_string(),
            ));
        }
        if self.rag.top_k_rerank > self.rag.top_k_retrieval {
            return Err(ConfigError::Invalid(
                "top_k_rerank cannot exceed top_k_retrieval".to_string(),
            ));
        }
        let weight_sum = self.rag.vector_weight + self.rag.bm25_weight;
        if (weight_sum - 1.0).abs() > 0.01 {
            tracing::warn!(weight_sum, "rrf weights do not sum to 1.0");
        }
        if self.environment.is_production() && self.chat.api_key.is_empty() {
            return Err(ConfigError::Invalid(
                "chat.api_key is required in production".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec() {
        let tuning = RagTuning::default();
        assert_eq!(tuning.chunk_size, 1000);
        assert_eq!(tuning.chunk_overlap, 200);
        assert_eq!(tuning.top_k_retrieval, 20);
        assert_eq!(tuning.top_k_rerank, 5);
        assert_eq!(tuning.query_timeout_seconds, 30);
        assert!((tuning.vector_weight - 0.6).abs() < f64::EPSILON);
        assert!((tuning.bm25_weight - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validation_rejects_bad_overlap() {
        let mut settings = Settings::default();
        settings.rag.chunk_overlap = settings.rag.chunk_size;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bm25_defaults() {
        let lexical = LexicalConfig::default();
        assert!((lexical.bm25_k1 - 1.2).abs() < f32::EPSILON);
        assert!((lexical.bm25_b - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_production_requires_chat_key() {
        let mut settings = Settings::default();
        settings.environment = RuntimeEnvironment::Production;
        assert!(settings.validate().is_err());

        settings.chat.api_key = "key".to_string();
        assert!(settings.validate().is_ok());
    }
}
