//! Generation for the dealership RAG engine
//!
//! A Messages-API chat client (non-streaming and SSE streaming), prompt
//! construction with grounded-answer rules, and the answer generator that
//! turns retrieved context into a cited response.

pub mod chat;
pub mod generate;
pub mod prompt;

pub use chat::{ChatClient, ChatResponse};
pub use generate::{AnswerGenerator, GeneratedAnswer, GroundednessReport};
pub use prompt::{build_user_prompt, format_context, Message, Role, SYSTEM_PROMPT};

use thiserror::Error;

/// Generation errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("api error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),
}

impl From<LlmError> for dealership_core::Error {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(msg) => dealership_core::Error::Timeout(msg),
            LlmError::Unavailable(msg) => dealership_core::Error::DependencyUnavailable(msg),
            other => dealership_core::Error::Generation(other.to_string()),
        }
    }
}
