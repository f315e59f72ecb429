//! Shared error taxonomy
//!
//! Each crate defines its own error enum and converts into this one at the
//! orchestration boundary, so the engine can map failures onto the HTTP
//! surface (400/429/500/503) without inspecting provider-specific types.

use thiserror::Error;

/// Engine-level errors
#[derive(Error, Debug)]
pub enum Error {
    /// Input failed sanitization or bounds checks (maps to 400)
    #[error("validation error: {0}")]
    Validation(String),

    /// Circuit open or a vendor kept failing after retries
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// An end-to-end or per-call deadline elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// Local or remote rate limit tripped (maps to 429)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Invalid credentials for a DMS provider or model endpoint
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Lookup returned nothing; non-fatal for the query path
    #[error("not found: {0}")]
    NotFound(String),

    /// Ingestion finished with at least one batch failure
    #[error("partial index: {0}")]
    PartialIndex(String),

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("dms error: {0}")]
    Dms(String),

    /// Declared in the API surface but not implemented (maps to 501)
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience result alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status code this error maps to at the request boundary
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::RateLimited(_) => 429,
            Error::NotFound(_) => 404,
            Error::Auth(_) => 401,
            Error::NotImplemented(_) => 501,
            Error::DependencyUnavailable(_) => 503,
            Error::Timeout(_)
            | Error::PartialIndex(_)
            | Error::Retrieval(_)
            | Error::Generation(_)
            | Error::Dms(_)
            | Error::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Validation("bad".into()).status_code(), 400);
        assert_eq!(Error::RateLimited("slow down".into()).status_code(), 429);
        assert_eq!(Error::DependencyUnavailable("qdrant".into()).status_code(), 503);
        assert_eq!(Error::Internal("boom".into()).status_code(), 500);
    }
}
