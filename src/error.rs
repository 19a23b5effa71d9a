//! Crate-wide error taxonomy.
//!
//! Mirrors the error categories named in the knowledge base design: store
//! failures are fatal for mutating operations, semantic/graph failures are
//! degraded-mode signals the caller downgrades around, and extractor failures
//! carry a stable category string that retry tooling keys off of.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("relational store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("semantic search unavailable: {0}")]
    SemanticUnavailable(String),

    #[error("graph store unavailable: {0}")]
    GraphUnavailable(String),

    #[error("extractor error ({category}): {message}")]
    Extractor {
        category: ExtractorErrorCategory,
        message: String,
    },

    #[error("invalid path: {0}")]
    PathInvalid(String),

    #[error("embedding batch failed: {0}")]
    EmbedBatchFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ConduitError>;

/// Categorised LLM-extraction failure reasons. Display strings are the
/// contract: retry tooling and dashboards match on these exact names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorErrorCategory {
    IncompleteJson,
    InvalidEscape,
    SchemaMismatch,
    Timeout,
    Connection,
    ParseError,
}

impl std::fmt::Display for ExtractorErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExtractorErrorCategory::IncompleteJson => "incomplete_json",
            ExtractorErrorCategory::InvalidEscape => "invalid_escape",
            ExtractorErrorCategory::SchemaMismatch => "schema_mismatch",
            ExtractorErrorCategory::Timeout => "timeout",
            ExtractorErrorCategory::Connection => "connection",
            ExtractorErrorCategory::ParseError => "parse_error",
        };
        f.write_str(s)
    }
}
