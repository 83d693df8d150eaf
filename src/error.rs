//! Error types for the search node.

use thiserror::Error;

/// Errors produced by the search core and its surrounding layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Query text was empty or whitespace only.
    #[error("Search query is empty")]
    EmptyQuery,

    /// No usable embedding cache and the refresh failed.
    #[error("Embedding cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The embedding collaborator failed or returned a malformed response.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Query and corpus vectors disagree on length.
    #[error(
        "Dimension mismatch for entry '{entry_id}': expected {expected}, got {actual}"
    )]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        entry_id: String,
    },

    /// Persisted cache storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Corpus source error.
    #[error("Corpus error: {0}")]
    Corpus(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP API error.
    #[error("API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable label for the error kind, used in API bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::EmptyQuery => "empty_query",
            Error::CacheUnavailable(_) => "cache_unavailable",
            Error::EmbeddingUnavailable(_) => "embedding_unavailable",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::Storage(_) => "storage",
            Error::Corpus(_) => "corpus",
            Error::Config(_) => "config",
            Error::Api(_) => "api",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type for search node operations.
pub type Result<T> = std::result::Result<T, Error>;
