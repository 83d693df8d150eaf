//! Node configuration.
//!
//! Loaded from a TOML file. Secrets are never stored in the file; each
//! section names the environment variable that holds its key.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::search::{DEFAULT_TOP_K, EMBEDDING_DIM};

/// Default cache time-to-live (5 minutes).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub corpus: CorpusConfig,
    pub search: SearchConfig,
    pub api: ApiConfig,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: NodeConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), raw)?;
        Ok(())
    }

    /// Reject values the search core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.cache.dimension == 0 {
            return Err(Error::Config(
                "cache.dimension must be greater than 0".to_string(),
            ));
        }
        if self.embedding.timeout_secs == 0 {
            return Err(Error::Config(
                "embedding.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.corpus.rest_url.is_some() && self.corpus.file.is_some() {
            return Err(Error::Config(
                "corpus.rest_url and corpus.file are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Embedding cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum age before the persisted cache is refreshed.
    pub ttl_secs: u64,
    /// Cache file location. `None` keeps the cache in memory only.
    pub path: Option<PathBuf>,
    /// Expected vector dimensionality.
    pub dimension: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            path: Some(PathBuf::from("chatsearch-cache.bin")),
            dimension: EMBEDDING_DIM,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Embedding collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Endpoint accepting `{"text": ...}` and returning `{"embedding": [...]}`.
    pub endpoint: String,
    /// Environment variable holding the bearer token.
    pub api_key_env: Option<String>,
    /// Request timeout.
    pub timeout_secs: u64,
    /// How long a query embedding stays memoised (0 disables memoisation).
    pub memo_ttl_secs: u64,
    /// Maximum memoised query embeddings.
    pub memo_capacity: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:54321/functions/v1/getEmbedding".to_string(),
            api_key_env: Some("CHATSEARCH_EMBEDDING_TOKEN".to_string()),
            timeout_secs: 30,
            memo_ttl_secs: 600,
            memo_capacity: 1_000,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the bearer token from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        resolve_env(self.api_key_env.as_deref())
    }
}

/// Corpus source settings. Exactly one of `rest_url` or `file` is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Base URL of the backend REST API (e.g. `https://xyz.supabase.co`).
    pub rest_url: Option<String>,
    /// JSON file holding exported entries.
    pub file: Option<PathBuf>,
    /// Environment variable holding the backend API key.
    pub api_key_env: Option<String>,
}

impl CorpusConfig {
    pub fn api_key(&self) -> Option<String> {
        resolve_env(self.api_key_env.as_deref())
    }
}

/// Search defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_address: String,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

fn resolve_env(name: Option<&str>) -> Option<String> {
    name.and_then(|n| std::env::var(n).ok())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_search_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.dimension, 384);
        assert_eq!(config.search.top_k, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = NodeConfig::default();
        config.search.top_k = 12;
        config.corpus.rest_url = Some("https://example.supabase.co".to_string());
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.search.top_k, 12);
        assert_eq!(
            loaded.corpus.rest_url.as_deref(),
            Some("https://example.supabase.co")
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[search]\ntop_k = 3\n").unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.search.top_k, 3);
        assert_eq!(loaded.cache.ttl_secs, DEFAULT_CACHE_TTL_SECS);
    }

    #[test]
    fn test_rejects_conflicting_corpus_sources() {
        let mut config = NodeConfig::default();
        config.corpus.rest_url = Some("https://example.supabase.co".to_string());
        config.corpus.file = Some(PathBuf::from("corpus.json"));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_rejects_zero_dimension() {
        let mut config = NodeConfig::default();
        config.cache.dimension = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
