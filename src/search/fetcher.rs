//! Query embedding fetchers.
//!
//! The embedding model lives outside this crate. Fetchers turn a piece of
//! text into a vector and collapse every failure into
//! [`Error::EmbeddingUnavailable`]; callers never see a partial vector.

use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Turns text into an embedding vector.
#[async_trait]
pub trait EmbeddingFetcher: Send + Sync {
    async fn fetch_embedding(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Option<Vec<f32>>,
}

/// Calls a remote embedding endpoint over HTTP.
///
/// The endpoint accepts `{"text": "..."}` and answers with
/// `{"embedding": [...]}`.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingFetcher {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    dimension: Option<usize>,
}

impl HttpEmbeddingFetcher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
            dimension: Some(super::EMBEDDING_DIM),
        })
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Required output dimensionality; `None` accepts any non-empty vector.
    pub fn with_dimension(mut self, dimension: Option<usize>) -> Self {
        self.dimension = dimension;
        self
    }
}

#[async_trait]
impl EmbeddingFetcher for HttpEmbeddingFetcher {
    async fn fetch_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&EmbeddingRequest { text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            error!("Embedding request failed: {}", e);
            Error::EmbeddingUnavailable(format!("request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Embedding endpoint returned {}: {}", status, body);
            return Err(Error::EmbeddingUnavailable(format!(
                "endpoint returned {}",
                status
            )));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            Error::EmbeddingUnavailable(format!("malformed response: {}", e))
        })?;
        let embedding = parsed
            .embedding
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::EmbeddingUnavailable("response has no embedding".into()))?;

        if let Some(expected) = self.dimension {
            if embedding.len() != expected {
                return Err(Error::EmbeddingUnavailable(format!(
                    "expected {} dimensions, got {}",
                    expected,
                    embedding.len()
                )));
            }
        }

        debug!("Fetched query embedding ({} dims)", embedding.len());
        Ok(embedding)
    }
}

/// Memoises another fetcher's results by exact query text.
///
/// Only successful fetches are cached, so a failed lookup is retried on the
/// next call. Concurrent lookups of the same uncached text wait on a single
/// call to the wrapped fetcher.
pub struct CachedEmbeddingFetcher {
    inner: Arc<dyn EmbeddingFetcher>,
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl CachedEmbeddingFetcher {
    pub fn new(inner: Arc<dyn EmbeddingFetcher>, ttl: Duration, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Drop every memoised embedding.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl EmbeddingFetcher for CachedEmbeddingFetcher {
    async fn fetch_embedding(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.get(text).await {
            debug!("Query embedding cache hit");
            metrics::counter!("chatsearch_query_embedding_cache_total", "result" => "hit")
                .increment(1);
            return Ok(hit.as_ref().clone());
        }
        metrics::counter!("chatsearch_query_embedding_cache_total", "result" => "miss")
            .increment(1);

        // Concurrent misses for the same text share one inner call.
        let embedding = self
            .cache
            .try_get_with(text.to_string(), async {
                self.inner.fetch_embedding(text).await.map(Arc::new)
            })
            .await
            .map_err(|e| match e.as_ref() {
                Error::EmbeddingUnavailable(reason) => Error::EmbeddingUnavailable(reason.clone()),
                other => Error::EmbeddingUnavailable(other.to_string()),
            })?;
        Ok(embedding.as_ref().clone())
    }
}

/// Computes embeddings in-process with FastEmbed (all-MiniLM-L6-v2).
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbeddingFetcher {
    model: Arc<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbeddingFetcher {
    /// Load the default model, downloading it on first use.
    pub fn new() -> Result<Self> {
        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2);
        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| Error::EmbeddingUnavailable(format!("failed to load model: {}", e)))?;
        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingFetcher for LocalEmbeddingFetcher {
    async fn fetch_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.model.clone();
        let text = text.to_string();
        let mut embeddings = tokio::task::spawn_blocking(move || model.embed(vec![text], None))
            .await
            .map_err(|e| Error::EmbeddingUnavailable(format!("embedding task failed: {}", e)))?
            .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))?;
        embeddings
            .pop()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::EmbeddingUnavailable("model returned no embedding".into()))
    }
}
