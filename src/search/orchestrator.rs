//! Search orchestration.
//!
//! [`SearchContext`] ties the cache manager, the embedding fetcher and the
//! ranker into a single linear pipeline:
//!
//! ```text
//! query text ─▶ validate ─▶ ensure cache ─▶ fetch query embedding ─▶ rank ─▶ results
//! ```
//!
//! Each stage runs at most once per call and nothing is retried; callers
//! re-submit on failure.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::cache::EmbeddingCacheManager;
use super::corpus::CorpusSource;
use super::fetcher::EmbeddingFetcher;
use super::ranker::rank;
use super::types::{SearchProgress, SearchQuery, SimilarityResult};
use super::DEFAULT_TOP_K;
use crate::error::{Error, Result};

/// Everything a search needs, passed around explicitly.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct SearchContext {
    cache: Arc<EmbeddingCacheManager>,
    fetcher: Arc<dyn EmbeddingFetcher>,
    corpus: Arc<dyn CorpusSource>,
    top_k: usize,
}

impl SearchContext {
    pub fn new(
        cache: Arc<EmbeddingCacheManager>,
        fetcher: Arc<dyn EmbeddingFetcher>,
        corpus: Arc<dyn CorpusSource>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            corpus,
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Default number of results when the query does not say.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn cache(&self) -> &Arc<EmbeddingCacheManager> {
        &self.cache
    }

    pub fn corpus(&self) -> &Arc<dyn CorpusSource> {
        &self.corpus
    }

    /// Load the persisted cache at startup. A miss leaves the cache empty;
    /// the first search will refresh it.
    pub async fn init(&self) {
        if self.cache.load().await.is_none() {
            debug!("No fresh persisted cache at startup");
        }
    }

    /// Force a corpus refresh.
    pub async fn refresh(&self) -> Result<usize> {
        let cache = self.cache.refresh(self.corpus.as_ref()).await?;
        Ok(cache.len())
    }

    /// Run a search.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SimilarityResult>> {
        self.search_with_progress(query, None).await
    }

    /// Run a search, reporting each stage on `progress`.
    pub async fn search_with_progress(
        &self,
        query: &SearchQuery,
        progress: Option<&UnboundedSender<SearchProgress>>,
    ) -> Result<Vec<SimilarityResult>> {
        let started = Instant::now();
        let result = self.run_pipeline(query, progress).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!("chatsearch_searches_total", "outcome" => outcome).increment(1);
        metrics::histogram!("chatsearch_search_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(results) => info!(
                query_id = %query.id,
                "Search complete, found {} results in {:?}",
                results.len(),
                started.elapsed()
            ),
            Err(e) => warn!(query_id = %query.id, "Search failed: {}", e),
        }
        result
    }

    async fn run_pipeline(
        &self,
        query: &SearchQuery,
        progress: Option<&UnboundedSender<SearchProgress>>,
    ) -> Result<Vec<SimilarityResult>> {
        let report = |event: SearchProgress| {
            if let Some(tx) = progress {
                let _ = tx.send(event);
            }
        };

        if query.is_blank() {
            return Err(Error::EmptyQuery);
        }
        debug!(query_id = %query.id, "Starting search");

        report(SearchProgress::LoadingEmbeddings);
        let snapshot = self.cache.ensure(self.corpus.as_ref()).await?;

        report(SearchProgress::FetchingQueryEmbedding);
        let query_vector = self
            .fetcher
            .fetch_embedding(query.raw_text.trim())
            .await
            .map_err(|e| match e {
                Error::EmbeddingUnavailable(reason) => Error::EmbeddingUnavailable(reason),
                other => Error::EmbeddingUnavailable(other.to_string()),
            })?;

        report(SearchProgress::Ranking {
            total: snapshot.len(),
        });
        let top_k = query.top_k.unwrap_or(self.top_k);
        let results = rank(&query_vector, &snapshot.entries, top_k)?;

        report(SearchProgress::Complete {
            results: results.clone(),
        });
        Ok(results)
    }
}
