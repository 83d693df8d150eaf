//! Core search data types.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A chat message paired with its embedding vector.
///
/// Entries are never mutated: when the source message changes, a refresh
/// supersedes the old entry with a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    /// Message id from the message store.
    pub id: String,
    /// Message text that was embedded.
    pub text: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// When the source message was written (epoch millis).
    pub source_timestamp: u64,
    /// Channel slug, when the message belongs to a channel.
    #[serde(default)]
    pub channel: Option<String>,
    /// Author's username.
    #[serde(default)]
    pub username: Option<String>,
}

impl EmbeddingEntry {
    /// Create an entry with no display metadata.
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        vector: Vec<f32>,
        source_timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            vector,
            source_timestamp,
            channel: None,
            username: None,
        }
    }

    /// Attach the channel slug.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Attach the author's username.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Snapshot of the cached corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCache {
    /// Entries in corpus insertion order.
    pub entries: Vec<EmbeddingEntry>,
    /// When the cache was last refreshed (epoch millis). `None` until the
    /// cache has been populated once.
    pub last_refreshed: Option<u64>,
}

impl EmbeddingCache {
    /// An unpopulated cache.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a populated cache, enforcing the shared-dimension invariant.
    ///
    /// When `expected_dim` is set every entry must have exactly that length;
    /// otherwise the first entry fixes the dimension.
    pub fn new(
        entries: Vec<EmbeddingEntry>,
        last_refreshed: u64,
        expected_dim: Option<usize>,
    ) -> Result<Self> {
        validate_dimensions(&entries, expected_dim)?;
        Ok(Self {
            entries,
            last_refreshed: Some(last_refreshed),
        })
    }

    /// Whether this cache has ever been populated.
    pub fn is_populated(&self) -> bool {
        self.last_refreshed.is_some()
    }

    /// Whether the cache is younger than `ttl_millis` at `now`.
    pub fn is_fresh(&self, now: u64, ttl_millis: u64) -> bool {
        match self.last_refreshed {
            Some(ts) => now.saturating_sub(ts) < ttl_millis,
            None => false,
        }
    }

    /// Vector dimensionality shared by all entries, if any entries exist.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(EmbeddingEntry::dimension)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_dimensions(entries: &[EmbeddingEntry], expected_dim: Option<usize>) -> Result<()> {
    let Some(expected) = expected_dim.or_else(|| entries.first().map(EmbeddingEntry::dimension))
    else {
        return Ok(());
    };

    for entry in entries {
        if entry.dimension() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: entry.dimension(),
                entry_id: entry.id.clone(),
            });
        }
    }
    Ok(())
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub entry: EmbeddingEntry,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// A user search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Request id for tracing.
    pub id: String,
    pub raw_text: String,
    /// Submission time (epoch millis).
    pub submitted_at: u64,
    /// Overrides the context's default `top_k`.
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl SearchQuery {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            raw_text: raw_text.into(),
            submitted_at: now_millis(),
            top_k: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Whether the query text carries no searchable content.
    pub fn is_blank(&self) -> bool {
        self.raw_text.trim().is_empty()
    }
}

/// Progress updates emitted while a search runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchProgress {
    /// Making sure a cached corpus is available.
    LoadingEmbeddings,
    /// Waiting on the embedding collaborator.
    FetchingQueryEmbedding,
    /// Scoring `total` cached entries.
    Ranking { total: usize },
    /// Search finished.
    Complete { results: Vec<SimilarityResult> },
}
