//! Chat search node
//!
//! Embedding-similarity search over a cached corpus of chat messages.
//! The cache is persisted with a five minute freshness window and
//! refreshed from the message store when it goes stale.

pub mod api;
pub mod config;
pub mod error;
pub mod search;

pub use api::{ApiServer, AppState};
pub use config::{ApiConfig, NodeConfig};
pub use error::{Error, Result};
pub use search::{
    cosine_similarity, rank, CacheManagerConfig, CacheStorage, CachedEmbeddingFetcher,
    CorpusSource, EmbeddingCache, EmbeddingCacheManager, EmbeddingEntry, EmbeddingFetcher,
    FileStorage, HttpEmbeddingFetcher, InMemoryCorpus, JsonFileCorpus, MemoryStorage,
    RestCorpusSource, SearchContext, SearchQuery, SimilarityResult,
};
