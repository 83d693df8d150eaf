//! Semantic search over chat message embeddings.
//!
//! Provides cosine-similarity search over a cached corpus of embedded
//! messages:
//! - Cache manager with a TTL freshness policy and atomic persistence
//! - Embedding fetcher backed by an external embedding endpoint
//! - Ranker returning the top-K most similar messages
//! - Orchestrator wiring the three together for one query
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │   Query text    │────▶│ EmbeddingFetcher │
//! └─────────────────┘     │  (HTTP / memo)   │
//!                         └────────┬─────────┘
//!                                  │
//!                                  ▼
//!                          ┌──────────────┐
//!                          │ Query vector │
//!                          │  [f32; 384]  │
//!                          └──────┬───────┘
//!                                 │
//! ┌──────────────┐   refresh  ┌───┴──────────┐     ┌──────────────┐
//! │ CorpusSource │───────────▶│ CacheManager │◀───▶│ CacheStorage │
//! └──────────────┘            └──────┬───────┘     └──────────────┘
//!                                    │ snapshot
//!                                    ▼
//!                            ┌──────────────┐
//!                            │    Ranker    │
//!                            │ (top-K, cos) │
//!                            └──────────────┘
//! ```

mod cache;
mod corpus;
mod fetcher;
mod orchestrator;
mod ranker;
mod storage;
mod types;
mod watcher;

pub use cache::{
    CacheManagerConfig, EmbeddingCacheManager, CACHE_KEY_EMBEDDINGS, CACHE_KEY_LAST_UPDATED,
};
pub use corpus::{
    parse_vector_literal, CorpusSource, InMemoryCorpus, JsonFileCorpus, RestCorpusSource,
};
#[cfg(feature = "local-embeddings")]
pub use fetcher::LocalEmbeddingFetcher;
pub use fetcher::{CachedEmbeddingFetcher, EmbeddingFetcher, HttpEmbeddingFetcher};
pub use orchestrator::SearchContext;
pub use ranker::{cosine_similarity, rank};
#[cfg(feature = "rocksdb")]
pub use storage::RocksStorage;
pub use storage::{CacheStorage, FileStorage, MemoryStorage};
pub use types::{
    now_millis, EmbeddingCache, EmbeddingEntry, SearchProgress, SearchQuery, SimilarityResult,
};
pub use watcher::{watch_corpus_changes, CorpusChange};

/// Embedding dimension produced by the collaborator
pub const EMBEDDING_DIM: usize = 384;

/// Number of results returned when a query does not ask for a count
pub const DEFAULT_TOP_K: usize = 5;
