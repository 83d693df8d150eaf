//! Corpus change watcher.
//!
//! Turns a stream of "corpus changed" notifications into cache refreshes.
//! Where the notifications come from (database change feed, broadcast
//! channel, webhook) is up to the caller.

use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::EmbeddingCacheManager;
use super::corpus::CorpusSource;

/// A change to the message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum CorpusChange {
    Inserted(String),
    Updated(String),
    Deleted(String),
}

/// Spawn a task that refreshes the cache whenever `changes` yields.
///
/// Notifications that are already queued when a refresh starts are folded
/// into that refresh. Refresh failures are logged and the task keeps
/// watching; it ends when the stream ends.
pub fn watch_corpus_changes<S>(
    cache: Arc<EmbeddingCacheManager>,
    source: Arc<dyn CorpusSource>,
    changes: S,
) -> JoinHandle<usize>
where
    S: Stream<Item = CorpusChange> + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        // The coalescing poll may observe the end of the stream; fusing keeps
        // the next poll from touching a finished stream.
        let mut changes = changes.fuse();
        let mut refreshes = 0usize;

        while let Some(first) = changes.next().await {
            debug!("Corpus change: {:?}", first);
            let mut coalesced = 0usize;
            while let Some(Some(next)) = changes.next().now_or_never() {
                debug!("Corpus change: {:?}", next);
                coalesced += 1;
            }
            if coalesced > 0 {
                debug!("Coalesced {} queued corpus changes", coalesced);
            }

            match cache.refresh(source.as_ref()).await {
                Ok(snapshot) => {
                    refreshes += 1;
                    info!(
                        "Refreshed embedding cache after corpus change ({} entries)",
                        snapshot.len()
                    );
                }
                Err(e) => warn!("Refresh after corpus change failed: {}", e),
            }
        }

        debug!("Corpus change stream ended");
        refreshes
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::cache::CacheManagerConfig;
    use crate::search::corpus::InMemoryCorpus;
    use crate::search::storage::MemoryStorage;
    use crate::search::types::EmbeddingEntry;
    use std::time::Duration;

    fn manager() -> Arc<EmbeddingCacheManager> {
        Arc::new(EmbeddingCacheManager::new(
            Arc::new(MemoryStorage::new()),
            CacheManagerConfig {
                ttl: Duration::from_secs(300),
                dimension: Some(2),
            },
        ))
    }

    #[tokio::test]
    async fn test_queued_changes_are_coalesced() {
        let cache = manager();
        let corpus = Arc::new(InMemoryCorpus::new(vec![EmbeddingEntry::new(
            "1",
            "hello",
            vec![1.0, 0.0],
            0,
        )]));

        let changes = futures::stream::iter(vec![
            CorpusChange::Inserted("1".into()),
            CorpusChange::Updated("1".into()),
            CorpusChange::Inserted("2".into()),
        ]);
        let refreshes = watch_corpus_changes(cache.clone(), corpus.clone(), changes)
            .await
            .unwrap();

        assert_eq!(refreshes, 1);
        assert_eq!(corpus.fetch_count(), 1);
        assert_eq!(cache.get().len(), 1);
    }

    #[tokio::test]
    async fn test_each_separate_change_triggers_refresh() {
        let cache = manager();
        let corpus = Arc::new(InMemoryCorpus::new(vec![]));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = tokio_stream_from(rx);

        let handle = watch_corpus_changes(cache.clone(), corpus.clone(), stream);

        tx.send(CorpusChange::Inserted("1".into())).unwrap();
        wait_for_fetches(&corpus, 1).await;
        corpus.set_entries(vec![EmbeddingEntry::new("1", "hi", vec![0.0, 1.0], 0)]);
        tx.send(CorpusChange::Updated("1".into())).unwrap();
        wait_for_fetches(&corpus, 2).await;
        drop(tx);

        assert_eq!(handle.await.unwrap(), 2);
        assert_eq!(cache.get().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_watching() {
        let cache = manager();
        let corpus = Arc::new(InMemoryCorpus::new(vec![]));
        corpus.set_failure(Some("offline"));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = watch_corpus_changes(cache, corpus.clone(), tokio_stream_from(rx));

        tx.send(CorpusChange::Deleted("9".into())).unwrap();
        wait_for_fetches(&corpus, 1).await;
        corpus.set_failure(None);
        tx.send(CorpusChange::Inserted("10".into())).unwrap();
        wait_for_fetches(&corpus, 2).await;
        drop(tx);

        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finite_stream_ends_cleanly() {
        let cache = manager();
        let corpus = Arc::new(InMemoryCorpus::new(vec![EmbeddingEntry::new(
            "1",
            "hello",
            vec![1.0, 0.0],
            0,
        )]));

        let changes = Box::pin(futures::stream::unfold(0u32, |n| async move {
            (n < 2).then(|| (CorpusChange::Inserted(n.to_string()), n + 1))
        }));
        let refreshes = watch_corpus_changes(cache.clone(), corpus, changes)
            .await
            .unwrap();

        assert_eq!(refreshes, 1);
        assert_eq!(cache.get().len(), 1);
    }

    #[test]
    fn test_change_serialization() {
        let json = serde_json::to_value(CorpusChange::Inserted("42".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "inserted", "id": "42"}));
    }

    fn tokio_stream_from(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<CorpusChange>,
    ) -> impl Stream<Item = CorpusChange> + Send + Unpin + 'static {
        Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    async fn wait_for_fetches(corpus: &InMemoryCorpus, count: usize) {
        for _ in 0..200 {
            if corpus.fetch_count() >= count {
                // Let the refresh that follows the fetch finish.
                tokio::time::sleep(Duration::from_millis(10)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("corpus was never fetched {} times", count);
    }
}
