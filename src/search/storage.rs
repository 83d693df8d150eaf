//! Persisted cache storage.
//!
//! A small key-value capability the cache manager persists through. Writers
//! that touch more than one key go through [`CacheStorage::write_batch`] so
//! that observers never see a refreshed timestamp next to stale entries.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Key-value storage for the persisted embedding cache.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a single value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write_batch(vec![(key.to_string(), value)]).await
    }

    /// Write several values at once. Either all of them land or none do.
    async fn write_batch(&self, items: Vec<(String, Vec<u8>)>) -> Result<()>;
}

/// In-memory storage, used as the default backing and as a test fake.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent reads fail (simulates an unreadable store).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail (simulates a full or read-only store).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory storage read failure".to_string()));
        }
        let values = self
            .values
            .read()
            .map_err(|_| Error::Storage("memory storage lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    async fn write_batch(&self, items: Vec<(String, Vec<u8>)>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory storage write failure".to_string()));
        }
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::Storage("memory storage lock poisoned".to_string()))?;
        values.extend(items);
        Ok(())
    }
}

/// File-backed storage.
///
/// All keys live in a single bincode-encoded map. Every write rewrites the
/// whole file through a temp file and a rename, so a batch is atomic on
/// filesystems with atomic rename.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_map(&self) -> Result<HashMap<String, Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::Storage(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut map = self.read_map().await?;
        Ok(map.remove(key))
    }

    async fn write_batch(&self, items: Vec<(String, Vec<u8>)>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        // An undecodable file is replaced; any other read error aborts the
        // write so keys that are merely unreadable right now are not lost.
        let mut map = match self.read_map().await {
            Ok(map) => map,
            Err(Error::Serialization(e)) => {
                warn!(
                    "Replacing undecodable cache storage at {}: {}",
                    self.path.display(),
                    e
                );
                HashMap::new()
            }
            Err(e) => return Err(e),
        };
        map.extend(items);
        let bytes = bincode::serialize(&map)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            "Wrote {} bytes of cache storage to {}",
            bytes.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// RocksDB-backed storage.
#[cfg(feature = "rocksdb")]
pub struct RocksStorage {
    db: std::sync::Arc<rocksdb::DB>,
}

#[cfg(feature = "rocksdb")]
impl RocksStorage {
    /// Open (or create) a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path.as_ref())
            .map_err(|e| Error::Storage(format!("failed to open rocksdb: {}", e)))?;
        Ok(Self {
            db: std::sync::Arc::new(db),
        })
    }
}

#[cfg(feature = "rocksdb")]
#[async_trait]
impl CacheStorage for RocksStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || db.get(key.as_bytes()))
            .await
            .map_err(|e| Error::Storage(format!("rocksdb task failed: {}", e)))?
            .map_err(|e| Error::Storage(format!("rocksdb read failed: {}", e)))
    }

    async fn write_batch(&self, items: Vec<(String, Vec<u8>)>) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut batch = rocksdb::WriteBatch::default();
            for (key, value) in &items {
                batch.put(key.as_bytes(), value);
            }
            db.write(batch)
        })
        .await
        .map_err(|e| Error::Storage(format!("rocksdb task failed: {}", e)))?
        .map_err(|e| Error::Storage(format!("rocksdb write failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_storage_get_and_set() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("missing").await.unwrap(), None);

        storage.set("k", b"v".to_vec()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_storage_failed_batch_writes_nothing() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);

        let result = storage
            .write_batch(vec![
                ("a".to_string(), vec![1]),
                ("b".to_string(), vec![2]),
            ])
            .await;
        assert!(result.is_err());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage_read_failure() {
        let storage = MemoryStorage::new();
        storage.set_fail_reads(true);
        assert!(matches!(storage.get("k").await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_file_storage_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.bin");

        let storage = FileStorage::new(&path);
        storage
            .write_batch(vec![
                ("entries".to_string(), vec![1, 2, 3]),
                ("ts".to_string(), b"42".to_vec()),
            ])
            .await
            .unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.get("entries").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(reopened.get("ts").await.unwrap(), Some(b"42".to_vec()));
        assert!(!storage.temp_path().exists());
    }

    #[tokio::test]
    async fn test_file_storage_missing_file_is_absent() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("none.bin"));
        assert_eq!(storage.get("entries").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_storage_corrupt_file_is_error_then_recoverable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, b"\xff\xff\xff\xff\xff\xff\xff\xff\xff").unwrap();

        let storage = FileStorage::new(&path);
        assert!(storage.get("entries").await.is_err());

        storage.set("entries", vec![9]).await.unwrap();
        assert_eq!(storage.get("entries").await.unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn test_file_storage_unreadable_file_aborts_write() {
        let dir = tempdir().unwrap();
        // A directory at the storage path reads as an I/O error, not a
        // decode error.
        let path = dir.path().join("cache.bin");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        let storage = FileStorage::new(&path);
        let err = storage.set("entries", vec![1]).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "got {:?}", err);
        assert!(path.join("keep").exists());
        assert!(!dir.path().join("cache.bin.tmp").exists());
    }
}
