//! Chunk Store Abstraction
//!
//! Object storage seam used by sync tasks to write binlogs and by the
//! checkpoint updater to publish channel checkpoints.
//!
//! Implementations:
//! - `InMemoryChunkStore`: For unit tests and simulation
//! - `LocalFsChunkStore`: For development and single-node deployments

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Metadata for a stored chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Chunk key (path relative to the store root)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
}

/// Boxed future returned by `ChunkStore` operations
pub type ChunkFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Chunk storage trait
pub trait ChunkStore: Send + Sync + 'static {
    /// Write a chunk (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ChunkFuture<'a, ()>;

    /// Read a chunk's contents
    fn get<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, Vec<u8>>;

    fn exists<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, bool>;

    /// Delete a chunk. Deleting a missing chunk is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, ()>;

    /// List chunks whose key starts with `prefix`, sorted by key
    fn list<'a>(&'a self, prefix: &'a str) -> ChunkFuture<'a, Vec<ChunkMeta>>;
}

impl<S: ChunkStore> ChunkStore for Arc<S> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ChunkFuture<'a, ()> {
        (**self).put(key, data)
    }

    fn get<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, Vec<u8>> {
        (**self).get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, bool> {
        (**self).exists(key)
    }

    fn delete<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, ()> {
        (**self).delete(key)
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ChunkFuture<'a, Vec<ChunkMeta>> {
        (**self).list(prefix)
    }
}

// ============================================================================
// InMemoryChunkStore
// ============================================================================

/// In-memory chunk store. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChunkStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// All keys currently stored, in order
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ChunkFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().insert(key.to_string(), data.to_vec());
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .cloned()
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, bool> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ChunkFuture<'a, Vec<ChunkMeta>> {
        Box::pin(async move {
            let data = self.data.read();
            Ok(data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ChunkMeta {
                    key: k.clone(),
                    size_bytes: v.len() as u64,
                })
                .collect())
        })
    }
}

// ============================================================================
// LocalFsChunkStore
// ============================================================================

/// Local filesystem chunk store rooted at a base directory
#[derive(Debug, Clone)]
pub struct LocalFsChunkStore {
    base_path: PathBuf,
}

impl LocalFsChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsChunkStore {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

fn walk_dir(dir: &Path, base: &Path, prefix: &str, out: &mut Vec<ChunkMeta>) -> IoResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_dir(&path, base, prefix, out)?;
            continue;
        }
        let Ok(rel) = path.strip_prefix(base) else {
            continue;
        };
        let key = rel.to_string_lossy().replace('\\', "/");
        if key.starts_with(prefix) {
            out.push(ChunkMeta {
                key,
                size_bytes: std::fs::metadata(&path)?.len(),
            });
        }
    }
    Ok(())
}

impl ChunkStore for LocalFsChunkStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ChunkFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Write-then-rename so readers never observe a torn chunk
            let mut tmp = path.clone().into_os_string();
            tmp.push(".tmp");
            let tmp = PathBuf::from(tmp);
            tokio::fs::write(&tmp, data).await?;
            tokio::fs::rename(&tmp, &path).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)).await })
    }

    fn exists<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(self.full_path(key)).await })
    }

    fn delete<'a>(&'a self, key: &'a str) -> ChunkFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ChunkFuture<'a, Vec<ChunkMeta>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let prefix = prefix.to_string();
            let mut chunks = tokio::task::spawn_blocking(move || {
                let mut out = Vec::new();
                if base.exists() {
                    walk_dir(&base, &base, &prefix, &mut out)?;
                }
                Ok::<_, IoError>(out)
            })
            .await
            .map_err(|e| IoError::new(ErrorKind::Other, e.to_string()))??;
            chunks.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(chunks)
        })
    }
}
