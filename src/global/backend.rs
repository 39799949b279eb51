//! Durable Object Backends
//!
//! The durable tier only needs put/get by key with optional byte ranges.
//! Two backends ship with the crate:
//! - [`InMemoryBackend`]: DashMap-based, for tests and single-process setups
//! - [`LocalDirBackend`]: one file per object under a directory, written via
//!   temp-file-and-rename so readers never see a partial object

use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::{Error, Result};

/// Durable object store contract
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Store `data` under `key`, replacing any previous object
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch an object, or a byte range of it
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Option<Bytes>>;

    /// Delete an object
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check if an object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Backend name for logs
    fn name(&self) -> &str;

    /// Get backend statistics
    fn stats(&self) -> BackendStats;
}

/// Backend statistics
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Objects currently stored
    pub object_count: u64,
    /// Bytes currently stored
    pub total_bytes: u64,
    /// Get operations
    pub reads: u64,
    /// Put operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

#[derive(Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

fn slice_range(data: Bytes, range: Option<Range<u64>>) -> Bytes {
    match range {
        None => data,
        Some(r) => {
            let len = data.len() as u64;
            let start = r.start.min(len) as usize;
            let end = (r.end.min(len) as usize).max(start);
            data.slice(start..end)
        }
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// In-memory backend
pub struct InMemoryBackend {
    name: String,
    objects: DashMap<String, Bytes>,
    total_bytes: AtomicU64,
    ops: OpCounters,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            ops: OpCounters::default(),
        }
    }

    /// Keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl ObjectBackend for InMemoryBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        let size = data.len() as u64;
        if let Some(old) = self.objects.insert(key.to_string(), data) {
            self.total_bytes
                .fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Option<Bytes>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .objects
            .get(key)
            .map(|data| slice_range(data.clone(), range)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        match self.objects.remove(key) {
            Some((_, data)) => {
                self.total_bytes
                    .fetch_sub(data.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.objects.contains_key(key))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            object_count: self.objects.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.ops.reads.load(Ordering::Relaxed),
            writes: self.ops.writes.load(Ordering::Relaxed),
            deletes: self.ops.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Local Directory Backend
// =============================================================================

/// Directory-backed object store
pub struct LocalDirBackend {
    name: String,
    root: PathBuf,
    ops: OpCounters,
    object_count: AtomicU64,
    total_bytes: AtomicU64,
}

impl LocalDirBackend {
    /// Create a backend rooted at `root` (created on first put)
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            root: root.as_ref().to_path_buf(),
            ops: OpCounters::default(),
            object_count: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(Error::backend(key, "invalid object key"));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectBackend for LocalDirBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend(key, e))?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::backend(key, e))?;

        let previous = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::backend(key, e))?;

        match previous {
            Some(old) => {
                self.total_bytes.fetch_sub(old, Ordering::Relaxed);
            }
            None => {
                self.object_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Option<Bytes>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(slice_range(Bytes::from(data), range))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::backend(key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        let path = self.object_path(key)?;
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::backend(key, e)),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.object_count.fetch_sub(1, Ordering::Relaxed);
                self.total_bytes.fetch_sub(size, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::backend(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            object_count: self.object_count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.ops.reads.load(Ordering::Relaxed),
            writes: self.ops.writes.load(Ordering::Relaxed),
            deletes: self.ops.deletes.load(Ordering::Relaxed),
        }
    }
}
