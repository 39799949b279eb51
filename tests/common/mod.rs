//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;

use strata::error::{Error, Result};
use strata::global::{BackendStats, InMemoryBackend, ObjectBackend};
use strata::EngineConfig;

/// Fresh directory under the system temp dir
pub fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("strata-{tag}-{}", uuid::Uuid::new_v4()))
}

/// Removes a directory tree on drop
pub struct TempDir(pub PathBuf);

impl TempDir {
    pub fn new(tag: &str) -> Self {
        Self(temp_dir(tag))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Small, fast configuration for one node
pub fn small_config(data_dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: data_dir.to_path_buf(),
        segment_size: 64,
        segments_per_block: 2,
        bitmap_size: 16,
        cache_capacity_bytes: 64 * 32,
        cache_sync_wait_ms: 1_000,
        local_workers: 2,
        local_max_blocks: 1_000,
        local_evict_interval_ms: 20,
        local_retry_delay_ms: 10,
        file_handle_idle_ms: 200,
        global_workers: 2,
        global_backends: 1,
        upload_retry_delay_ms: 10,
        shutdown_grace_ms: 5_000,
        coalesce_timeout_ms: 30,
        ..Default::default()
    }
}

pub fn backends(backend: &Arc<InMemoryBackend>) -> Vec<Arc<dyn ObjectBackend>> {
    vec![Arc::clone(backend) as Arc<dyn ObjectBackend>]
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Deterministic test payload
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

/// Backend whose first `failures` puts fail
pub struct FlakyBackend {
    inner: InMemoryBackend,
    failures: AtomicU64,
    pub failed_puts: AtomicU64,
}

impl FlakyBackend {
    pub fn new(failures: u64) -> Self {
        Self {
            inner: InMemoryBackend::new("flaky"),
            failures: AtomicU64::new(failures),
            failed_puts: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ObjectBackend for FlakyBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let left = self.failures.load(Ordering::Acquire);
        if left > 0
            && self
                .failures
                .compare_exchange(left, left - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.failed_puts.fetch_add(1, Ordering::Relaxed);
            return Err(Error::backend(key, "injected failure"));
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Option<Bytes>> {
        self.inner.get(key, range).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn stats(&self) -> BackendStats {
        self.inner.stats()
    }
}

/// Backend whose puts wait for a permit
///
/// Starts closed; `allow` lets a number of puts through, `open` lets all.
pub struct GatedBackend {
    inner: InMemoryBackend,
    permits: AtomicU64,
    pub puts_started: AtomicU64,
}

impl GatedBackend {
    pub fn new() -> Self {
        Self {
            inner: InMemoryBackend::new("gated"),
            permits: AtomicU64::new(0),
            puts_started: AtomicU64::new(0),
        }
    }

    pub fn allow(&self, puts: u64) {
        self.permits.fetch_add(puts, Ordering::AcqRel);
    }

    pub fn open(&self) {
        self.allow(u64::MAX / 2);
    }

    pub fn started(&self) -> u64 {
        self.puts_started.load(Ordering::Acquire)
    }

    pub fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }
}

#[async_trait]
impl ObjectBackend for GatedBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.puts_started.fetch_add(1, Ordering::AcqRel);
        loop {
            let left = self.permits.load(Ordering::Acquire);
            if left > 0
                && self
                    .permits
                    .compare_exchange(left, left - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Option<Bytes>> {
        self.inner.get(key, range).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn stats(&self) -> BackendStats {
        self.inner.stats()
    }
}
