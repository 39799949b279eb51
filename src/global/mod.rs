//! Global Store - Durable Tier Upload/Download
//!
//! Moves clean blocks from the local tier into the shared durable object
//! store, and serves loads back out of it.
//!
//! # Workflow
//!
//! ```text
//!   store(id) ──▶ pending[id] (one entry per block, request count++)
//!                      │ enqueue unless queued or in flight
//!                      ▼
//!               TransferQueue ──▶ global-store-{i} worker threads
//!                                      │ read bytes via UploadSource
//!                                      │ backends[shard_key % n].put()
//!                                      ▼
//!                        ok: fire callbacks, requeue if more requests
//!                      fail: keep callbacks, retry after delay
//! ```
//!
//! An entry is uploaded by at most one worker at a time, so uploads of one
//! block are never reordered. Backend futures run on a runtime owned by the
//! store; blocking callers wait on a channel, so loads work from any thread.

mod backend;

pub use backend::{BackendStats, InMemoryBackend, LocalDirBackend, ObjectBackend};

use std::future::Future;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, instrument, warn};

use crate::block::BlockId;
use crate::error::{Error, Result};
use crate::transfer::{TransferQueue, Transferable};

/// Poll interval of idle upload workers
const WORKER_POLL: Duration = Duration::from_millis(50);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the global store
#[derive(Debug, Clone)]
pub struct GlobalStoreConfig {
    /// Upload worker threads
    pub workers: usize,
    /// Delay before retrying a failed upload
    pub retry_delay: Duration,
    /// Interval between drain progress reports at shutdown
    pub shutdown_grace: Duration,
}

impl Default for GlobalStoreConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_delay: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl GlobalStoreConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("global store needs at least one worker".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Upload Contract
// =============================================================================

/// Produces the bytes to upload for a block
///
/// Read at upload time, so a metadata block always uploads its latest image.
pub trait UploadSource: Send + Sync {
    fn read_for_upload(&self, id: &BlockId) -> Result<Bytes>;
}

/// Result of an upload, reported once per request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOutcome {
    pub id: BlockId,
    pub success: bool,
    pub attempts: u32,
}

/// Completion callback
pub type UploadCallback = Box<dyn FnOnce(UploadOutcome) + Send + 'static>;

struct UploadEntry {
    id: BlockId,
    source: Mutex<Arc<dyn UploadSource>>,
    callbacks: Mutex<Vec<UploadCallback>>,
    requests: AtomicU64,
    attempts: AtomicU32,
    queued: AtomicBool,
    in_flight: AtomicBool,
}

impl Transferable for UploadEntry {
    fn queued_flag(&self) -> &AtomicBool {
        &self.queued
    }
}

impl UploadEntry {
    fn new(id: BlockId, source: Arc<dyn UploadSource>) -> Self {
        Self {
            id,
            source: Mutex::new(source),
            callbacks: Mutex::new(Vec::new()),
            requests: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
            queued: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    fn fire(&self, callbacks: Vec<UploadCallback>, success: bool, attempts: u32) {
        for callback in callbacks {
            callback(UploadOutcome {
                id: self.id,
                success,
                attempts,
            });
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the global store
#[derive(Debug, Default)]
pub struct GlobalStoreStats {
    /// Upload requests accepted
    pub requests: AtomicU64,
    /// Upload attempts started
    pub uploads_started: AtomicU64,
    /// Uploads that reached the backend
    pub uploads_completed: AtomicU64,
    /// Failed upload attempts
    pub upload_failures: AtomicU64,
    /// Bytes uploaded
    pub bytes_uploaded: AtomicU64,
    /// Blocking loads served
    pub loads: AtomicU64,
    /// Loads that found nothing
    pub load_misses: AtomicU64,
    /// Loads that failed
    pub load_failures: AtomicU64,
}

impl GlobalStoreStats {
    fn record_upload(&self, bytes: u64) {
        self.uploads_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_load(&self, result: &Result<Option<Bytes>>) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(None) => {
                self.load_misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.load_failures.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(_)) => {}
        }
    }

    /// Take a plain snapshot
    pub fn snapshot(&self) -> GlobalStoreSnapshot {
        GlobalStoreSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            uploads_started: self.uploads_started.load(Ordering::Relaxed),
            uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_misses: self.load_misses.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            pending: 0,
        }
    }
}

/// Point-in-time copy of [`GlobalStoreStats`]
#[derive(Debug, Clone, Default)]
pub struct GlobalStoreSnapshot {
    pub requests: u64,
    pub uploads_started: u64,
    pub uploads_completed: u64,
    pub upload_failures: u64,
    pub bytes_uploaded: u64,
    pub loads: u64,
    pub load_misses: u64,
    pub load_failures: u64,
    /// Blocks with an upload queued, in flight or waiting for retry
    pub pending: usize,
}

// =============================================================================
// Global Store
// =============================================================================

/// Durable-tier uploader and loader
pub struct GlobalStore {
    config: GlobalStoreConfig,
    backends: Vec<Arc<dyn ObjectBackend>>,
    runtime: Runtime,
    queue: TransferQueue<UploadEntry>,
    pending: DashMap<BlockId, Arc<UploadEntry>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    stopping: AtomicBool,
    stats: GlobalStoreStats,
}

impl GlobalStore {
    /// Start the store and its upload workers
    pub fn new(
        config: GlobalStoreConfig,
        backends: Vec<Arc<dyn ObjectBackend>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if backends.is_empty() {
            return Err(Error::Config("global store needs at least one backend".into()));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.workers)
            .thread_name("global-io")
            .enable_all()
            .build()?;

        let store = Arc::new(Self {
            config,
            backends,
            runtime,
            queue: TransferQueue::new(),
            pending: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            stats: GlobalStoreStats::default(),
        });

        let mut workers = store.workers.lock();
        for i in 0..store.config.workers {
            let worker = Arc::clone(&store);
            let handle = thread::Builder::new()
                .name(format!("global-store-{i}"))
                .spawn(move || worker.run_worker(i))?;
            workers.push(handle);
        }
        drop(workers);

        info!(
            "Started global store ({} workers, {} backends)",
            store.config.workers,
            store.backends.len()
        );
        Ok(store)
    }

    /// Backend serving `id`
    fn backend_for(&self, id: &BlockId) -> Arc<dyn ObjectBackend> {
        let idx = id.shard_key() as usize % self.backends.len();
        Arc::clone(&self.backends[idx])
    }

    /// Request a durable upload of `id`
    ///
    /// Never blocks. `on_complete` fires exactly once: with success after the
    /// backend accepted the bytes, or with failure if the store already shut
    /// down and rejected the request.
    pub fn store(
        &self,
        id: BlockId,
        source: Arc<dyn UploadSource>,
        on_complete: Option<UploadCallback>,
    ) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            if let Some(callback) = on_complete {
                callback(UploadOutcome {
                    id,
                    success: false,
                    attempts: 0,
                });
            }
            return Err(Error::Shutdown(format!("upload of {id} rejected")));
        }
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        // The request count must move under the map shard lock so a finishing
        // worker cannot drop the entry between our increment and its check.
        let entry = self
            .pending
            .entry(id)
            .or_insert_with(|| Arc::new(UploadEntry::new(id, Arc::clone(&source))));
        *entry.source.lock() = source;
        if let Some(callback) = on_complete {
            entry.callbacks.lock().push(callback);
        }
        entry.requests.fetch_add(1, Ordering::AcqRel);
        if !entry.in_flight.load(Ordering::Acquire) {
            self.queue.add(Arc::clone(entry.value()));
        }
        debug!(block = %id, "upload requested");
        Ok(())
    }

    fn run_worker(self: Arc<Self>, index: usize) {
        debug!(worker = index, "global store worker started");
        while !self.stopping.load(Ordering::Acquire) {
            if let Some(entry) = self.queue.take_timeout(WORKER_POLL) {
                self.process(entry);
            }
        }
        debug!(worker = index, "global store worker stopped");
    }

    #[instrument(skip(self, entry), fields(block = %entry.id))]
    fn process(&self, entry: Arc<UploadEntry>) {
        if entry.in_flight.swap(true, Ordering::AcqRel) {
            // Another worker owns this entry and will requeue it if needed
            return;
        }

        let snapshot = entry.requests.load(Ordering::Acquire);
        let callbacks = std::mem::take(&mut *entry.callbacks.lock());
        let attempts = entry.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.uploads_started.fetch_add(1, Ordering::Relaxed);

        match self.upload(&entry) {
            Ok(bytes) => {
                self.stats.record_upload(bytes as u64);
                entry.attempts.store(0, Ordering::Release);
                entry.requests.fetch_sub(snapshot, Ordering::AcqRel);
                entry.in_flight.store(false, Ordering::Release);
                debug!(bytes, attempts, "upload complete");

                entry.fire(callbacks, true, attempts);
                self.settle(&entry);
            }
            Err(e) => {
                self.stats.upload_failures.fetch_add(1, Ordering::Relaxed);
                warn!(attempts, error = %e, "upload failed, will retry");
                {
                    // Keep original order: earlier requests first
                    let mut pending = entry.callbacks.lock();
                    let later = std::mem::replace(&mut *pending, callbacks);
                    pending.extend(later);
                }
                entry.in_flight.store(false, Ordering::Release);
                self.backoff();
                if !self.stopping.load(Ordering::Acquire) {
                    self.queue.add(entry);
                }
            }
        }
    }

    fn upload(&self, entry: &UploadEntry) -> Result<usize> {
        let source = Arc::clone(&*entry.source.lock());
        let bytes = source.read_for_upload(&entry.id)?;
        let len = bytes.len();
        let backend = self.backend_for(&entry.id);
        let key = entry.id.object_key();
        self.runtime.block_on(backend.put(&key, bytes))?;
        Ok(len)
    }

    /// Requeue if requests arrived during the upload, otherwise retire
    fn settle(&self, entry: &Arc<UploadEntry>) {
        if entry.requests.load(Ordering::Acquire) > 0 {
            self.queue.add(Arc::clone(entry));
            return;
        }
        self.pending.remove_if(&entry.id, |_, current| {
            Arc::ptr_eq(current, entry)
                && current.requests.load(Ordering::Acquire) == 0
                && !current.in_flight.load(Ordering::Acquire)
        });
    }

    fn backoff(&self) {
        let deadline = Instant::now() + self.config.retry_delay;
        while Instant::now() < deadline && !self.stopping.load(Ordering::Acquire) {
            thread::sleep(WORKER_POLL.min(self.config.retry_delay));
        }
    }

    // =========================================================================
    // Loads
    // =========================================================================

    fn run_blocking<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.runtime.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.recv()
            .map_err(|_| Error::Internal("durable-tier task dropped".into()))
    }

    /// Fetch the durable copy of `id`
    pub fn load(&self, id: &BlockId) -> Result<Option<Bytes>> {
        self.load_range_opt(id, None)
    }

    /// Fetch a byte range of the durable copy of `id`
    pub fn load_range(&self, id: &BlockId, range: Range<u64>) -> Result<Option<Bytes>> {
        self.load_range_opt(id, Some(range))
    }

    fn load_range_opt(&self, id: &BlockId, range: Option<Range<u64>>) -> Result<Option<Bytes>> {
        let backend = self.backend_for(id);
        let key = id.object_key();
        let result = self.run_blocking(async move { backend.get(&key, range).await })?;
        self.stats.record_load(&result);
        result
    }

    /// Check whether the durable tier holds `id`
    pub fn contains(&self, id: &BlockId) -> Result<bool> {
        let backend = self.backend_for(id);
        let key = id.object_key();
        self.run_blocking(async move { backend.exists(&key).await })?
    }

    /// Fetch several blocks concurrently
    pub fn bulk_load(&self, ids: &[BlockId]) -> Vec<Result<Option<Bytes>>> {
        let futures: Vec<_> = ids
            .iter()
            .map(|id| {
                let backend = self.backend_for(id);
                let key = id.object_key();
                async move { backend.get(&key, None).await }
            })
            .collect();

        match self.run_blocking(futures::future::join_all(futures)) {
            Ok(results) => {
                for result in &results {
                    self.stats.record_load(result);
                }
                results
            }
            Err(e) => ids
                .iter()
                .map(|_| Err(Error::Internal(e.to_string())))
                .collect(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Blocks with an upload not yet confirmed
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait until every accepted upload completed, up to `timeout`
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.pending.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Get store statistics
    pub fn stats(&self) -> GlobalStoreSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.pending = self.pending();
        snapshot
    }

    /// Backend statistics, one per connection
    pub fn backend_stats(&self) -> Vec<(String, BackendStats)> {
        self.backends
            .iter()
            .map(|b| (b.name().to_string(), b.stats()))
            .collect()
    }

    /// Drain pending uploads to completion and stop the workers
    ///
    /// Uploads that keep failing keep retrying; `shutdown_grace` only paces
    /// the progress reports.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Global store draining {} pending uploads", self.pending());

        while !self.wait_idle(self.config.shutdown_grace) {
            warn!(
                "Global store still draining {} pending uploads",
                self.pending()
            );
        }

        self.stopping.store(true, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("global store worker panicked");
            }
        }
        info!("Global store stopped");
    }
}
