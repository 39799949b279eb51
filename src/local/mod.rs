//! Local Store - Write-Back Tier
//!
//! Persists dirty cached blocks to files under the data directory, reloads
//! them on cache misses, and frees local space once their contents are
//! durable in the global store.
//!
//! # Architecture
//!
//! ```text
//!   cache release ──▶ store(block) ──▶ queue[shard_key % workers]
//!                                             │
//!                                             ▼
//!                                   local-store-{i} worker
//!                                     keyed lock(shard_key)
//!                                     snapshot dirty, write, fsync
//!                                     clear_dirty(snapshot)
//!                                         │ remainder > 0 ──▶ requeue
//!                                         ▼
//!                                     notify synced waiters
//!                                         │ full segment / metadata
//!                                         ▼
//!                                   GlobalStore::store ──ok──▶ tiered units
//!                                                                   │
//!   local-evictor (interval or kick) ◀── over high watermark ◀──────┘
//!     delete files that are uncached and fully tiered
//! ```
//!
//! Space is accounted in slots, one per local file, handed out by a
//! semaphore whose permits equal free slots. Every operation on one file
//! takes the keyed lock selected by its shard key.

mod handles;
mod index;
mod locks;

pub use handles::{FileHandles, HandleStats};
pub use index::{ExistenceIndex, JournalIndex, MemoryIndex};
pub use locks::KeyedLocks;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::block::{Block, BlockGeometry, BlockId, BlockKind};
use crate::error::{Error, Result};
use crate::global::{GlobalStore, UploadOutcome, UploadSource};
use crate::transfer::TransferQueue;

/// Poll interval of idle write-back workers
const WORKER_POLL: Duration = Duration::from_millis(50);

/// Keyed lock stripes
const LOCK_STRIPES: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the local store
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Data directory
    pub root: PathBuf,
    /// Write-back worker threads
    pub workers: usize,
    /// Maximum number of local files
    pub max_blocks: usize,
    /// Start evicting above this fraction of `max_blocks`
    pub high_watermark: f64,
    /// Evict down to this fraction of `max_blocks`
    pub low_watermark: f64,
    /// Background eviction interval
    pub evict_interval: Duration,
    /// Delay before retrying a failed flush
    pub retry_delay: Duration,
    /// Close file handles idle this long
    pub handle_idle_timeout: Duration,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/strata"),
            workers: 4,
            max_blocks: 30_000,
            high_watermark: 0.90,
            low_watermark: 0.80,
            evict_interval: Duration::from_secs(1),
            retry_delay: Duration::from_millis(100),
            handle_idle_timeout: Duration::from_secs(5),
        }
    }
}

impl LocalStoreConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("local store needs at least one worker".into()));
        }
        if self.max_blocks == 0 {
            return Err(Error::Config("local_max_blocks must be positive".into()));
        }
        if !(0.0 < self.low_watermark
            && self.low_watermark < self.high_watermark
            && self.high_watermark <= 1.0)
        {
            return Err(Error::Config(format!(
                "local watermarks must satisfy 0 < low < high <= 1 (low={}, high={})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }

    fn high_mark(&self) -> usize {
        (self.max_blocks as f64 * self.high_watermark) as usize
    }

    fn low_mark(&self) -> usize {
        (self.max_blocks as f64 * self.low_watermark) as usize
    }
}

// =============================================================================
// Per-file bookkeeping
// =============================================================================

#[derive(Debug)]
struct FileState {
    id: BlockId,
    /// Backing file exists and holds a slot
    resident: bool,
    /// Blocks of this file currently in the cache
    cached: u32,
    /// Units confirmed durable since the last local change
    tiered: HashSet<u32>,
    required: u32,
    /// Bumped by every metadata flush
    generation: u64,
    /// Generation the in-flight metadata upload read
    upload_generation: Option<u64>,
    /// Recovered segment file whose durability was never checked
    unverified: bool,
    last_touch: Instant,
}

impl FileState {
    fn new(id: BlockId, required: u32) -> Self {
        Self {
            id,
            resident: false,
            cached: 0,
            tiered: HashSet::new(),
            required,
            generation: 0,
            upload_generation: None,
            unverified: false,
            last_touch: Instant::now(),
        }
    }

    fn is_evictable(&self) -> bool {
        self.resident && self.cached == 0 && self.tiered.len() as u32 >= self.required
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the local store
#[derive(Debug, Default)]
pub struct LocalStoreStats {
    /// Files created
    pub files_created: AtomicU64,
    /// Blocks handed to workers
    pub enqueued: AtomicU64,
    /// Successful flushes
    pub flushes: AtomicU64,
    /// Bytes written by flushes
    pub bytes_flushed: AtomicU64,
    /// Failed flush attempts
    pub flush_failures: AtomicU64,
    /// Loads served from local files
    pub loads: AtomicU64,
    /// Loads that found no local file
    pub load_misses: AtomicU64,
    /// Durable uploads requested
    pub tier_requests: AtomicU64,
    /// Durable uploads confirmed
    pub tiered: AtomicU64,
    /// Files evicted
    pub evictions: AtomicU64,
    /// Slot requests that found the store full
    pub capacity_rejections: AtomicU64,
}

/// Point-in-time copy of [`LocalStoreStats`]
#[derive(Debug, Clone, Default)]
pub struct LocalStoreSnapshot {
    pub files_created: u64,
    pub enqueued: u64,
    pub flushes: u64,
    pub bytes_flushed: u64,
    pub flush_failures: u64,
    pub loads: u64,
    pub load_misses: u64,
    pub tier_requests: u64,
    pub tiered: u64,
    pub evictions: u64,
    pub capacity_rejections: u64,
    /// Files holding a slot
    pub resident: usize,
    /// Free slots
    pub available_slots: usize,
    /// Blocks waiting for a worker
    pub queue_depth: usize,
    pub handles: HandleStats,
}

// =============================================================================
// Local Store
// =============================================================================

/// Write-back local tier
pub struct LocalStore {
    config: LocalStoreConfig,
    geometry: BlockGeometry,
    global: Arc<GlobalStore>,
    index: Arc<dyn ExistenceIndex>,
    queues: Vec<TransferQueue<Block>>,
    locks: KeyedLocks,
    handles: FileHandles,
    slots: Semaphore,
    files: Mutex<HashMap<PathBuf, FileState>>,
    evict_kick: Sender<()>,
    evict_wake: Receiver<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    self_ref: Weak<LocalStore>,
    stats: LocalStoreStats,
}

impl LocalStore {
    /// Open the store, recover slot accounting and start the workers
    pub fn open(
        config: LocalStoreConfig,
        geometry: BlockGeometry,
        global: Arc<GlobalStore>,
        index: Arc<dyn ExistenceIndex>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(&config.root)?;

        let handles = FileHandles::new(config.handle_idle_timeout)?;
        let recovered = index.paths();
        let free = config.max_blocks.saturating_sub(recovered.len());
        let mut files = HashMap::with_capacity(recovered.len());
        for path in recovered {
            let Some(id) = BlockId::from_relative_path(&path) else {
                warn!(path = %path.display(), "ignoring unrecognized index entry");
                continue;
            };
            let mut state = FileState::new(id, geometry.units_per_file(id.kind()));
            state.resident = true;
            state.unverified = id.kind() == BlockKind::Segment;
            files.insert(path, state);
        }

        let (evict_kick, evict_wake) = channel::bounded(1);
        let store = Arc::new_cyclic(|weak| Self {
            queues: (0..config.workers).map(|_| TransferQueue::new()).collect(),
            config,
            geometry,
            global,
            index,
            locks: KeyedLocks::new(LOCK_STRIPES),
            handles,
            slots: Semaphore::new(free),
            files: Mutex::new(files),
            evict_kick,
            evict_wake,
            threads: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            self_ref: weak.clone(),
            stats: LocalStoreStats::default(),
        });

        {
            let mut threads = store.threads.lock();
            for i in 0..store.config.workers {
                let worker = Arc::clone(&store);
                threads.push(
                    thread::Builder::new()
                        .name(format!("local-store-{i}"))
                        .spawn(move || worker.run_worker(i))?,
                );
            }
            let evictor = Arc::clone(&store);
            threads.push(
                thread::Builder::new()
                    .name("local-evictor".into())
                    .spawn(move || evictor.run_evictor())?,
            );
        }

        store.retier_recovered_metadata();
        info!(
            "Opened local store at {} ({} resident, {} free slots, {} workers)",
            store.config.root.display(),
            store.resident_count(),
            store.available_slots(),
            store.config.workers
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    fn path_of(&self, rel: &Path) -> PathBuf {
        self.config.root.join(rel)
    }

    /// Whether a local file backs `id`
    pub fn exists(&self, id: &BlockId) -> bool {
        self.index.exists(&id.relative_path())
    }

    /// Files holding a slot
    pub fn resident_count(&self) -> usize {
        self.index.len()
    }

    /// Free slots
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    // =========================================================================
    // Slots and file creation
    // =========================================================================

    /// Make sure a local file exists for `id`, taking a slot if needed
    ///
    /// Fails with `OutOfCapacity` when no slot frees up even after a forced
    /// eviction pass.
    pub fn create_block(&self, id: &BlockId) -> Result<()> {
        let rel = id.relative_path();
        if self.index.exists(&rel) {
            self.touch(&rel, id);
            return Ok(());
        }
        self.reserve(id, &rel)
    }

    fn reserve(&self, id: &BlockId, rel: &Path) -> Result<()> {
        // Taken before the keyed lock: a forced eviction locks other files
        self.acquire_slot(id)?;

        let _guard = self.locks.lock(id.shard_key());
        if self.index.exists(rel) {
            self.slots.add_permits(1);
            self.touch(rel, id);
            return Ok(());
        }

        let path = self.path_of(rel);
        if let Err(e) = self.create_file(&path).and_then(|_| self.index.put(rel)) {
            self.slots.add_permits(1);
            return Err(e);
        }

        {
            let mut files = self.files.lock();
            let state = files
                .entry(rel.to_path_buf())
                .or_insert_with(|| FileState::new(id.with_segment(0), self.required_units(id)));
            state.resident = true;
            state.tiered.clear();
            state.last_touch = Instant::now();
        }
        self.stats.files_created.fetch_add(1, Ordering::Relaxed);
        debug!(block = %id, path = %path.display(), "created local file");
        Ok(())
    }

    fn create_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.handles.with_file(path, |_| Ok(()))?;
        Ok(())
    }

    fn acquire_slot(&self, id: &BlockId) -> Result<()> {
        if let Ok(permit) = self.slots.try_acquire() {
            permit.forget();
            return Ok(());
        }
        self.evict_pass(true);
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => {
                self.stats.capacity_rejections.fetch_add(1, Ordering::Relaxed);
                Err(Error::OutOfCapacity(format!(
                    "no local slot for {id} ({} files resident)",
                    self.resident_count()
                )))
            }
        }
    }

    fn required_units(&self, id: &BlockId) -> u32 {
        self.geometry.units_per_file(id.kind())
    }

    fn touch(&self, rel: &Path, id: &BlockId) {
        let mut files = self.files.lock();
        let state = files
            .entry(rel.to_path_buf())
            .or_insert_with(|| FileState::new(id.with_segment(0), self.required_units(id)));
        state.resident = true;
        state.last_touch = Instant::now();
    }

    // =========================================================================
    // Cache residency
    // =========================================================================

    /// Note that a block of this file entered the cache
    pub fn mark_cached(&self, id: &BlockId) {
        let rel = id.relative_path();
        let mut files = self.files.lock();
        let state = files
            .entry(rel)
            .or_insert_with(|| FileState::new(id.with_segment(0), self.required_units(id)));
        state.cached += 1;
        state.last_touch = Instant::now();
    }

    /// Note that a block of this file left the cache
    pub fn mark_uncached(&self, id: &BlockId) {
        let rel = id.relative_path();
        let mut files = self.files.lock();
        let remove = match files.get_mut(&rel) {
            Some(state) => {
                state.cached = state.cached.saturating_sub(1);
                !state.resident && state.cached == 0
            }
            None => false,
        };
        if remove {
            files.remove(&rel);
        }
    }

    /// Whether the file backing `id` could be deleted right now
    pub fn is_evictable(&self, id: &BlockId) -> bool {
        self.files
            .lock()
            .get(&id.relative_path())
            .is_some_and(FileState::is_evictable)
    }

    // =========================================================================
    // Write-back
    // =========================================================================

    /// Queue a dirty block for write-back; never blocks
    pub fn store(&self, block: &Arc<Block>) {
        if !self.running.load(Ordering::Acquire) {
            warn!(block = %block.id(), "store after local shutdown, flushing inline");
            if let Some(this) = self.self_ref.upgrade() {
                this.process(Arc::clone(block));
            }
            return;
        }
        let idx = block.id().shard_key() as usize % self.queues.len();
        if self.queues[idx].add(Arc::clone(block)) {
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn run_worker(self: Arc<Self>, index: usize) {
        debug!(worker = index, "local store worker started");
        let queue = &self.queues[index];
        while self.running.load(Ordering::Acquire) {
            if let Some(block) = queue.take_timeout(WORKER_POLL) {
                self.process(block);
            }
        }
        while let Some(block) = queue.poll() {
            self.process(block);
        }
        debug!(worker = index, "local store worker stopped");
    }

    #[instrument(skip(self, block), fields(block = %block.id()))]
    fn process(self: &Arc<Self>, block: Arc<Block>) {
        let snapshot = block.dirty_count();
        if snapshot > 0 {
            if let Err(e) = self.flush(&block) {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "local flush failed, will retry");
                if self.running.load(Ordering::Acquire) {
                    thread::sleep(self.config.retry_delay);
                    self.store(&block);
                } else {
                    // No worker left to retry; waiters must not hang
                    error!(error = %e, "dropping dirty block at shutdown");
                    block.clear_dirty(snapshot);
                    block.notify_synced();
                }
                return;
            }
        }

        if block.clear_dirty(snapshot) > 0 {
            self.store(&block);
            return;
        }
        block.notify_synced();

        if snapshot > 0 && block.claim_tiering() {
            self.tier(*block.id());
        }
    }

    /// Write the block's unflushed bytes and fsync
    fn flush(&self, block: &Block) -> Result<usize> {
        let id = block.id();
        let rel = id.relative_path();
        if !self.index.exists(&rel) {
            self.reserve(id, &rel)?;
        }

        let _guard = self.locks.lock(id.shard_key());
        let path = self.path_of(&rel);
        let segment_size = self.geometry.segment_size;
        let written = self.handles.with_file(&path, |file| {
            let n = block.store_to(file, segment_size)?;
            if n > 0 {
                file.sync_data()?;
            }
            Ok(n)
        })?;
        block.set_in_local_store(true);

        {
            let mut files = self.files.lock();
            if let Some(state) = files.get_mut(&rel) {
                state.last_touch = Instant::now();
                if !id.kind().is_append_only() {
                    // The durable copy is older than the image just written
                    state.generation += 1;
                    state.tiered.clear();
                }
            }
        }
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_flushed
            .fetch_add(written as u64, Ordering::Relaxed);
        debug!(bytes = written, "flushed to local file");
        Ok(written)
    }

    /// Request a durable upload of `id` read back from its local file
    fn tier(self: &Arc<Self>, id: BlockId) {
        let weak = Arc::downgrade(self);
        let source: Arc<dyn UploadSource> = Arc::clone(self) as Arc<dyn UploadSource>;
        self.stats.tier_requests.fetch_add(1, Ordering::Relaxed);
        let callback = Box::new(move |outcome: UploadOutcome| {
            if let Some(store) = weak.upgrade() {
                store.on_tiered(outcome);
            }
        });
        if let Err(e) = self.global.store(id, source, Some(callback)) {
            warn!(block = %id, error = %e, "durable upload not accepted");
        }
    }

    fn on_tiered(&self, outcome: UploadOutcome) {
        if !outcome.success {
            warn!(block = %outcome.id, attempts = outcome.attempts, "durable upload gave up");
            return;
        }
        self.stats.tiered.fetch_add(1, Ordering::Relaxed);

        let rel = outcome.id.relative_path();
        if let Some(state) = self.files.lock().get_mut(&rel) {
            match outcome.id.kind() {
                BlockKind::Segment => {
                    state.tiered.insert(outcome.id.key());
                }
                _ if state.upload_generation == Some(state.generation) => {
                    state.tiered.insert(0);
                }
                _ => {
                    // Rewritten after the upload read it; the newer image
                    // has its own upload queued
                    debug!(block = %outcome.id, "stale metadata upload, not tiered");
                }
            }
        }
        if self.resident_count() > self.config.high_mark() {
            let _ = self.evict_kick.try_send(());
        }
    }

    /// Recovered metadata may never have reached the durable tier
    fn retier_recovered_metadata(self: &Arc<Self>) {
        let ids: Vec<BlockId> = self
            .files
            .lock()
            .values()
            .filter(|s| !s.id.kind().is_append_only())
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.tier(id);
        }
    }

    // =========================================================================
    // Loads
    // =========================================================================

    /// Fill `block` from its local file; returns false if there is none
    pub fn load(&self, block: &Block) -> Result<bool> {
        let id = block.id();
        let rel = id.relative_path();
        if !self.index.exists(&rel) {
            self.stats.load_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let _guard = self.locks.lock(id.shard_key());
        let bytes = match self.read_unit(id, &rel) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(block = %id, "indexed file missing, dropping index entry");
                self.forget_file(&rel)?;
                self.stats.load_misses.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        block.fill_local(&bytes);
        block.set_in_local_store(true);
        self.touch(&rel, id);
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        debug!(block = %id, bytes = bytes.len(), "loaded from local file");
        drop(_guard);

        if block.is_full() && !self.unit_tiered(&rel, id.key()) && block.claim_tiering() {
            if let Some(this) = self.self_ref.upgrade() {
                debug!(block = %id, "full local segment not yet durable, tiering");
                this.tier(*id);
            }
        }
        Ok(true)
    }

    fn unit_tiered(&self, rel: &Path, unit: u32) -> bool {
        self.files
            .lock()
            .get(rel)
            .is_some_and(|state| state.tiered.contains(&unit))
    }

    /// Read the bytes of one unit; callers hold the keyed lock
    fn read_unit(&self, id: &BlockId, rel: &Path) -> io::Result<Vec<u8>> {
        let path = self.path_of(rel);
        let file = File::open(&path)?;
        match id.kind() {
            BlockKind::Segment => {
                let segment_size = self.geometry.segment_size;
                read_range(&file, id.file_offset(segment_size), segment_size as u64)
            }
            _ => read_range(&file, 0, u64::MAX),
        }
    }

    fn forget_file(&self, rel: &Path) -> Result<()> {
        if self.index.remove(rel)? {
            self.slots.add_permits(1);
        }
        let mut files = self.files.lock();
        let remove = match files.get_mut(rel) {
            Some(state) => {
                state.resident = false;
                state.tiered.clear();
                state.cached == 0
            }
            None => false,
        };
        if remove {
            files.remove(rel);
        }
        Ok(())
    }

    // =========================================================================
    // Local eviction
    // =========================================================================

    fn run_evictor(self: Arc<Self>) {
        debug!("local evictor started");
        self.verify_recovered(usize::MAX);
        while self.running.load(Ordering::Acquire) {
            match self.evict_wake.recv_timeout(self.config.evict_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.running.load(Ordering::Acquire) {
                self.evict_pass(false);
            }
        }
        debug!("local evictor stopped");
    }

    /// Delete uncached, fully tiered files; returns how many were removed
    ///
    /// Runs only above the high watermark and stops at the low one, unless
    /// `force` asks for at least one file regardless.
    pub fn evict_pass(&self, force: bool) -> usize {
        let resident = self.resident_count();
        if !force && resident <= self.config.high_mark() {
            return 0;
        }
        let want = resident.saturating_sub(self.config.low_mark()).max(usize::from(force));
        if want == 0 {
            return 0;
        }

        let mut candidates = self.candidates(want);
        if candidates.len() < want {
            self.verify_recovered(want - candidates.len());
            candidates = self.candidates(want);
        }

        let mut evicted = 0;
        for (rel, id) in candidates {
            match self.evict_file(&rel, &id) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %rel.display(), error = %e, "local eviction failed"),
            }
        }
        if evicted > 0 {
            info!(
                "Evicted {} local files ({} resident)",
                evicted,
                self.resident_count()
            );
        }
        evicted
    }

    /// Least recently touched evictable files
    fn candidates(&self, want: usize) -> Vec<(PathBuf, BlockId)> {
        let files = self.files.lock();
        let mut found: Vec<(&PathBuf, &FileState)> =
            files.iter().filter(|(_, s)| s.is_evictable()).collect();
        found.sort_by_key(|(_, s)| s.last_touch);
        found
            .into_iter()
            .take(want)
            .map(|(rel, s)| (rel.clone(), s.id))
            .collect()
    }

    /// Reconcile recovered segment files with the durable tier
    ///
    /// Durable segments count as tiered. A full segment the durable tier
    /// lacks lost its upload to a crash and is uploaded again.
    fn verify_recovered(&self, limit: usize) {
        let pending: Vec<(PathBuf, BlockId)> = {
            let files = self.files.lock();
            files
                .iter()
                .filter(|(_, s)| s.unverified && s.resident)
                .take(limit)
                .map(|(rel, s)| (rel.clone(), s.id))
                .collect()
        };
        if pending.is_empty() {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        for (rel, id) in pending {
            let mut durable = HashSet::new();
            let mut missing = Vec::new();
            let mut checked = true;
            for segment in 0..self.geometry.segments_per_block {
                let unit = id.with_segment(segment);
                match self.global.contains(&unit) {
                    Ok(true) => {
                        durable.insert(segment);
                    }
                    Ok(false) if self.unit_is_full(&unit, &rel) => missing.push(unit),
                    // Later segments start only after this one filled
                    Ok(false) => break,
                    Err(e) => {
                        warn!(block = %unit, error = %e, "durable existence check failed");
                        checked = false;
                        break;
                    }
                }
            }

            if let Some(state) = self.files.lock().get_mut(&rel) {
                state.unverified = !checked;
                state.tiered.extend(durable);
            }
            for unit in missing {
                info!("Recovered segment {} is not durable, uploading", unit);
                this.tier(unit);
            }
        }
    }

    fn unit_is_full(&self, unit: &BlockId, rel: &Path) -> bool {
        let _guard = self.locks.lock(unit.shard_key());
        match self.read_unit(unit, rel) {
            Ok(bytes) => bytes.len() == self.geometry.segment_size,
            Err(e) => {
                warn!(block = %unit, error = %e, "could not read recovered segment");
                false
            }
        }
    }

    fn evict_file(&self, rel: &Path, id: &BlockId) -> Result<bool> {
        let _guard = self.locks.lock(id.shard_key());
        {
            let mut files = self.files.lock();
            // Re-check: the file may have been cached or rewritten meanwhile
            if !files.get(rel).is_some_and(FileState::is_evictable) {
                return Ok(false);
            }
            files.remove(rel);
            self.index.remove(rel)?;
        }

        let path = self.path_of(rel);
        self.handles.close(&path);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not delete evicted file"),
        }
        self.slots.add_permits(1);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(block = %id, "evicted local file");
        Ok(true)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Get store statistics
    pub fn stats(&self) -> LocalStoreSnapshot {
        let s = &self.stats;
        LocalStoreSnapshot {
            files_created: s.files_created.load(Ordering::Relaxed),
            enqueued: s.enqueued.load(Ordering::Relaxed),
            flushes: s.flushes.load(Ordering::Relaxed),
            bytes_flushed: s.bytes_flushed.load(Ordering::Relaxed),
            flush_failures: s.flush_failures.load(Ordering::Relaxed),
            loads: s.loads.load(Ordering::Relaxed),
            load_misses: s.load_misses.load(Ordering::Relaxed),
            tier_requests: s.tier_requests.load(Ordering::Relaxed),
            tiered: s.tiered.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
            capacity_rejections: s.capacity_rejections.load(Ordering::Relaxed),
            resident: self.resident_count(),
            available_slots: self.available_slots(),
            queue_depth: self.queues.iter().map(TransferQueue::len).sum(),
            handles: self.handles.stats(),
        }
    }

    /// Drain the worker queues and stop all threads
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Local store draining {} queued blocks", self.stats().queue_depth);
        let _ = self.evict_kick.try_send(());

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                error!("local store thread panicked");
            }
        }
        self.handles.shutdown();
        info!("Local store stopped");
    }
}

impl UploadSource for LocalStore {
    fn read_for_upload(&self, id: &BlockId) -> Result<Bytes> {
        let rel = id.relative_path();
        let _guard = self.locks.lock(id.shard_key());
        let bytes = self.read_unit(id, &rel).map_err(|e| {
            Error::backend(id.object_key(), format!("local read for upload: {e}"))
        })?;
        if !id.kind().is_append_only() {
            if let Some(state) = self.files.lock().get_mut(&rel) {
                state.upload_generation = Some(state.generation);
            }
        }
        Ok(Bytes::from(bytes))
    }
}

/// Read up to `max` bytes at `offset`, stopping at end of file
fn read_range(file: &File, offset: u64, max: u64) -> io::Result<Vec<u8>> {
    let len = file.metadata()?.len();
    if offset >= len {
        return Ok(Vec::new());
    }
    let n = (len - offset).min(max) as usize;
    let mut buf = vec![0u8; n];
    let mut handle = file;
    handle.seek(SeekFrom::Start(offset))?;
    handle.read_exact(&mut buf)?;
    Ok(buf)
}
