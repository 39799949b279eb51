//! Block Cache - Reference-Counted In-Memory Tier
//!
//! Every block a node works on lives here while in use. Holders pin blocks
//! with [`BlockCache::acquire`] and unpin them with [`BlockCache::release`];
//! releasing a dirty primary block hands it to the local store.
//!
//! # Eviction
//!
//! ```text
//!   occupancy ≥ high watermark ──▶ evict up to `eviction_batch` clean,
//!                                  unreferenced entries in LRU order,
//!                                  stopping at the low watermark
//!
//!   full, nothing clean ──▶ wait on the oldest unreferenced dirty block's
//!                           sync signal (bounded), then retry
//! ```
//!
//! A block is evicted only when nobody references it and its dirty counter
//! is zero with no flush queued, so no mutation is ever dropped.

mod item;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use self::item::CacheState;
use crate::block::{
    Block, BlockBody, BlockGeometry, BlockId, ClusterTopology, Freshness, PoolStats,
    SegmentPool, Tiers,
};
use crate::error::{Error, Result};
use crate::global::GlobalStore;
use crate::local::LocalStore;
use crate::peer::PrimaryPeer;
use crate::transfer::Transferable;

/// Sync waits a full cache makes before giving up on an admission
const MAX_SYNC_WAITS: u32 = 3;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the block cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached blocks
    pub capacity: usize,
    /// Start evicting at this fraction of capacity
    pub high_watermark: f64,
    /// Evict down to this fraction of capacity
    pub low_watermark: f64,
    /// Maximum evictions per pass
    pub eviction_batch: usize,
    /// How long a full cache waits for a dirty block to flush
    pub sync_wait: Duration,
    /// Freshness of replica segments
    pub segment_freshness: Duration,
    /// Freshness of replica metadata
    pub metadata_freshness: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let freshness = Freshness::default();
        Self {
            capacity: 256,
            high_watermark: 0.95,
            low_watermark: 0.90,
            eviction_batch: 20,
            sync_wait: Duration::from_secs(5),
            segment_freshness: freshness.segment,
            metadata_freshness: freshness.metadata,
        }
    }
}

impl CacheConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("cache capacity must be at least one block".into()));
        }
        if self.eviction_batch == 0 {
            return Err(Error::Config("cache_eviction_batch must be positive".into()));
        }
        if !(0.0 < self.low_watermark
            && self.low_watermark < self.high_watermark
            && self.high_watermark <= 1.0)
        {
            return Err(Error::Config(format!(
                "cache watermarks must satisfy 0 < low < high <= 1 (low={}, high={})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }

    pub fn freshness(&self) -> Freshness {
        Freshness {
            segment: self.segment_freshness,
            metadata: self.metadata_freshness,
        }
    }

    fn high_mark(&self) -> usize {
        ((self.capacity as f64 * self.high_watermark) as usize).max(1)
    }

    fn low_mark(&self) -> usize {
        (self.capacity as f64 * self.low_watermark) as usize
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct CacheCounters {
    accesses: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sync_waits: AtomicU64,
    load_failures: AtomicU64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub accesses: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Admissions that had to wait for a dirty block to flush
    pub sync_waits: u64,
    pub load_failures: u64,
    pub entries: usize,
    pub referenced: usize,
    pub capacity: usize,
}

impl CacheSnapshot {
    /// Fraction of accesses served without creating an entry
    pub fn hit_ratio(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        (self.accesses - self.misses.min(self.accesses)) as f64 / self.accesses as f64
    }
}

// =============================================================================
// Block Cache
// =============================================================================

/// Reference-counted cache of blocks
pub struct BlockCache {
    config: CacheConfig,
    topology: ClusterTopology,
    geometry: BlockGeometry,
    tiers: Tiers,
    pool: SegmentPool,
    state: Mutex<CacheState>,
    counters: CacheCounters,
}

impl BlockCache {
    /// Create a cache loading through `local`, `global` and `peer`
    pub fn new(
        config: CacheConfig,
        topology: ClusterTopology,
        geometry: BlockGeometry,
        local: Arc<LocalStore>,
        global: Arc<GlobalStore>,
        peer: Option<Arc<dyn PrimaryPeer>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let tiers = Tiers {
            local,
            global,
            peer,
            freshness: config.freshness(),
        };
        info!(
            "Created block cache ({} blocks, node {} of {})",
            config.capacity,
            topology.node_id(),
            topology.node_count()
        );
        Ok(Arc::new(Self {
            pool: SegmentPool::new(geometry.segment_size, config.capacity),
            config,
            topology,
            geometry,
            tiers,
            state: Mutex::new(CacheState::default()),
            counters: CacheCounters::default(),
        }))
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether this node may mutate `id`
    pub fn is_primary(&self, id: &BlockId) -> bool {
        self.topology.is_primary(id)
    }

    // =========================================================================
    // Acquire / release
    // =========================================================================

    /// Pin `id`, loading it on first access
    ///
    /// Equal ids always return the same `Arc` while the entry is cached.
    #[instrument(skip(self), fields(block = %id))]
    pub fn acquire(&self, id: &BlockId) -> Result<Arc<Block>> {
        let block = self.admit(id)?;
        if let Err(e) = block.ensure_loaded(&self.tiers) {
            self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
            self.abandon(id, &block);
            return Err(e);
        }
        Ok(block)
    }

    /// Pin `id` as a new block written by this node
    #[instrument(skip(self), fields(block = %id))]
    pub fn create(&self, id: &BlockId) -> Result<Arc<Block>> {
        if !self.is_primary(id) {
            return Err(Error::ProtocolViolation(format!(
                "create of {id} on node {}, primary is {}",
                self.topology.node_id(),
                self.topology.primary_of(id)
            )));
        }
        let block = self.admit(id)?;
        if let Err(e) = block.ensure_created(&self.tiers) {
            self.abandon(id, &block);
            return Err(e);
        }
        Ok(block)
    }

    /// Unpin `id`; a dirty primary block is queued for write-back
    pub fn release(&self, id: &BlockId) -> Result<()> {
        let block = {
            let mut state = self.state.lock();
            let item = state.touch(id).ok_or_else(|| {
                Error::ProtocolViolation(format!("release of uncached block {id}"))
            })?;
            if item.refs == 0 {
                return Err(Error::ProtocolViolation(format!(
                    "release of unreferenced block {id}"
                )));
            }
            item.refs -= 1;
            Arc::clone(&item.block)
        };

        if block.is_primary() && block.is_dirty() {
            self.tiers.local.store(&block);
        }
        Ok(())
    }

    /// Current reference count of `id`, zero if not cached
    pub fn ref_count(&self, id: &BlockId) -> u32 {
        self.state.lock().entries.get(id).map_or(0, |item| item.refs)
    }

    /// Find or create the entry for `id` and take a reference
    fn admit(&self, id: &BlockId) -> Result<Arc<Block>> {
        self.counters.accesses.fetch_add(1, Ordering::Relaxed);
        let mut waits = 0;
        loop {
            let mut state = self.state.lock();
            if let Some(item) = state.touch(id) {
                item.refs += 1;
                return Ok(Arc::clone(&item.block));
            }

            if state.entries.len() >= self.config.high_mark() {
                self.evict_batch(&mut state);
            }

            if state.entries.len() < self.config.capacity {
                let body = BlockBody::for_kind(id, &self.geometry, &self.pool)?;
                let block = Arc::new(Block::new(*id, self.is_primary(id), body));
                state.insert(*id, Arc::clone(&block));
                drop(state);

                self.tiers.local.mark_cached(id);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(block);
            }

            // Full of referenced or dirty blocks
            let victim = state.oldest_dirty();
            drop(state);
            let Some(victim) = victim.filter(|_| waits < MAX_SYNC_WAITS) else {
                return Err(Error::OutOfCapacity(format!(
                    "cache full ({} blocks) admitting {id}",
                    self.config.capacity
                )));
            };
            waits += 1;
            self.counters.sync_waits.fetch_add(1, Ordering::Relaxed);
            debug!(victim = %victim.id(), "cache full, waiting for flush");
            if victim.is_dirty() && !victim.is_queued() {
                self.tiers.local.store(&victim);
            }
            victim.wait_until_synced_timeout(self.config.sync_wait);
        }
    }

    /// Drop our reference after a failed load, removing a dead entry
    fn abandon(&self, id: &BlockId, block: &Arc<Block>) {
        let mut state = self.state.lock();
        let remove = match state.entries.get_mut(id) {
            Some(item) if Arc::ptr_eq(&item.block, block) => {
                item.refs = item.refs.saturating_sub(1);
                item.refs == 0 && !block.is_loaded()
            }
            _ => false,
        };
        if remove {
            state.remove(id);
            drop(state);
            block.recycle(&self.pool);
            self.tiers.local.mark_uncached(id);
        }
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evict clean entries down to the low watermark, one batch at most
    fn evict_batch(&self, state: &mut CacheState) -> usize {
        let excess = state.entries.len().saturating_sub(self.config.low_mark());
        let victims = state.clean_victims(excess.min(self.config.eviction_batch));
        let mut evicted = 0;
        for id in victims {
            if let Some(item) = state.remove(&id) {
                self.evict_block(&item.block);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = state.entries.len(), "cache eviction pass");
        }
        evicted
    }

    fn evict_block(&self, block: &Block) {
        block.wait_until_synced();
        block.recycle(&self.pool);
        self.tiers.local.mark_uncached(block.id());
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Peer and lifecycle
    // =========================================================================

    /// Valid bytes of `id`, for a replica asking this primary
    pub fn serve(&self, id: &BlockId) -> Result<Bytes> {
        if !self.is_primary(id) {
            return Err(Error::Peer(format!(
                "node {} is not the primary of {id}",
                self.topology.node_id()
            )));
        }
        let block = self.acquire(id)?;
        let bytes = block.snapshot();
        self.release(id)?;
        Ok(bytes)
    }

    /// Write back every dirty block and empty the cache
    ///
    /// Referenced entries are kept.
    pub fn flush(&self) {
        let blocks: Vec<Arc<Block>> = self
            .state
            .lock()
            .entries
            .values()
            .map(|item| Arc::clone(&item.block))
            .collect();
        info!("Flushing {} cached blocks", blocks.len());

        for block in &blocks {
            if block.is_primary() && block.is_dirty() {
                self.tiers.local.store(block);
            }
        }
        for block in &blocks {
            while !block.wait_until_synced_timeout(self.config.sync_wait) {
                warn!(block = %block.id(), "still waiting for flush");
            }
        }

        let mut state = self.state.lock();
        let ids: Vec<BlockId> = state
            .entries
            .iter()
            .filter(|(_, item)| item.is_evictable())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(item) = state.remove(&id) {
                self.evict_block(&item.block);
            }
        }
        if !state.entries.is_empty() {
            warn!("{} blocks still referenced after flush", state.entries.len());
        }
    }

    /// Whether `id` has an entry
    pub fn contains(&self, id: &BlockId) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheSnapshot {
        let state = self.state.lock();
        CacheSnapshot {
            accesses: self.counters.accesses.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            sync_waits: self.counters.sync_waits.load(Ordering::Relaxed),
            load_failures: self.counters.load_failures.load(Ordering::Relaxed),
            entries: state.entries.len(),
            referenced: state.referenced(),
            capacity: self.config.capacity,
        }
    }

    /// Segment buffer pool statistics
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::{GlobalStoreConfig, InMemoryBackend, ObjectBackend};
    use crate::local::{LocalStoreConfig, MemoryIndex};
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    struct Fixture {
        root: PathBuf,
        global: Arc<GlobalStore>,
        local: Arc<LocalStore>,
        cache: Arc<BlockCache>,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            let root = std::env::temp_dir().join(format!("strata-cache-{}", uuid::Uuid::new_v4()));
            let geometry = BlockGeometry {
                segment_size: 16,
                segments_per_block: 4,
                bitmap_size: 8,
            };
            let backend: Arc<dyn ObjectBackend> = Arc::new(InMemoryBackend::default());
            let global = GlobalStore::new(
                GlobalStoreConfig {
                    workers: 1,
                    retry_delay: Duration::from_millis(10),
                    shutdown_grace: Duration::from_secs(5),
                },
                vec![backend],
            )
            .unwrap();
            let local = LocalStore::open(
                LocalStoreConfig {
                    root: root.clone(),
                    workers: 2,
                    max_blocks: 100,
                    ..Default::default()
                },
                geometry,
                Arc::clone(&global),
                Arc::new(MemoryIndex::new()),
            )
            .unwrap();
            let cache = BlockCache::new(
                CacheConfig {
                    capacity,
                    sync_wait: Duration::from_millis(500),
                    ..Default::default()
                },
                ClusterTopology::single(),
                geometry,
                Arc::clone(&local),
                Arc::clone(&global),
                None,
            )
            .unwrap();
            Self {
                root,
                global,
                local,
                cache,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cache.flush();
            self.local.shutdown();
            self.global.shutdown();
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn test_acquire_missing_is_not_found() {
        let fx = Fixture::new(8);
        let id = BlockId::segment(1, 1, 0);
        assert_matches!(fx.cache.acquire(&id), Err(Error::NotFound { .. }));
        // The half-built entry is gone and its buffer returned
        assert!(!fx.cache.contains(&id));
        assert_eq!(fx.cache.pool_stats().free, fx.cache.pool_stats().allocated);
    }

    #[test]
    fn test_refcount_and_release_errors() {
        let fx = Fixture::new(8);
        let id = BlockId::metadata(2);
        let a = fx.cache.create(&id).unwrap();
        let b = fx.cache.acquire(&id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fx.cache.ref_count(&id), 2);

        fx.cache.release(&id).unwrap();
        fx.cache.release(&id).unwrap();
        assert_eq!(fx.cache.ref_count(&id), 0);
        assert_matches!(fx.cache.release(&id), Err(Error::ProtocolViolation(_)));
        assert_matches!(
            fx.cache.release(&BlockId::metadata(99)),
            Err(Error::ProtocolViolation(_))
        );
    }

    #[test]
    fn test_release_flushes_dirty() {
        let fx = Fixture::new(8);
        let id = BlockId::segment(0, 3, 0);
        let block = fx.cache.create(&id).unwrap();
        block.append(0, b"payload").unwrap();
        fx.cache.release(&id).unwrap();
        assert!(block.wait_until_synced_timeout(Duration::from_secs(5)));
        assert!(fx.local.exists(&id));
    }

    #[test]
    fn test_eviction_keeps_referenced() {
        let fx = Fixture::new(4);
        let held = BlockId::metadata(0);
        fx.cache.create(&held).unwrap();

        for n in 1..20 {
            let id = BlockId::metadata(n);
            fx.cache.create(&id).unwrap();
            fx.cache.release(&id).unwrap();
            assert!(fx.cache.len() <= 4);
        }
        assert!(fx.cache.contains(&held));
        assert_eq!(fx.cache.ref_count(&held), 1);
        assert!(fx.cache.stats().evictions > 0);
        fx.cache.release(&held).unwrap();
    }

    #[test]
    fn test_full_of_referenced_is_out_of_capacity() {
        let fx = Fixture::new(2);
        fx.cache.create(&BlockId::metadata(1)).unwrap();
        fx.cache.create(&BlockId::metadata(2)).unwrap();
        assert_matches!(
            fx.cache.create(&BlockId::metadata(3)),
            Err(Error::OutOfCapacity(_))
        );
        fx.cache.release(&BlockId::metadata(1)).unwrap();
        fx.cache.release(&BlockId::metadata(2)).unwrap();
    }

    #[test]
    fn test_create_on_replica_rejected() {
        let fx = Fixture::new(2);
        let replica = BlockCache::new(
            CacheConfig::default(),
            ClusterTopology::new(1, 2),
            BlockGeometry::default(),
            Arc::clone(&fx.local),
            Arc::clone(&fx.global),
            None,
        )
        .unwrap();
        // File 0 belongs to node 0
        assert_matches!(
            replica.create(&BlockId::segment(0, 0, 0)),
            Err(Error::ProtocolViolation(_))
        );
    }

    #[test]
    fn test_hit_ratio() {
        let snapshot = CacheSnapshot {
            accesses: 4,
            misses: 1,
            ..Default::default()
        };
        assert!((snapshot.hit_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheSnapshot::default().hit_ratio(), 0.0);
    }
}
