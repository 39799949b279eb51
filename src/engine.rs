//! Storage Engine
//!
//! Wires the tiers of one node together and owns their shutdown order.
//!
//! ```text
//!            append ──▶ WriteCoalescer ─┐
//!                                       ▼
//!   acquire/release ──────────────▶ BlockCache ──▶ LocalStore ──▶ GlobalStore
//!                                       │              ▲               │
//!                                       └── loads ─────┴───────────────┘
//!                                       └── PrimaryPeer (non-primary blocks)
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::block::{BlockId, PoolStats};
use crate::cache::{BlockCache, CacheSnapshot};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::global::{GlobalStore, GlobalStoreSnapshot, LocalDirBackend, ObjectBackend};
use crate::local::{ExistenceIndex, JournalIndex, LocalStore, LocalStoreSnapshot};
use crate::peer::PrimaryPeer;
use crate::timer::{CoalescerStats, WriteCoalescer};

/// Name of the existence journal inside the data directory
pub const INDEX_FILE: &str = "index.jsonl";

/// Statistics of every component
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub cache: CacheSnapshot,
    pub pool: PoolStats,
    pub local: LocalStoreSnapshot,
    pub global: GlobalStoreSnapshot,
    pub coalescer: CoalescerStats,
}

/// One node's block storage engine
pub struct StorageEngine {
    config: EngineConfig,
    global: Arc<GlobalStore>,
    local: Arc<LocalStore>,
    cache: Arc<BlockCache>,
    coalescer: WriteCoalescer,
    stopped: AtomicBool,
}

impl StorageEngine {
    /// Open an engine with the persistent journal index in `data_dir`
    pub fn open(
        config: EngineConfig,
        backends: Vec<Arc<dyn ObjectBackend>>,
        peer: Option<Arc<dyn PrimaryPeer>>,
    ) -> Result<Self> {
        let index = Arc::new(JournalIndex::open(config.data_dir.join(INDEX_FILE))?);
        Self::open_with_index(config, backends, peer, index)
    }

    /// Open an engine over a caller-supplied existence index
    pub fn open_with_index(
        config: EngineConfig,
        backends: Vec<Arc<dyn ObjectBackend>>,
        peer: Option<Arc<dyn PrimaryPeer>>,
        index: Arc<dyn ExistenceIndex>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Opening storage engine (node {} of {}, data dir {})",
            config.node_id,
            config.node_count,
            config.data_dir.display()
        );

        let global = GlobalStore::new(config.global_config(), backends)?;
        let local = LocalStore::open(
            config.local_config(),
            config.geometry(),
            Arc::clone(&global),
            index,
        )?;
        let cache = BlockCache::new(
            config.cache_config(),
            config.topology(),
            config.geometry(),
            Arc::clone(&local),
            Arc::clone(&global),
            peer,
        )?;
        let coalescer = WriteCoalescer::new(Arc::clone(&cache), config.coalesce_timeout())?;

        Ok(Self {
            config,
            global,
            local,
            cache,
            coalescer,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn global(&self) -> &Arc<GlobalStore> {
        &self.global
    }

    pub fn coalescer(&self) -> &WriteCoalescer {
        &self.coalescer
    }

    /// Append through the coalescer
    pub fn append(&self, id: &BlockId, offset: usize, data: &[u8]) -> Result<usize> {
        self.coalescer.append(id, offset, data)
    }

    /// Read committed bytes of `id` at `offset`
    pub fn read(&self, id: &BlockId, offset: usize, dst: &mut [u8]) -> Result<usize> {
        let block = self.cache.acquire(id)?;
        let result = block.read(offset, dst);
        self.cache.release(id)?;
        result
    }

    /// Get statistics of every component
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.stats(),
            pool: self.cache.pool_stats(),
            local: self.local.stats(),
            global: self.global.stats(),
            coalescer: self.coalescer.stats(),
        }
    }

    /// Drain every tier in dependency order
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down storage engine");
        self.coalescer.shutdown();
        self.cache.flush();
        self.local.shutdown();
        self.global.shutdown();
        info!("Storage engine stopped");
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Directory-backed durable tier connections under `root`
pub fn directory_backends(root: &Path, count: usize) -> Vec<Arc<dyn ObjectBackend>> {
    (0..count.max(1))
        .map(|i| {
            let name = format!("dir-{i}");
            Arc::new(LocalDirBackend::new(name.clone(), root.join(name))) as Arc<dyn ObjectBackend>
        })
        .collect()
}
