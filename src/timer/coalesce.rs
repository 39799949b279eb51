//! Write Coalescer
//!
//! Small appends arriving close together would otherwise pay a cache
//! acquire, a release and a local flush each. The coalescer keeps the
//! segment acquired and armed between appends; only when no append arrived
//! for `timeout` does the sweeper release it, which is what enqueues the
//! flush.
//!
//! ```text
//!   append ──▶ armed[id]? ──disable ok──▶ reuse held block
//!                 │ no / expired
//!                 ▼
//!           cache.acquire()           (one release/reacquire cycle)
//!                 │
//!                 ▼
//!            block.append() ──full or error──▶ release now
//!                 │
//!                 ▼
//!         schedule(now + timeout) ──expired──▶ cache.release()
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{DeferredWork, TimerItem, TimerQueue};
use crate::block::{Block, BlockId};
use crate::cache::BlockCache;
use crate::error::Result;

type ArmedSegment = TimerItem<Arc<Block>>;

/// Coalescer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Appends served
    pub appends: u64,
    /// Cache acquires, one per release/reacquire cycle
    pub cycles: u64,
    /// Releases by the sweeper after the idle timeout
    pub timed_releases: u64,
    /// Releases right after an append (segment full or append failed)
    pub early_releases: u64,
    /// Segments currently held
    pub armed: usize,
}

struct Armed {
    cache: Arc<BlockCache>,
    held: Mutex<HashMap<BlockId, Arc<ArmedSegment>>>,
    appends: AtomicU64,
    cycles: AtomicU64,
    timed_releases: AtomicU64,
    early_releases: AtomicU64,
}

impl Armed {
    /// Forget `item` if it is still the one held for `id`
    fn forget(&self, id: &BlockId, item: &Arc<ArmedSegment>) {
        let mut held = self.held.lock();
        if held.get(id).is_some_and(|current| Arc::ptr_eq(current, item)) {
            held.remove(id);
        }
    }

    fn release(&self, id: &BlockId) {
        if let Err(e) = self.cache.release(id) {
            error!(block = %id, error = %e, "coalescer release failed");
        }
    }
}

impl DeferredWork<Arc<Block>> for Armed {
    fn deferred_work(&self, item: &Arc<ArmedSegment>, block: Arc<Block>) {
        let id = *block.id();
        self.forget(&id, item);
        self.timed_releases.fetch_add(1, Ordering::Relaxed);
        debug!(block = %id, "idle segment released");
        self.release(&id);
    }
}

/// Batches appends to a segment into one acquire/release cycle
pub struct WriteCoalescer {
    armed: Arc<Armed>,
    timers: TimerQueue<Arc<Block>>,
    timeout: Duration,
}

impl WriteCoalescer {
    /// Start a coalescer releasing idle segments after `timeout`
    pub fn new(cache: Arc<BlockCache>, timeout: Duration) -> Result<Self> {
        let armed = Arc::new(Armed {
            cache,
            held: Mutex::new(HashMap::new()),
            appends: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            timed_releases: AtomicU64::new(0),
            early_releases: AtomicU64::new(0),
        });
        let weak: Weak<Armed> = Arc::downgrade(&armed);
        let timers = TimerQueue::<Arc<Block>>::start("coalesce", weak)?;
        info!("Started write coalescer (timeout {:?})", timeout);
        Ok(Self {
            armed,
            timers,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Append `data` at `offset` of segment `id`
    ///
    /// An append at offset 0 may start a new segment; later offsets require
    /// the segment to exist.
    pub fn append(&self, id: &BlockId, offset: usize, data: &[u8]) -> Result<usize> {
        let (item, block) = self.hold(id, offset)?;
        self.armed.appends.fetch_add(1, Ordering::Relaxed);

        let result = block.append(offset, data);
        if result.is_err() || block.is_full() {
            self.armed.forget(id, &item);
            self.armed.early_releases.fetch_add(1, Ordering::Relaxed);
            self.armed.release(id);
        } else if !self.timers.schedule(&item, self.timeout) {
            // Only the owner arms, so an expired item here means a bug
            error!(block = %id, "held segment expired while disabled");
        }
        result
    }

    /// Reuse the armed segment or acquire a fresh one
    fn hold(&self, id: &BlockId, offset: usize) -> Result<(Arc<ArmedSegment>, Arc<Block>)> {
        let existing = self.armed.held.lock().get(id).cloned();
        if let Some(item) = existing {
            if item.timer().disable_if_not_expired() {
                if let Some(block) = item.payload() {
                    return Ok((item, block));
                }
            }
        }

        let block = if offset == 0 {
            self.armed.cache.create(id)?
        } else {
            self.armed.cache.acquire(id)?
        };
        self.armed.cycles.fetch_add(1, Ordering::Relaxed);
        let item = TimerItem::new(Arc::clone(&block));
        self.armed.held.lock().insert(*id, Arc::clone(&item));
        Ok((item, block))
    }

    /// Release every held segment now
    pub fn flush(&self) {
        let held: Vec<(BlockId, Arc<ArmedSegment>)> = self.armed.held.lock().drain().collect();
        for (id, item) in held {
            if item.timer().disable_if_not_expired() {
                self.armed.release(&id);
            }
        }
    }

    /// Get coalescer statistics
    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            appends: self.armed.appends.load(Ordering::Relaxed),
            cycles: self.armed.cycles.load(Ordering::Relaxed),
            timed_releases: self.armed.timed_releases.load(Ordering::Relaxed),
            early_releases: self.armed.early_releases.load(Ordering::Relaxed),
            armed: self.armed.held.lock().len(),
        }
    }

    /// Release everything and stop the sweeper
    pub fn shutdown(&self) {
        self.flush();
        self.timers.shutdown();
    }
}
