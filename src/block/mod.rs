//! Blocks
//!
//! A [`Block`] is the unit the engine caches, persists and tiers. It owns a
//! body selected by [`BlockKind`] plus the bookkeeping shared by all kinds:
//!
//! ```text
//!                 ┌──────────────────────── Block ────────────────────────┐
//!                 │ id, primary                                           │
//!                 │ state      EMPTY → LOADING → READY → FULL → EVICTING  │
//!                 │ dirty      mutations not yet on local disk            │
//!                 │ queued     waiting in a local-store worker queue      │
//!                 │ sync       signal raised when dirty == 0 && !queued   │
//!                 │ body       Segment | Bitmap | Metadata                │
//!                 └───────────────────────────────────────────────────────┘
//! ```
//!
//! The dirty counter is bumped after a mutation is visible and only lowered
//! by the local-store worker by the amount it observed before flushing, so a
//! zero counter always means every mutation is on local disk.

mod id;
mod loader;
mod metadata;
mod pool;
mod segment;

pub use id::{BlockGeometry, BlockId, BlockKind, ClusterTopology};
pub use loader::{Freshness, Tiers};
pub use metadata::{Bitmap, MetadataImage};
pub use pool::{PoolStats, SegmentPool};
pub use segment::{AppendRejected, Segment};

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{Error, Result};
use crate::transfer::Transferable;

/// Positional write on a shared handle
///
/// Callers hold the per-file keyed lock, so seek and write cannot interleave.
pub(crate) fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(offset))?;
    handle.write_all(buf)
}

// =============================================================================
// Block State
// =============================================================================

/// Lifecycle state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// No data installed
    Empty = 0,
    /// A load is in progress
    Loading = 1,
    /// Loaded and accepting reads (and writes on the primary)
    Ready = 2,
    /// Segment reached capacity and is immutable
    Full = 3,
    /// Being removed from the cache
    Evicting = 4,
}

impl BlockState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BlockState::Loading,
            2 => BlockState::Ready,
            3 => BlockState::Full,
            4 => BlockState::Evicting,
            _ => BlockState::Empty,
        }
    }
}

// =============================================================================
// Block Body
// =============================================================================

/// Kind-specific payload of a block
pub enum BlockBody {
    Segment(Segment),
    Bitmap(Bitmap),
    Metadata(MetadataImage),
}

impl BlockBody {
    /// Build the body for `id`, drawing segment buffers from `pool`
    pub fn for_kind(id: &BlockId, geometry: &BlockGeometry, pool: &SegmentPool) -> Result<Self> {
        Ok(match id.kind() {
            BlockKind::Segment => {
                let buf = pool.checkout().ok_or_else(|| {
                    Error::OutOfCapacity(format!("segment pool exhausted while admitting {id}"))
                })?;
                BlockBody::Segment(Segment::new(id.key(), geometry.segment_size, buf))
            }
            BlockKind::Bitmap => BlockBody::Bitmap(Bitmap::new(geometry.bitmap_size)),
            BlockKind::MetadataDir | BlockKind::SecondaryIndex => {
                BlockBody::Metadata(MetadataImage::new())
            }
        })
    }
}

// =============================================================================
// Sync Signal
// =============================================================================

#[derive(Default)]
struct SyncSignal {
    lock: Mutex<()>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct LoadMeta {
    last_fetch: Option<Instant>,
    permanently_fresh: bool,
}

// =============================================================================
// Block
// =============================================================================

/// A cached, persistable block
pub struct Block {
    id: BlockId,
    primary: bool,
    state: AtomicU8,
    dirty: AtomicU64,
    queued: AtomicBool,
    in_local_store: AtomicBool,
    loaded: AtomicBool,
    load_meta: Mutex<LoadMeta>,
    sync: SyncSignal,
    body: BlockBody,
}

impl Transferable for Block {
    fn queued_flag(&self) -> &AtomicBool {
        &self.queued
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("primary", &self.primary)
            .field("state", &self.state())
            .field("dirty", &self.dirty_count())
            .field("queued", &self.is_queued())
            .finish()
    }
}

impl Block {
    /// Create an empty, unloaded block
    pub fn new(id: BlockId, primary: bool, body: BlockBody) -> Self {
        Self {
            id,
            primary,
            state: AtomicU8::new(BlockState::Empty as u8),
            dirty: AtomicU64::new(0),
            queued: AtomicBool::new(false),
            in_local_store: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            load_meta: Mutex::new(LoadMeta::default()),
            sync: SyncSignal::default(),
            body,
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn kind(&self) -> BlockKind {
        self.id.kind()
    }

    /// Whether this node is the authoritative writer
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn body(&self) -> &BlockBody {
        &self.body
    }

    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BlockState) {
        let prev = self.state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            trace!(block = %self.id, from = ?BlockState::from_u8(prev), to = ?state, "block state");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Mark a freshly created block as loaded with no data
    pub(crate) fn mark_created(&self) {
        self.loaded.store(true, Ordering::Release);
        self.load_meta.lock().last_fetch = Some(Instant::now());
        self.set_state(self.settled_state());
    }

    pub fn is_in_local_store(&self) -> bool {
        self.in_local_store.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_local_store(&self, value: bool) {
        self.in_local_store.store(value, Ordering::Release);
    }

    // =========================================================================
    // Dirty tracking and sync
    // =========================================================================

    /// Mutations not yet flushed to the local tier
    pub fn dirty_count(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_count() > 0
    }

    #[inline]
    fn mark_dirty(&self) {
        self.dirty.fetch_add(1, Ordering::AcqRel);
    }

    /// Subtract a snapshot taken before a flush; returns the remainder
    pub(crate) fn clear_dirty(&self, flushed: u64) -> u64 {
        let prev = self
            .dirty
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_sub(flushed))
            })
            .unwrap_or(0);
        prev.saturating_sub(flushed)
    }

    /// No pending mutations and not waiting for a worker
    pub fn is_synced(&self) -> bool {
        self.dirty_count() == 0 && !self.is_queued()
    }

    /// Block until every mutation is on local disk
    pub fn wait_until_synced(&self) {
        let mut guard = self.sync.lock.lock();
        while !self.is_synced() {
            self.sync.cond.wait(&mut guard);
        }
    }

    /// Like [`wait_until_synced`](Self::wait_until_synced) with a deadline
    ///
    /// Returns whether the block is synced.
    pub fn wait_until_synced_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.sync.lock.lock();
        while !self.is_synced() {
            if self.sync.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.is_synced();
            }
        }
        true
    }

    /// Wake every sync waiter
    pub(crate) fn notify_synced(&self) {
        let _guard = self.sync.lock.lock();
        self.sync.cond.notify_all();
    }

    // =========================================================================
    // Segment operations
    // =========================================================================

    pub(crate) fn require_primary(&self, op: &str) -> Result<()> {
        if self.primary {
            return Ok(());
        }
        Err(Error::ProtocolViolation(format!(
            "{op} on {} from a non-primary node",
            self.id
        )))
    }

    fn segment(&self, op: &'static str) -> Result<&Segment> {
        match &self.body {
            BlockBody::Segment(s) => Ok(s),
            _ => Err(Error::WrongKind {
                id: self.id.to_string(),
                op,
            }),
        }
    }

    /// Append `data` at segment-relative `offset`
    ///
    /// Returns the number of bytes taken, which is short only when the
    /// segment fills up.
    pub fn append(&self, offset: usize, data: &[u8]) -> Result<usize> {
        let segment = self.segment("append")?;
        self.require_primary("append")?;
        let n = segment.append(offset, data).map_err(|rejected| match rejected {
            AppendRejected::Full => Error::SegmentFull {
                id: self.id.to_string(),
            },
            AppendRejected::Offset { expected } => Error::InvalidOffset { offset, expected },
            AppendRejected::Recycled => {
                Error::ProtocolViolation(format!("append to evicted block {}", self.id))
            }
        })?;
        if n > 0 {
            self.mark_dirty();
        }
        if segment.is_full() {
            self.set_state(BlockState::Full);
        }
        Ok(n)
    }

    /// Read committed bytes at segment-relative `offset`
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        match &self.body {
            BlockBody::Segment(s) => s.read(offset, dst),
            BlockBody::Metadata(m) => Ok(m.read(offset, dst)),
            BlockBody::Bitmap(b) => {
                let bits = b.snapshot();
                if offset >= bits.len() {
                    return Ok(0);
                }
                let n = dst.len().min(bits.len() - offset);
                dst[..n].copy_from_slice(&bits[offset..offset + n]);
                Ok(n)
            }
        }
    }

    /// Whether an append-only block reached capacity
    pub fn is_full(&self) -> bool {
        matches!(&self.body, BlockBody::Segment(s) if s.is_full())
    }

    /// Number of valid bytes held in memory
    pub fn valid_len(&self) -> usize {
        match &self.body {
            BlockBody::Segment(s) => s.len(),
            BlockBody::Bitmap(b) => (b.bit_len() / 8) as usize,
            BlockBody::Metadata(m) => m.len(),
        }
    }

    // =========================================================================
    // Bitmap operations
    // =========================================================================

    fn bitmap(&self, op: &'static str) -> Result<&Bitmap> {
        match &self.body {
            BlockBody::Bitmap(b) => Ok(b),
            _ => Err(Error::WrongKind {
                id: self.id.to_string(),
                op,
            }),
        }
    }

    /// Allocate the lowest free bit
    pub fn bitmap_allocate(&self) -> Result<Option<u64>> {
        let bitmap = self.bitmap("bitmap_allocate")?;
        self.require_primary("bitmap_allocate")?;
        let bit = bitmap.allocate();
        if bit.is_some() {
            self.mark_dirty();
        }
        Ok(bit)
    }

    /// Free `bit`
    pub fn bitmap_clear(&self, bit: u64) -> Result<bool> {
        let bitmap = self.bitmap("bitmap_clear")?;
        self.require_primary("bitmap_clear")?;
        let was_set = bitmap.clear(bit)?;
        if was_set {
            self.mark_dirty();
        }
        Ok(was_set)
    }

    pub fn bitmap_is_set(&self, bit: u64) -> Result<bool> {
        self.bitmap("bitmap_is_set")?.is_set(bit)
    }

    // =========================================================================
    // Metadata operations
    // =========================================================================

    /// Overwrite or extend a metadata image
    pub fn write_metadata(&self, offset: usize, data: &[u8]) -> Result<()> {
        match &self.body {
            BlockBody::Metadata(m) => {
                self.require_primary("write_metadata")?;
                m.write_at(offset, data)?;
                self.mark_dirty();
                Ok(())
            }
            _ => Err(Error::WrongKind {
                id: self.id.to_string(),
                op: "write_metadata",
            }),
        }
    }

    // =========================================================================
    // Persistence hooks
    // =========================================================================

    /// Copy of the valid bytes
    pub fn snapshot(&self) -> Bytes {
        match &self.body {
            BlockBody::Segment(s) => s.snapshot(),
            BlockBody::Bitmap(b) => b.snapshot(),
            BlockBody::Metadata(m) => m.snapshot(),
        }
    }

    /// Write what the local file is missing; returns bytes written
    pub(crate) fn store_to(&self, file: &File, segment_size: usize) -> io::Result<usize> {
        match &self.body {
            BlockBody::Segment(s) => s.write_dirty(file, self.id.file_offset(segment_size)),
            BlockBody::Bitmap(b) => b.write_to(file),
            BlockBody::Metadata(m) => m.write_to(file),
        }
    }

    /// Install bytes fetched from a remote tier; returns the valid length afterwards
    pub(crate) fn fill(&self, bytes: &[u8]) -> usize {
        self.fill_from(bytes, true)
    }

    /// Install bytes read back from this node's local file
    pub(crate) fn fill_local(&self, bytes: &[u8]) -> usize {
        self.fill_from(bytes, false)
    }

    fn fill_from(&self, bytes: &[u8], durable: bool) -> usize {
        let n = match &self.body {
            BlockBody::Segment(s) => s.fill(bytes, durable),
            BlockBody::Bitmap(b) => b.fill(bytes),
            BlockBody::Metadata(m) => m.fill(bytes),
        };
        self.set_state(self.settled_state());
        n
    }

    /// Whether a clean flush should be followed by a durable upload
    ///
    /// A full segment claims its single upload here; mutable metadata is
    /// tiered after every flush.
    pub(crate) fn claim_tiering(&self) -> bool {
        match &self.body {
            BlockBody::Segment(s) => s.claim_tiering(),
            BlockBody::Bitmap(_) | BlockBody::Metadata(_) => true,
        }
    }

    /// Return the segment buffer to `pool` after eviction
    pub(crate) fn recycle(&self, pool: &SegmentPool) {
        self.set_state(BlockState::Evicting);
        if let BlockBody::Segment(s) = &self.body {
            pool.checkin(s.take_buffer());
        }
        self.loaded.store(false, Ordering::Release);
        self.set_state(BlockState::Empty);
    }

    fn settled_state(&self) -> BlockState {
        if self.is_full() {
            BlockState::Full
        } else {
            BlockState::Ready
        }
    }
}
