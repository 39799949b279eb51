//! Segment Buffer Pool
//!
//! Segment bodies are large fixed-size buffers. Instead of allocating one per
//! cache admission, buffers are checked out of a bounded free list and
//! returned when the owning segment is evicted. A buffer is moved in and out
//! of the pool, so at any time it belongs either to exactly one segment or to
//! the pool.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Maximum number of buffers
    pub capacity: usize,
    /// Buffers currently allocated (free or checked out)
    pub allocated: usize,
    /// Buffers waiting in the free list
    pub free: usize,
    /// Total checkouts served
    pub checkouts: u64,
    /// Checkouts served from the free list
    pub reused: u64,
}

/// Bounded free list of segment buffers
pub struct SegmentPool {
    segment_size: usize,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
    checkouts: AtomicU64,
    reused: AtomicU64,
}

impl SegmentPool {
    /// Create a pool of at most `capacity` buffers of `segment_size` bytes
    pub fn new(segment_size: usize, capacity: usize) -> Self {
        Self {
            segment_size,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
            allocated: AtomicUsize::new(0),
            checkouts: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Check out an empty buffer with room for one segment
    ///
    /// Returns `None` when every buffer is checked out.
    pub fn checkout(&self) -> Option<Vec<u8>> {
        if let Some(buf) = self.free.lock().pop() {
            self.checkouts.fetch_add(1, Ordering::Relaxed);
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Some(buf);
        }

        let reserved = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return None;
        }
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        Some(Vec::with_capacity(self.segment_size))
    }

    /// Return a buffer to the pool
    pub fn checkin(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.segment_size {
            // Never handed out by this pool (or already drained)
            if buf.capacity() > 0 {
                self.allocated.fetch_sub(1, Ordering::AcqRel);
            }
            return;
        }
        buf.clear();
        self.free.lock().push(buf);
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            allocated: self.allocated.load(Ordering::Acquire),
            free: self.free.lock().len(),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}
