//! Data Segment Body
//!
//! A fixed-capacity append-only byte range. The committed bytes are exactly
//! the buffer's length (the write cursor), so readers never see bytes past
//! the last completed append. Appends and reads are serialized by a
//! reader-writer lock, which rules out torn reads.
//!
//! ```text
//!   0            dirty_offset            cursor            capacity
//!   ├──── on disk ─────┼──── in memory only ─┼──── free ──────┤
//! ```

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::write_at;
use crate::error::{Error, Result};

/// Why an append was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendRejected {
    /// The segment is immutable
    Full,
    /// The offset is not the write cursor
    Offset { expected: usize },
    /// The buffer went back to the pool
    Recycled,
}

/// Fixed-capacity append-only segment
pub struct Segment {
    index: u32,
    capacity: usize,
    data: RwLock<Vec<u8>>,
    dirty_offset: Mutex<usize>,
    full: AtomicBool,
    tier_claimed: AtomicBool,
    recycled: AtomicBool,
}

impl Segment {
    /// Wrap a pool buffer as segment `index` of its block
    pub fn new(index: u32, capacity: usize, mut buf: Vec<u8>) -> Self {
        buf.clear();
        buf.reserve_exact(capacity);
        Self {
            index,
            capacity,
            data: RwLock::new(buf),
            dirty_offset: Mutex::new(0),
            full: AtomicBool::new(false),
            tier_claimed: AtomicBool::new(false),
            recycled: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Committed bytes (the write cursor)
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the cursor reached capacity
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Append at `offset`, which must equal the cursor
    ///
    /// Copies up to the remaining capacity and returns the bytes taken.
    pub fn append(&self, offset: usize, src: &[u8]) -> std::result::Result<usize, AppendRejected> {
        let mut data = self.data.write();
        if self.recycled.load(Ordering::Acquire) {
            return Err(AppendRejected::Recycled);
        }
        if data.len() >= self.capacity {
            return Err(AppendRejected::Full);
        }
        if offset != data.len() {
            return Err(AppendRejected::Offset {
                expected: data.len(),
            });
        }

        let n = src.len().min(self.capacity - data.len());
        data.extend_from_slice(&src[..n]);
        if data.len() == self.capacity {
            self.full.store(true, Ordering::Release);
        }
        Ok(n)
    }

    /// Copy committed bytes starting at `offset` into `dst`
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        if offset > self.capacity {
            return Err(Error::InvalidOffset {
                offset,
                expected: self.capacity,
            });
        }
        let data = self.data.read();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = dst.len().min(data.len() - offset);
        dst[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    /// Copy of all committed bytes
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.read())
    }

    /// Write bytes past the dirty watermark to `file` at `base + watermark`
    pub(crate) fn write_dirty(&self, file: &File, base: u64) -> io::Result<usize> {
        let data = self.data.read();
        let mut dirty = self.dirty_offset.lock();
        let end = data.len();
        if end <= *dirty {
            return Ok(0);
        }
        write_at(file, base + *dirty as u64, &data[*dirty..end])?;
        let written = end - *dirty;
        *dirty = end;
        Ok(written)
    }

    /// Install bytes fetched from another tier
    ///
    /// Never shrinks the committed range: a shorter image is older than what
    /// is already here. Returns the committed length afterwards.
    ///
    /// A full image counts as tiered only when it came from the durable tier
    /// (or a peer); a full local file may still owe its upload.
    pub(crate) fn fill(&self, bytes: &[u8], durable: bool) -> usize {
        let mut data = self.data.write();
        if self.recycled.load(Ordering::Acquire) || bytes.len() <= data.len() {
            return data.len();
        }
        let n = bytes.len().min(self.capacity);
        data.clear();
        data.extend_from_slice(&bytes[..n]);
        // Loaded bytes are already persistent somewhere
        *self.dirty_offset.lock() = n;
        if n == self.capacity {
            self.full.store(true, Ordering::Release);
            if durable {
                self.tier_claimed.store(true, Ordering::Release);
            }
        }
        n
    }

    /// Claim the one-time durable upload of a full segment
    pub(crate) fn claim_tiering(&self) -> bool {
        self.is_full() && !self.tier_claimed.swap(true, Ordering::AcqRel)
    }

    /// Detach the buffer so it can go back to the pool
    pub(crate) fn take_buffer(&self) -> Vec<u8> {
        let mut data = self.data.write();
        self.recycled.store(true, Ordering::Release);
        std::mem::take(&mut *data)
    }
}
