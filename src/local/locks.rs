//! Keyed lock table: a fixed set of mutexes selected by shard key
//!
//! Everything that touches one local file (worker flush, upload read, load,
//! local eviction) goes through the lock its shard key selects.

use parking_lot::{Mutex, MutexGuard};

/// Striped mutexes indexed by shard key
pub struct KeyedLocks {
    stripes: Box<[Mutex<()>]>,
}

impl KeyedLocks {
    /// Create `stripes` locks (rounded up to a power of two)
    pub fn new(stripes: usize) -> Self {
        let n = stripes.max(1).next_power_of_two();
        Self {
            stripes: (0..n).map(|_| Mutex::new(())).collect(),
        }
    }

    #[inline]
    fn index(&self, shard_key: u32) -> usize {
        shard_key as usize & (self.stripes.len() - 1)
    }

    /// Lock the stripe for `shard_key`
    pub fn lock(&self, shard_key: u32) -> MutexGuard<'_, ()> {
        self.stripes[self.index(shard_key)].lock()
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}
