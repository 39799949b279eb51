//! Cache entries and victim selection
//!
//! Entries are indexed twice: by id for lookups and by last-touch tick for
//! victim selection, so an eviction batch walks the LRU end of the order
//! instead of sorting the whole table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::block::{Block, BlockId};

/// A block plus the bookkeeping only the cache sees
pub(super) struct CachedItem {
    pub block: Arc<Block>,
    pub refs: u32,
    pub last_tick: u64,
}

impl CachedItem {
    pub fn new(block: Arc<Block>, tick: u64) -> Self {
        Self {
            block,
            refs: 0,
            last_tick: tick,
        }
    }

    /// Unreferenced and every mutation on local disk
    pub fn is_evictable(&self) -> bool {
        self.refs == 0 && self.block.is_synced()
    }
}

/// Everything guarded by the cache-wide mutex
#[derive(Default)]
pub(super) struct CacheState {
    pub entries: HashMap<BlockId, CachedItem>,
    /// last_tick -> id, one per entry
    order: BTreeMap<u64, BlockId>,
    tick: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Add an entry for `id` holding one reference
    pub fn insert(&mut self, id: BlockId, block: Arc<Block>) {
        let tick = self.next_tick();
        let mut item = CachedItem::new(block, tick);
        item.refs = 1;
        if let Some(old) = self.entries.insert(id, item) {
            self.order.remove(&old.last_tick);
        }
        self.order.insert(tick, id);
    }

    /// Look up `id` and mark it most recently used
    pub fn touch(&mut self, id: &BlockId) -> Option<&mut CachedItem> {
        if !self.entries.contains_key(id) {
            return None;
        }
        let tick = self.next_tick();
        let item = self.entries.get_mut(id)?;
        self.order.remove(&item.last_tick);
        item.last_tick = tick;
        self.order.insert(tick, *id);
        Some(item)
    }

    pub fn remove(&mut self, id: &BlockId) -> Option<CachedItem> {
        let item = self.entries.remove(id)?;
        self.order.remove(&item.last_tick);
        Some(item)
    }

    /// Up to `limit` evictable ids, least recently touched first
    pub fn clean_victims(&self, limit: usize) -> Vec<BlockId> {
        self.order
            .values()
            .filter(|id| self.entries.get(id).is_some_and(CachedItem::is_evictable))
            .take(limit)
            .copied()
            .collect()
    }

    /// Oldest unreferenced block still waiting for its flush
    pub fn oldest_dirty(&self) -> Option<Arc<Block>> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id))
            .find(|item| item.refs == 0 && !item.block.is_synced())
            .map(|item| Arc::clone(&item.block))
    }

    /// Entries currently held by someone
    pub fn referenced(&self) -> usize {
        self.entries.values().filter(|item| item.refs > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockBody, MetadataImage};

    fn meta(n: u64) -> Arc<Block> {
        Arc::new(Block::new(
            BlockId::metadata(n),
            true,
            BlockBody::Metadata(MetadataImage::new()),
        ))
    }

    fn unpinned(state: &mut CacheState, n: u64) {
        state.insert(BlockId::metadata(n), meta(n));
        state.touch(&BlockId::metadata(n)).unwrap().refs = 0;
    }

    #[test]
    fn test_victims_in_lru_order() {
        let mut state = CacheState::default();
        for n in [3u64, 1, 2] {
            unpinned(&mut state, n);
        }
        state.touch(&BlockId::metadata(1)).unwrap().refs = 1;

        assert_eq!(
            state.clean_victims(10),
            vec![BlockId::metadata(3), BlockId::metadata(2)]
        );
        assert_eq!(state.clean_victims(1), vec![BlockId::metadata(3)]);
        assert_eq!(state.referenced(), 1);
    }

    #[test]
    fn test_touch_moves_entry_to_back() {
        let mut state = CacheState::default();
        for n in 0..4u64 {
            unpinned(&mut state, n);
        }
        state.touch(&BlockId::metadata(0));

        assert_eq!(
            state.clean_victims(4),
            vec![
                BlockId::metadata(1),
                BlockId::metadata(2),
                BlockId::metadata(3),
                BlockId::metadata(0)
            ]
        );
        assert!(state.touch(&BlockId::metadata(9)).is_none());
    }

    #[test]
    fn test_remove_drops_order_entry() {
        let mut state = CacheState::default();
        unpinned(&mut state, 1);
        unpinned(&mut state, 2);

        assert!(state.remove(&BlockId::metadata(1)).is_some());
        assert!(state.remove(&BlockId::metadata(1)).is_none());
        assert_eq!(state.order.len(), 1);
        assert_eq!(state.clean_victims(10), vec![BlockId::metadata(2)]);
    }

    #[test]
    fn test_dirty_blocks_not_victims() {
        let mut state = CacheState::default();
        let block = meta(7);
        block.write_metadata(0, b"x").unwrap();
        state.insert(BlockId::metadata(7), Arc::clone(&block));
        state.touch(&BlockId::metadata(7)).unwrap().refs = 0;

        assert!(state.clean_victims(10).is_empty());
        let dirty = state.oldest_dirty().unwrap();
        assert!(Arc::ptr_eq(&dirty, &block));
    }
}
