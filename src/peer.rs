//! Primary Peer Contract
//!
//! A non-primary node asks the primary for bytes it has not tiered yet.
//! The transport is outside this crate; [`CachePeer`] serves requests from
//! an in-process primary cache and is what the server side of any transport
//! calls into.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::block::BlockId;
use crate::cache::BlockCache;
use crate::error::{Error, Result};

/// Fetch fresher block contents from the block's primary node
pub trait PrimaryPeer: Send + Sync {
    /// Return the valid bytes of `id`, which must cover at least `min_offset`
    ///
    /// `Error::NotFound` means the primary no longer holds the block locally;
    /// the caller falls back to the durable tier.
    fn fetch_segment(&self, id: &BlockId, min_offset: usize) -> Result<Bytes>;
}

/// Peer backed by a primary node's cache in the same process
pub struct CachePeer {
    cache: Arc<BlockCache>,
}

impl CachePeer {
    pub fn new(cache: Arc<BlockCache>) -> Self {
        Self { cache }
    }
}

impl PrimaryPeer for CachePeer {
    fn fetch_segment(&self, id: &BlockId, min_offset: usize) -> Result<Bytes> {
        let bytes = self.cache.serve(id)?;
        debug!(block = %id, bytes = bytes.len(), min_offset, "served to replica");
        if bytes.len() < min_offset {
            return Err(Error::Peer(format!(
                "primary holds {} bytes of {id}, replica already has {min_offset}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}
