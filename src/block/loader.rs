//! Block Loading Across Tiers
//!
//! ```text
//!   primary:      local tier ──miss──▶ durable tier ──miss──▶ NotFound
//!
//!   non-primary:  fresh? ──yes──▶ done
//!                   │no
//!                   ▼
//!                 durable tier ──miss──▶ primary peer ──not found──▶ durable tier
//! ```
//!
//! Loads are double-checked under the block's load lock, so concurrent
//! acquirers of a cold block perform one load between them.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Block, BlockState, LoadMeta};
use crate::error::{Error, Result};
use crate::global::GlobalStore;
use crate::local::LocalStore;
use crate::peer::PrimaryPeer;

/// How long remotely fetched data is trusted on a non-primary node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub segment: Duration,
    pub metadata: Duration,
}

impl Default for Freshness {
    fn default() -> Self {
        Self {
            segment: Duration::from_millis(10_000),
            metadata: Duration::from_millis(2_000),
        }
    }
}

/// Everything a block needs to load itself
pub struct Tiers {
    pub local: Arc<LocalStore>,
    pub global: Arc<GlobalStore>,
    pub peer: Option<Arc<dyn PrimaryPeer>>,
    pub freshness: Freshness,
}

impl Block {
    /// Make sure the block holds data, loading or refreshing it as needed
    pub fn ensure_loaded(&self, tiers: &Tiers) -> Result<()> {
        if self.primary {
            self.load_as_primary(tiers)
        } else {
            self.refresh_as_replica(tiers)
        }
    }

    fn load_as_primary(&self, tiers: &Tiers) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let mut meta = self.load_meta.lock();
        if self.is_loaded() {
            return Ok(());
        }

        self.set_state(BlockState::Loading);
        let result = self.fetch_owned(tiers);
        self.finish_load(&mut meta, result)
    }

    /// Start a new block on its primary
    ///
    /// Existing local data wins; otherwise a local slot is reserved and the
    /// block starts loaded and empty.
    pub fn ensure_created(&self, tiers: &Tiers) -> Result<()> {
        self.require_primary("create")?;
        if self.is_loaded() {
            return Ok(());
        }
        let mut meta = self.load_meta.lock();
        if self.is_loaded() {
            return Ok(());
        }

        self.set_state(BlockState::Loading);
        let result = match tiers.local.load(self) {
            Ok(true) => Ok(()),
            Ok(false) => tiers.local.create_block(&self.id),
            Err(e) => Err(e),
        };
        self.finish_load(&mut meta, result)
    }

    fn fetch_owned(&self, tiers: &Tiers) -> Result<()> {
        if tiers.local.load(self)? {
            return Ok(());
        }
        match tiers.global.load(&self.id)? {
            Some(bytes) => {
                debug!(block = %self.id, bytes = bytes.len(), "loaded from durable tier");
                self.fill(&bytes);
                Ok(())
            }
            None => Err(Error::not_found(self.id)),
        }
    }

    fn refresh_as_replica(&self, tiers: &Tiers) -> Result<()> {
        let mut meta = self.load_meta.lock();
        if meta.permanently_fresh && self.is_loaded() {
            return Ok(());
        }
        let timeout = if self.kind().is_append_only() {
            tiers.freshness.segment
        } else {
            tiers.freshness.metadata
        };
        if self.is_loaded() && meta.last_fetch.is_some_and(|t| t.elapsed() < timeout) {
            return Ok(());
        }

        let was_loaded = self.is_loaded();
        if !was_loaded {
            self.set_state(BlockState::Loading);
        }
        match self.fetch_remote(tiers, &mut meta) {
            Ok(()) => self.finish_load(&mut meta, Ok(())),
            Err(e) if was_loaded => {
                // Committed bytes never change, so stale data stays valid
                warn!(block = %self.id, error = %e, "refresh failed, serving cached data");
                meta.last_fetch = Some(Instant::now());
                Ok(())
            }
            Err(e) => self.finish_load(&mut meta, Err(e)),
        }
    }

    fn fetch_remote(&self, tiers: &Tiers, meta: &mut LoadMeta) -> Result<()> {
        if self.install_from_durable(tiers, meta)? {
            return Ok(());
        }

        let Some(peer) = &tiers.peer else {
            return Err(Error::not_found(self.id));
        };
        match peer.fetch_segment(&self.id, self.valid_len()) {
            Ok(bytes) => {
                debug!(block = %self.id, bytes = bytes.len(), "fetched from primary");
                self.fill(&bytes);
                meta.permanently_fresh = self.is_full();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                // The primary may have tiered and dropped the block meanwhile
                if self.install_from_durable(tiers, meta)? {
                    Ok(())
                } else {
                    Err(Error::not_found(self.id))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn install_from_durable(&self, tiers: &Tiers, meta: &mut LoadMeta) -> Result<bool> {
        match tiers.global.load(&self.id)? {
            Some(bytes) => {
                debug!(block = %self.id, bytes = bytes.len(), "fetched from durable tier");
                self.fill(&bytes);
                // Only full segments are ever uploaded
                meta.permanently_fresh = self.kind().is_append_only();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn finish_load(&self, meta: &mut LoadMeta, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                meta.last_fetch = Some(Instant::now());
                self.loaded.store(true, Ordering::Release);
                self.set_state(self.settled_state());
                Ok(())
            }
            Err(e) => {
                self.set_state(BlockState::Empty);
                Err(e)
            }
        }
    }
}
