//! Strata - Three-Tier Append-Mostly Block Storage Engine
//!
//! Blocks move through three tiers on each node:
//!
//! ```text
//!   ┌──────────────┐  release   ┌──────────────┐  clean + full  ┌──────────────┐
//!   │  BlockCache  │───────────▶│  LocalStore  │───────────────▶│ GlobalStore  │
//!   │  (memory,    │   dirty    │  (files,     │    upload      │ (durable     │
//!   │   refcounts) │◀───────────│  write-back) │◀───────────────│  objects)    │
//!   └──────────────┘    load    └──────────────┘    download    └──────────────┘
//! ```
//!
//! Every block has one primary node, derived from its [`BlockId`]. Only the
//! primary mutates a block; other nodes read it from the durable tier or
//! ask the primary through a [`PrimaryPeer`]. No tier drops data before the
//! next tier durably holds it.
//!
//! # Modules
//!
//! - [`block`] - Block identity, bodies, state machine and tier loading
//! - [`cache`] - Reference-counted block cache with watermark eviction
//! - [`local`] - Write-back local tier, slot accounting and local eviction
//! - [`global`] - Durable-tier uploads and downloads over object backends
//! - [`timer`] - Timer queue and write coalescer
//! - [`transfer`] - Idempotent worker hand-off queue
//! - [`engine`] - Wiring and shutdown order
//! - [`metrics`] - Prometheus export of component statistics

pub mod block;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod global;
pub mod local;
pub mod metrics;
pub mod peer;
pub mod timer;
pub mod transfer;

// Re-export commonly used types
pub use block::{Block, BlockGeometry, BlockId, BlockKind, BlockState, ClusterTopology};
pub use cache::{BlockCache, CacheConfig};
pub use config::EngineConfig;
pub use engine::{EngineStats, StorageEngine};
pub use error::{Error, Result};
pub use global::{GlobalStore, InMemoryBackend, LocalDirBackend, ObjectBackend};
pub use local::{LocalStore, LocalStoreConfig};
pub use peer::{CachePeer, PrimaryPeer};
pub use timer::WriteCoalescer;
