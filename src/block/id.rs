//! Block Identity and Ownership Routing
//!
//! A [`BlockId`] is a plain value. Everything the engine needs to route a
//! block is derived from it and nothing else:
//!
//! ```text
//!   BlockId { high, low, key, kind }
//!        │
//!        ├── primary_of()   entity mod node_count  -> authoritative writer
//!        ├── shard_key()    mix(kind, high, low)   -> worker / backend / lock
//!        ├── local_path()   deterministic file under the data dir
//!        ├── file_offset()  segment index * segment size
//!        └── object_key()   durable-tier object name
//! ```
//!
//! The segment index (`key`) is deliberately left out of the shard key and
//! the local path: all segments of one logical block share a file and must be
//! serialized by the same worker and lock.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// =============================================================================
// Block Kind
// =============================================================================

/// Closed set of block variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Fixed-capacity append-only data segment
    Segment,
    /// Allocation bitmap
    Bitmap,
    /// Metadata directory block
    MetadataDir,
    /// Secondary index node
    SecondaryIndex,
}

impl BlockKind {
    fn tag(self) -> u8 {
        match self {
            BlockKind::Segment => 1,
            BlockKind::Bitmap => 2,
            BlockKind::MetadataDir => 3,
            BlockKind::SecondaryIndex => 4,
        }
    }

    /// Whether blocks of this kind are immutable once full
    pub fn is_append_only(self) -> bool {
        matches!(self, BlockKind::Segment)
    }
}

// =============================================================================
// Block Id
// =============================================================================

/// Immutable identity of a block
///
/// Two ids built independently from the same fields are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    high: u64,
    low: u64,
    key: u32,
    kind: BlockKind,
}

impl BlockId {
    /// Segment `segment` of block `block` of file `file`
    pub fn segment(file: u64, block: u64, segment: u32) -> Self {
        Self {
            high: file,
            low: block,
            key: segment,
            kind: BlockKind::Segment,
        }
    }

    /// Allocation bitmap number `map`
    pub fn bitmap(map: u64) -> Self {
        Self {
            high: 0,
            low: map,
            key: 0,
            kind: BlockKind::Bitmap,
        }
    }

    /// Metadata directory block number `block`
    pub fn metadata(block: u64) -> Self {
        Self {
            high: 0,
            low: block,
            key: 0,
            kind: BlockKind::MetadataDir,
        }
    }

    /// Secondary index node `node` of file `file`
    pub fn secondary_index(file: u64, node: u64) -> Self {
        Self {
            high: file,
            low: node,
            key: 0,
            kind: BlockKind::SecondaryIndex,
        }
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Logical entity that decides ownership
    ///
    /// File number for file-scoped kinds, block number otherwise.
    #[inline]
    pub fn entity(&self) -> u64 {
        match self.kind {
            BlockKind::Segment | BlockKind::SecondaryIndex => self.high,
            BlockKind::Bitmap | BlockKind::MetadataDir => self.low,
        }
    }

    /// Deterministic shard key shared by every segment of one local file
    #[inline]
    pub fn shard_key(&self) -> u32 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        let mut mix = |word: u64| {
            hash = hash.rotate_left(5) ^ word;
            hash = hash.wrapping_mul(SEED);
        };
        mix(self.kind.tag() as u64);
        mix(self.high);
        mix(self.low);
        ((hash >> 32) ^ hash) as u32
    }

    /// Path of the backing file relative to the data dir
    pub fn relative_path(&self) -> PathBuf {
        match self.kind {
            BlockKind::Segment => {
                let name = format!("{:016x}{:016x}", self.high, self.low);
                // Two directory levels from the shard key, 256 entries each
                let fanout = format!("{:04x}", (self.shard_key() & 0xffff) as u16);
                PathBuf::from("blocks")
                    .join(&fanout[0..2])
                    .join(&fanout[2..4])
                    .join(name)
            }
            BlockKind::Bitmap => PathBuf::from("bitmaps").join(format!("{:x}", self.low)),
            BlockKind::MetadataDir => PathBuf::from("metadata").join(format!("{:x}", self.low)),
            BlockKind::SecondaryIndex => {
                PathBuf::from("index").join(format!("{:x}-{:x}", self.high, self.low))
            }
        }
    }

    /// Recover the id of a local file from its relative path
    ///
    /// Segment files map to their first segment (`key` 0).
    pub fn from_relative_path(path: &Path) -> Option<Self> {
        let parts: Vec<&str> = path.iter().filter_map(|p| p.to_str()).collect();
        let hex = |s: &str| u64::from_str_radix(s, 16).ok();
        match parts.as_slice() {
            ["blocks", _, _, name] if name.len() == 32 => {
                Some(Self::segment(hex(&name[..16])?, hex(&name[16..])?, 0))
            }
            ["bitmaps", n] => Some(Self::bitmap(hex(n)?)),
            ["metadata", n] => Some(Self::metadata(hex(n)?)),
            ["index", name] => {
                let (file, node) = name.split_once('-')?;
                Some(Self::secondary_index(hex(file)?, hex(node)?))
            }
            _ => None,
        }
    }

    /// Id of segment `segment` in the same file as this segment
    pub fn with_segment(&self, segment: u32) -> Self {
        Self { key: segment, ..*self }
    }

    /// Absolute path of the backing file under `root`
    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }

    /// Byte offset of this block's data inside its local file
    #[inline]
    pub fn file_offset(&self, segment_size: usize) -> u64 {
        match self.kind {
            BlockKind::Segment => self.key as u64 * segment_size as u64,
            _ => 0,
        }
    }

    /// Object key in the durable tier
    pub fn object_key(&self) -> String {
        match self.kind {
            BlockKind::Segment => format!("seg/{:x}/{:x}/{}", self.high, self.low, self.key),
            BlockKind::Bitmap => format!("bitmap/{:x}", self.low),
            BlockKind::MetadataDir => format!("meta/{:x}", self.low),
            BlockKind::SecondaryIndex => format!("index/{:x}/{:x}", self.high, self.low),
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BlockKind::Segment => write!(f, "D-{}-{}-{}", self.high, self.low, self.key),
            BlockKind::Bitmap => write!(f, "B{}", self.low),
            BlockKind::MetadataDir => write!(f, "M{}", self.low),
            BlockKind::SecondaryIndex => write!(f, "X-{}-{}", self.high, self.low),
        }
    }
}

// =============================================================================
// Cluster Topology
// =============================================================================

/// Membership of this node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTopology {
    node_id: u32,
    node_count: u32,
}

impl ClusterTopology {
    /// Create a topology; a zero node count is treated as a single node
    pub fn new(node_id: u32, node_count: u32) -> Self {
        Self {
            node_id,
            node_count: node_count.max(1),
        }
    }

    /// Single-node cluster where every block is primary here
    pub fn single() -> Self {
        Self::new(0, 1)
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Node that owns writes to `id`
    #[inline]
    pub fn primary_of(&self, id: &BlockId) -> u32 {
        (id.entity() % self.node_count as u64) as u32
    }

    /// Whether this node is the primary of `id`
    #[inline]
    pub fn is_primary(&self, id: &BlockId) -> bool {
        self.primary_of(id) == self.node_id
    }
}

// =============================================================================
// Block Geometry
// =============================================================================

/// Sizing shared by every block on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    /// Capacity of a data segment in bytes
    pub segment_size: usize,
    /// Number of segments in one local file
    pub segments_per_block: u32,
    /// Size of an allocation bitmap in bytes
    pub bitmap_size: usize,
}

impl Default for BlockGeometry {
    fn default() -> Self {
        Self {
            segment_size: crate::config::DEFAULT_SEGMENT_SIZE,
            segments_per_block: 16,
            bitmap_size: 4096,
        }
    }
}

impl BlockGeometry {
    /// Number of tiering units that must be durable before a file is evictable
    pub fn units_per_file(&self, kind: BlockKind) -> u32 {
        match kind {
            BlockKind::Segment => self.segments_per_block,
            _ => 1,
        }
    }
}
