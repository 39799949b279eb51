//! Engine Configuration
//!
//! A single serde-backed [`EngineConfig`] describes one node of the cluster.
//! It can be loaded from YAML, every field has a default, and `validate()`
//! rejects combinations the engine cannot run with. Component configs are
//! derived from it so each service only sees the knobs it owns.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::block::{BlockGeometry, ClusterTopology};
use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::global::GlobalStoreConfig;
use crate::local::LocalStoreConfig;

/// Default segment size (1 MiB)
pub const DEFAULT_SEGMENT_SIZE: usize = 1024 * 1024;

/// Configuration for one storage node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// This node's id (0..node_count)
    pub node_id: u32,
    /// Number of nodes sharing the durable tier
    pub node_count: u32,
    /// Root directory of the local tier
    pub data_dir: PathBuf,

    /// Memory budget of the block cache in bytes
    pub cache_capacity_bytes: usize,
    /// Fixed capacity of a data segment
    pub segment_size: usize,
    /// Segments per logical block (one local file)
    pub segments_per_block: u32,
    /// Size of an allocation bitmap block in bytes
    pub bitmap_size: usize,
    /// Fraction of cache capacity that triggers eviction
    pub cache_high_watermark: f64,
    /// Fraction of cache capacity eviction stops at
    pub cache_low_watermark: f64,
    /// Maximum entries removed per eviction pass
    pub cache_eviction_batch: usize,
    /// How long a full cache waits on a flushing block before giving up
    pub cache_sync_wait_ms: u64,

    /// Local write-back worker threads
    pub local_workers: usize,
    /// Local file slots
    pub local_max_blocks: usize,
    /// Fraction of local slots that triggers local eviction
    pub local_high_watermark: f64,
    /// Fraction of local slots local eviction stops at
    pub local_low_watermark: f64,
    /// Period of the background local evictor
    pub local_evict_interval_ms: u64,
    /// Delay before retrying a failed local flush
    pub local_retry_delay_ms: u64,
    /// Idle time after which a cached file handle is closed
    pub file_handle_idle_ms: u64,

    /// Durable-tier upload worker threads
    pub global_workers: usize,
    /// Durable-tier backend connections
    pub global_backends: usize,
    /// Delay before retrying a failed upload
    pub upload_retry_delay_ms: u64,
    /// Interval between drain progress reports at shutdown
    pub shutdown_grace_ms: u64,

    /// Idle time after which an armed segment is released
    pub coalesce_timeout_ms: u64,
    /// Staleness bound for segments on non-primary nodes
    pub segment_freshness_ms: u64,
    /// Staleness bound for metadata on non-primary nodes
    pub metadata_freshness_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            node_count: 1,
            data_dir: PathBuf::from("/var/lib/strata"),
            cache_capacity_bytes: 256 * DEFAULT_SEGMENT_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            segments_per_block: 16,
            bitmap_size: 4096,
            cache_high_watermark: 0.95,
            cache_low_watermark: 0.90,
            cache_eviction_batch: 20,
            cache_sync_wait_ms: 5_000,
            local_workers: 4,
            local_max_blocks: 30_000,
            local_high_watermark: 0.90,
            local_low_watermark: 0.80,
            local_evict_interval_ms: 1_000,
            local_retry_delay_ms: 100,
            file_handle_idle_ms: 5_000,
            global_workers: 4,
            global_backends: 2,
            upload_retry_delay_ms: 500,
            shutdown_grace_ms: 30_000,
            coalesce_timeout_ms: 50,
            segment_freshness_ms: 10_000,
            metadata_freshness_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            return Err(Error::Config("node_count must be > 0".into()));
        }
        if self.node_id >= self.node_count {
            return Err(Error::Config(format!(
                "node_id {} out of range for {} nodes",
                self.node_id, self.node_count
            )));
        }
        if self.segment_size == 0 || self.segments_per_block == 0 || self.bitmap_size == 0 {
            return Err(Error::Config(
                "segment_size, segments_per_block and bitmap_size must be > 0".into(),
            ));
        }
        if self.cache_capacity_bytes < self.segment_size {
            return Err(Error::Config(
                "cache_capacity_bytes must hold at least one segment".into(),
            ));
        }
        check_watermarks(
            "cache",
            self.cache_low_watermark,
            self.cache_high_watermark,
        )?;
        check_watermarks(
            "local",
            self.local_low_watermark,
            self.local_high_watermark,
        )?;
        if self.cache_eviction_batch == 0 {
            return Err(Error::Config("cache_eviction_batch must be > 0".into()));
        }
        if self.local_workers == 0 || self.global_workers == 0 || self.global_backends == 0 {
            return Err(Error::Config(
                "worker and backend counts must be > 0".into(),
            ));
        }
        if self.local_max_blocks == 0 {
            return Err(Error::Config("local_max_blocks must be > 0".into()));
        }
        Ok(())
    }

    /// Number of cache entries the memory budget allows
    pub fn cache_capacity_blocks(&self) -> usize {
        (self.cache_capacity_bytes / self.segment_size).max(1)
    }

    /// Cluster membership of this node
    pub fn topology(&self) -> ClusterTopology {
        ClusterTopology::new(self.node_id, self.node_count)
    }

    /// Block sizing
    pub fn geometry(&self) -> BlockGeometry {
        BlockGeometry {
            segment_size: self.segment_size,
            segments_per_block: self.segments_per_block,
            bitmap_size: self.bitmap_size,
        }
    }

    /// Cache configuration
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity_blocks(),
            high_watermark: self.cache_high_watermark,
            low_watermark: self.cache_low_watermark,
            eviction_batch: self.cache_eviction_batch,
            sync_wait: Duration::from_millis(self.cache_sync_wait_ms),
            segment_freshness: Duration::from_millis(self.segment_freshness_ms),
            metadata_freshness: Duration::from_millis(self.metadata_freshness_ms),
        }
    }

    /// Local store configuration
    pub fn local_config(&self) -> LocalStoreConfig {
        LocalStoreConfig {
            root: self.data_dir.clone(),
            workers: self.local_workers,
            max_blocks: self.local_max_blocks,
            high_watermark: self.local_high_watermark,
            low_watermark: self.local_low_watermark,
            evict_interval: Duration::from_millis(self.local_evict_interval_ms),
            retry_delay: Duration::from_millis(self.local_retry_delay_ms),
            handle_idle_timeout: Duration::from_millis(self.file_handle_idle_ms),
        }
    }

    /// Durable-tier store configuration
    pub fn global_config(&self) -> GlobalStoreConfig {
        GlobalStoreConfig {
            workers: self.global_workers,
            retry_delay: Duration::from_millis(self.upload_retry_delay_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    /// Write coalescing timeout
    pub fn coalesce_timeout(&self) -> Duration {
        Duration::from_millis(self.coalesce_timeout_ms)
    }
}

fn check_watermarks(name: &str, low: f64, high: f64) -> Result<()> {
    if !(0.0 < low && low < high && high <= 1.0) {
        return Err(Error::Config(format!(
            "{name} watermarks must satisfy 0 < low < high <= 1 (low={low}, high={high})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_capacity_blocks(), 256);
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
node_id: 2
node_count: 3
data_dir: /tmp/strata-test
segment_size: 4096
cache_capacity_bytes: 40960
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.cache_capacity_blocks(), 10);
        // Untouched fields keep their defaults
        assert_eq!(config.local_workers, 4);
        assert_eq!(config.segment_freshness_ms, 10_000);
    }

    #[test]
    fn test_node_id_out_of_range() {
        let config = EngineConfig {
            node_id: 3,
            node_count: 3,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_bad_watermarks_rejected() {
        let config = EngineConfig {
            cache_low_watermark: 0.95,
            cache_high_watermark: 0.90,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = EngineConfig {
            local_high_watermark: 1.5,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_cache_smaller_than_segment_rejected() {
        let config = EngineConfig {
            cache_capacity_bytes: 10,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_component_configs() {
        let config = EngineConfig {
            local_workers: 7,
            global_workers: 3,
            coalesce_timeout_ms: 25,
            ..Default::default()
        };
        assert_eq!(config.local_config().workers, 7);
        assert_eq!(config.global_config().workers, 3);
        assert_eq!(config.coalesce_timeout(), Duration::from_millis(25));
        assert_eq!(config.geometry().segment_size, DEFAULT_SEGMENT_SIZE);
    }
}
