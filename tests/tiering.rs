//! Durable-tier uploads, local eviction and capacity

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use common::{backends, small_config, wait_for, FlakyBackend, GatedBackend, TempDir};
use strata::block::{BlockBody, MetadataImage};
use strata::global::{
    GlobalStore, GlobalStoreConfig, InMemoryBackend, ObjectBackend, UploadSource,
};
use strata::local::{LocalStore, LocalStoreConfig, MemoryIndex};
use strata::{Block, BlockGeometry, BlockId, Error, Result, StorageEngine};

fn flaky_global(failures: u64) -> (Arc<FlakyBackend>, Arc<GlobalStore>) {
    let backend = Arc::new(FlakyBackend::new(failures));
    let global = GlobalStore::new(
        GlobalStoreConfig {
            workers: 2,
            retry_delay: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(5),
        },
        vec![Arc::clone(&backend) as Arc<dyn ObjectBackend>],
    )
    .unwrap();
    (backend, global)
}

struct Fixed(&'static [u8]);

impl UploadSource for Fixed {
    fn read_for_upload(&self, _id: &BlockId) -> Result<Bytes> {
        Ok(Bytes::from_static(self.0))
    }
}

#[test]
fn test_flaky_backend_callback_fires_once() {
    let (backend, global) = flaky_global(1);
    let id = BlockId::segment(1, 1, 0);
    let successes = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));

    {
        let successes = Arc::clone(&successes);
        let failures = Arc::clone(&failures);
        global
            .store(
                id,
                Arc::new(Fixed(b"segment bytes")),
                Some(Box::new(move |outcome| {
                    if outcome.success {
                        successes.fetch_add(1, Ordering::SeqCst);
                    } else {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                })),
            )
            .unwrap();
    }

    assert!(global.wait_idle(Duration::from_secs(5)));
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(backend.failed_puts.load(Ordering::SeqCst), 1);
    assert_eq!(global.stats().upload_failures, 1);
    assert_eq!(
        global.load(&id).unwrap().as_deref(),
        Some(&b"segment bytes"[..])
    );
    global.shutdown();
}

#[test]
fn test_flaky_upload_then_file_evictable() {
    let dir = TempDir::new("flaky-local");
    let (_backend, global) = flaky_global(1);
    let geometry = BlockGeometry {
        segment_size: 32,
        segments_per_block: 1,
        bitmap_size: 8,
    };
    let local = LocalStore::open(
        LocalStoreConfig {
            root: dir.path().to_path_buf(),
            workers: 1,
            max_blocks: 10,
            ..Default::default()
        },
        geometry,
        Arc::clone(&global),
        Arc::new(MemoryIndex::new()),
    )
    .unwrap();

    let id = BlockId::metadata(12);
    local.create_block(&id).unwrap();
    let block = Arc::new(Block::new(
        id,
        true,
        BlockBody::Metadata(MetadataImage::new()),
    ));
    block.write_metadata(0, b"inode table").unwrap();
    local.store(&block);

    assert!(block.wait_until_synced_timeout(Duration::from_secs(5)));
    assert!(wait_for(Duration::from_secs(5), || local.is_evictable(&id)));
    assert_eq!(local.stats().tiered, 1);
    assert_eq!(global.stats().upload_failures, 1);

    assert_eq!(local.evict_pass(true), 1);
    assert!(!local.exists(&id));
    assert_eq!(
        global.load(&id).unwrap().as_deref(),
        Some(&b"inode table"[..])
    );

    local.shutdown();
    global.shutdown();
}

#[test]
fn test_local_capacity_exhaustion_and_recovery() {
    let dir = TempDir::new("capacity");
    let backend = Arc::new(InMemoryBackend::default());
    let mut config = small_config(dir.path());
    config.local_max_blocks = 2;
    config.segments_per_block = 1;
    // Keep the background evictor out of the way
    config.local_evict_interval_ms = 60_000;
    let engine = StorageEngine::open(config, backends(&backend), None).unwrap();
    let cache = engine.cache();
    let segment_size = engine.config().segment_size;

    // A: one full segment, uploaded and dropped from the cache
    let a = BlockId::segment(0, 1, 0);
    let block = cache.create(&a).unwrap();
    block.append(0, &common::pattern(3, segment_size)).unwrap();
    assert!(block.is_full());
    cache.release(&a).unwrap();
    cache.flush();
    assert!(wait_for(Duration::from_secs(5), || engine.local().is_evictable(&a)));

    // B: pinned and never full
    let b = BlockId::segment(0, 2, 0);
    let block_b = cache.create(&b).unwrap();
    block_b.append(0, b"partial").unwrap();

    // C takes A's slot through a forced eviction
    let c = BlockId::metadata(1);
    cache.create(&c).unwrap();
    assert!(!engine.local().exists(&a));
    assert_eq!(engine.local().stats().evictions, 1);

    // Nothing left to evict
    assert_matches!(
        cache.create(&BlockId::metadata(2)),
        Err(Error::OutOfCapacity(_))
    );
    assert!(engine.local().stats().capacity_rejections >= 1);

    // A is still readable from the durable tier
    let mut buf = vec![0u8; segment_size];
    assert_eq!(engine.read(&a, 0, &mut buf).unwrap(), segment_size);
    assert_eq!(buf, common::pattern(3, segment_size));

    cache.release(&b).unwrap();
    cache.release(&c).unwrap();
}

#[test]
fn test_metadata_tiers_latest_image() {
    let dir = TempDir::new("meta-tier");
    let backend = Arc::new(InMemoryBackend::default());
    let engine = StorageEngine::open(small_config(dir.path()), backends(&backend), None).unwrap();
    let cache = engine.cache();
    let id = BlockId::bitmap(0);

    let block = cache.create(&id).unwrap();
    assert_eq!(block.bitmap_allocate().unwrap(), Some(0));
    assert_eq!(block.bitmap_allocate().unwrap(), Some(1));
    cache.release(&id).unwrap();
    assert!(block.wait_until_synced_timeout(Duration::from_secs(5)));

    let block = cache.acquire(&id).unwrap();
    assert!(block.bitmap_clear(0).unwrap());
    cache.release(&id).unwrap();
    assert!(block.wait_until_synced_timeout(Duration::from_secs(5)));

    assert!(wait_for(Duration::from_secs(5), || {
        engine
            .global()
            .load(&id)
            .ok()
            .flatten()
            .is_some_and(|image| image.first() == Some(&0b10))
    }));
}

#[test]
fn test_metadata_rewrite_during_upload_stays_local() {
    let dir = TempDir::new("meta-rewrite");
    let backend = Arc::new(GatedBackend::new());
    let global = GlobalStore::new(
        GlobalStoreConfig {
            workers: 2,
            retry_delay: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(5),
        },
        vec![Arc::clone(&backend) as Arc<dyn ObjectBackend>],
    )
    .unwrap();
    let local = LocalStore::open(
        LocalStoreConfig {
            root: dir.path().to_path_buf(),
            workers: 1,
            max_blocks: 10,
            ..Default::default()
        },
        BlockGeometry {
            segment_size: 32,
            segments_per_block: 1,
            bitmap_size: 8,
        },
        Arc::clone(&global),
        Arc::new(MemoryIndex::new()),
    )
    .unwrap();

    let id = BlockId::metadata(8);
    local.create_block(&id).unwrap();
    let block = Arc::new(Block::new(
        id,
        true,
        BlockBody::Metadata(MetadataImage::new()),
    ));

    // v1 is read for upload and held at the backend
    block.write_metadata(0, b"v1").unwrap();
    local.store(&block);
    assert!(block.wait_until_synced_timeout(Duration::from_secs(5)));
    assert!(wait_for(Duration::from_secs(5), || backend.started() == 1));

    // v2 lands locally while v1 is still uploading
    block.write_metadata(0, b"v2").unwrap();
    local.store(&block);
    assert!(block.wait_until_synced_timeout(Duration::from_secs(5)));

    // v1 completes; the v2 upload starts and is held
    backend.allow(1);
    assert!(wait_for(Duration::from_secs(5), || backend.started() == 2));
    assert!(!local.is_evictable(&id));
    assert_eq!(local.evict_pass(true), 0);
    assert!(local.exists(&id));

    backend.allow(1);
    assert!(wait_for(Duration::from_secs(5), || local.is_evictable(&id)));
    assert_eq!(local.evict_pass(true), 1);
    assert_eq!(global.load(&id).unwrap().as_deref(), Some(&b"v2"[..]));

    local.shutdown();
    global.shutdown();
}
