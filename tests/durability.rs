//! Persistence across the local tier and engine restarts

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;

use common::{backends, pattern, small_config, wait_for, GatedBackend, TempDir};
use strata::block::{BlockBody, Segment};
use strata::global::{GlobalStore, GlobalStoreConfig, InMemoryBackend, ObjectBackend};
use strata::local::{JournalIndex, LocalStore, LocalStoreConfig};
use strata::{Block, BlockGeometry, BlockId, StorageEngine};

#[test]
fn test_reopen_returns_appended_bytes() {
    let dir = TempDir::new("reopen");
    let backend = Arc::new(InMemoryBackend::default());
    let segment = BlockId::segment(0, 7, 1);
    let meta = BlockId::metadata(3);
    let data = pattern(9, 40);

    {
        let engine =
            StorageEngine::open(small_config(dir.path()), backends(&backend), None).unwrap();
        assert_eq!(engine.append(&segment, 0, &data[..25]).unwrap(), 25);
        assert_eq!(engine.append(&segment, 25, &data[25..]).unwrap(), 15);

        let block = engine.cache().create(&meta).unwrap();
        block.write_metadata(0, b"directory image").unwrap();
        engine.cache().release(&meta).unwrap();
        engine.shutdown();
    }

    let engine = StorageEngine::open(small_config(dir.path()), backends(&backend), None).unwrap();
    assert_eq!(engine.local().resident_count(), 2);

    let mut buf = vec![0u8; 64];
    let n = engine.read(&segment, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], &data[..]);

    let block = engine.cache().acquire(&meta).unwrap();
    assert_eq!(&block.snapshot()[..], b"directory image");
    engine.cache().release(&meta).unwrap();
}

#[test]
fn test_torn_read_never_observed() {
    const SEGMENT: usize = 1024 * 1024;
    const CHUNK: usize = 100 * 1024;

    let dir = TempDir::new("torn");
    let mut config = small_config(dir.path());
    config.segment_size = SEGMENT;
    config.cache_capacity_bytes = 4 * SEGMENT;
    let engine = StorageEngine::open(
        config,
        backends(&Arc::new(InMemoryBackend::default())),
        None,
    )
    .unwrap();

    let id = BlockId::segment(0, 1, 0);
    let block = engine.cache().create(&id).unwrap();
    let expected: Vec<u8> = pattern(1, 10 * CHUNK);
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let block = Arc::clone(&block);
        let expected = expected.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut buf = vec![0u8; CHUNK];
            let mut reads = 0u64;
            while !done.load(Ordering::Acquire) || reads == 0 {
                let n = block.read(0, &mut buf).unwrap();
                // Whatever is visible must be exactly what was appended
                assert_eq!(&buf[..n], &expected[..n]);
                reads += 1;
            }
            reads
        })
    };

    for i in 0..10 {
        let chunk = &expected[i * CHUNK..(i + 1) * CHUNK];
        assert_eq!(block.append(i * CHUNK, chunk).unwrap(), CHUNK);
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);

    let mut buf = vec![0u8; CHUNK];
    assert_eq!(block.read(0, &mut buf).unwrap(), CHUNK);
    assert_eq!(&buf[..], &expected[..CHUNK]);
    engine.cache().release(&id).unwrap();
}

fn chunks() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..20, 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_chunked_appends_round_trip(writes in chunks(), read_size in 1usize..30) {
        let dir = TempDir::new("chunks");
        let engine = StorageEngine::open(
            small_config(dir.path()),
            backends(&Arc::new(InMemoryBackend::default())),
            None,
        )
        .unwrap();
        let segment_size = engine.config().segment_size;
        let id = BlockId::segment(2, 0, 0);
        let block = engine.cache().create(&id).unwrap();

        let mut expected = Vec::new();
        for (i, len) in writes.into_iter().enumerate() {
            let room = segment_size - expected.len();
            if room == 0 {
                break;
            }
            let chunk = pattern(i as u8, len.min(room));
            let n = block.append(expected.len(), &chunk).unwrap();
            expected.extend_from_slice(&chunk[..n]);
        }

        // Read back in a different chunking
        let mut seen = Vec::new();
        let mut buf = vec![0u8; read_size];
        loop {
            let n = block.read(seen.len(), &mut buf).unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        prop_assert_eq!(&seen, &expected);

        // And again from the local file after write-back
        engine.cache().release(&id).unwrap();
        prop_assert!(block.wait_until_synced_timeout(Duration::from_secs(5)));
        let fresh = Block::new(id, true, BlockBody::Segment(Segment::new(0, segment_size, Vec::new())));
        prop_assert!(engine.local().load(&fresh).unwrap());
        prop_assert_eq!(&fresh.snapshot()[..], &expected[..]);
    }
}

fn node_stores(
    root: &std::path::Path,
    backend: Arc<dyn ObjectBackend>,
) -> (Arc<GlobalStore>, Arc<LocalStore>) {
    let global = GlobalStore::new(
        GlobalStoreConfig {
            workers: 1,
            retry_delay: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(5),
        },
        vec![backend],
    )
    .unwrap();
    let index = Arc::new(JournalIndex::open(root.join("index.jsonl")).unwrap());
    let local = LocalStore::open(
        LocalStoreConfig {
            root: root.to_path_buf(),
            workers: 1,
            max_blocks: 10,
            evict_interval: Duration::from_millis(20),
            ..Default::default()
        },
        BlockGeometry {
            segment_size: 32,
            segments_per_block: 1,
            bitmap_size: 8,
        },
        Arc::clone(&global),
        index,
    )
    .unwrap();
    (global, local)
}

#[test]
fn test_untiered_full_segment_uploaded_after_restart() {
    let dir = TempDir::new("recover-tier");
    let id = BlockId::segment(5, 0, 0);
    let data = pattern(7, 32);

    // First run: the segment is full on disk but its upload never finishes
    let stalled = Arc::new(GatedBackend::new());
    let (global, local) = node_stores(dir.path(), Arc::clone(&stalled) as Arc<dyn ObjectBackend>);
    local.create_block(&id).unwrap();
    let block = Arc::new(Block::new(
        id,
        true,
        BlockBody::Segment(Segment::new(0, 32, Vec::new())),
    ));
    assert_eq!(block.append(0, &data).unwrap(), 32);
    local.store(&block);
    assert!(block.wait_until_synced_timeout(Duration::from_secs(5)));
    assert!(wait_for(Duration::from_secs(5), || stalled.started() == 1));

    // Second run over the same directory with a healthy durable tier
    let durable = Arc::new(InMemoryBackend::default());
    let (global2, local2) = node_stores(dir.path(), Arc::clone(&durable) as Arc<dyn ObjectBackend>);
    assert_eq!(local2.resident_count(), 1);
    assert!(wait_for(Duration::from_secs(5), || durable
        .keys()
        .contains(&id.object_key())));
    assert!(wait_for(Duration::from_secs(5), || local2.is_evictable(&id)));
    assert_eq!(global2.load(&id).unwrap().as_deref(), Some(&data[..]));

    // A load of the recovered file still reports it full
    let fresh = Block::new(id, true, BlockBody::Segment(Segment::new(0, 32, Vec::new())));
    assert!(local2.load(&fresh).unwrap());
    assert!(fresh.is_full());

    stalled.open();
    local.shutdown();
    global.shutdown();
    local2.shutdown();
    global2.shutdown();
}
