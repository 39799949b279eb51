//! Write coalescing through the engine

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use common::{backends, small_config, wait_for, TempDir};
use strata::global::InMemoryBackend;
use strata::{BlockId, Error, StorageEngine};

fn open(dir: &TempDir) -> StorageEngine {
    // coalesce_timeout_ms = 30
    StorageEngine::open(
        small_config(dir.path()),
        backends(&Arc::new(InMemoryBackend::default())),
        None,
    )
    .unwrap()
}

#[test]
fn test_close_appends_share_one_cycle() {
    let dir = TempDir::new("coalesce-one");
    let engine = open(&dir);
    let id = BlockId::segment(0, 0, 0);

    engine.append(&id, 0, b"first").unwrap();
    thread::sleep(Duration::from_millis(1));
    engine.append(&id, 5, b"second").unwrap();

    let stats = engine.coalescer().stats();
    assert_eq!(stats.appends, 2);
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.armed, 1);
    assert_eq!(engine.cache().ref_count(&id), 1);

    // The sweeper releases the idle segment, which queues the flush
    assert!(wait_for(Duration::from_secs(2), || {
        engine.cache().ref_count(&id) == 0
    }));
    assert!(wait_for(Duration::from_secs(2), || engine.local().exists(&id)
        && engine.local().stats().flushes >= 1));
    assert_eq!(engine.coalescer().stats().timed_releases, 1);
}

#[test]
fn test_spaced_appends_take_two_cycles() {
    let dir = TempDir::new("coalesce-two");
    let engine = open(&dir);
    let id = BlockId::segment(0, 0, 0);

    engine.append(&id, 0, b"first").unwrap();
    // More than twice the timeout
    thread::sleep(Duration::from_millis(90));
    assert!(wait_for(Duration::from_secs(2), || {
        engine.coalescer().stats().timed_releases == 1
    }));
    engine.append(&id, 5, b"second").unwrap();

    let stats = engine.coalescer().stats();
    assert_eq!(stats.cycles, 2);

    let mut buf = [0u8; 11];
    assert_eq!(engine.read(&id, 0, &mut buf).unwrap(), 11);
    assert_eq!(&buf, b"firstsecond");
}

#[test]
fn test_full_segment_released_immediately() {
    let dir = TempDir::new("coalesce-full");
    let engine = open(&dir);
    let id = BlockId::segment(0, 3, 0);
    let segment_size = engine.config().segment_size;

    let data = common::pattern(5, segment_size + 10);
    assert_eq!(engine.append(&id, 0, &data).unwrap(), segment_size);

    let stats = engine.coalescer().stats();
    assert_eq!(stats.early_releases, 1);
    assert_eq!(stats.armed, 0);
    assert_eq!(engine.cache().ref_count(&id), 0);

    // Further appends to the full segment fail and still release
    assert_matches!(
        engine.append(&id, segment_size, b"x"),
        Err(Error::SegmentFull { .. })
    );
    assert_eq!(engine.cache().ref_count(&id), 0);
}

#[test]
fn test_bad_offset_releases() {
    let dir = TempDir::new("coalesce-offset");
    let engine = open(&dir);
    let id = BlockId::segment(0, 4, 0);

    engine.append(&id, 0, b"abc").unwrap();
    assert_matches!(
        engine.append(&id, 10, b"def"),
        Err(Error::InvalidOffset { offset: 10, expected: 3 })
    );
    assert_eq!(engine.cache().ref_count(&id), 0);
    assert_eq!(engine.coalescer().stats().armed, 0);
}
