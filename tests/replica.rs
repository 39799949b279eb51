//! Two nodes sharing a durable tier

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use common::{small_config, wait_for, TempDir};
use strata::global::{InMemoryBackend, ObjectBackend};
use strata::{BlockId, CachePeer, Error, PrimaryPeer, StorageEngine};

struct Cluster {
    _dir: TempDir,
    primary: StorageEngine,
    replica: StorageEngine,
}

/// Node 0 owns every even entity; node 1 reads through `peer`
fn cluster(tag: &str, with_peer: bool, segment_freshness_ms: u64) -> Cluster {
    let dir = TempDir::new(tag);
    let durable = Arc::new(InMemoryBackend::default());
    let open = |node_id: u32, peer: Option<Arc<dyn PrimaryPeer>>| {
        let mut config = small_config(&dir.path().join(format!("node-{node_id}")));
        config.node_id = node_id;
        config.node_count = 2;
        config.segment_freshness_ms = segment_freshness_ms;
        let backends = vec![Arc::clone(&durable) as Arc<dyn ObjectBackend>];
        StorageEngine::open(config, backends, peer).unwrap()
    };

    let primary = open(0, None);
    let peer = with_peer
        .then(|| Arc::new(CachePeer::new(Arc::clone(primary.cache()))) as Arc<dyn PrimaryPeer>);
    let replica = open(1, peer);
    Cluster {
        _dir: dir,
        primary,
        replica,
    }
}

fn write(engine: &StorageEngine, id: &BlockId, offset: usize, data: &[u8]) {
    let cache = engine.cache();
    let block = if offset == 0 {
        cache.create(id).unwrap()
    } else {
        cache.acquire(id).unwrap()
    };
    block.append(offset, data).unwrap();
    cache.release(id).unwrap();
}

fn read_all(engine: &StorageEngine, id: &BlockId) -> Vec<u8> {
    let mut buf = vec![0u8; engine.config().segment_size];
    let n = engine.read(id, 0, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

#[test]
fn test_replica_loads_from_primary() {
    let c = cluster("replica-peer", true, 10_000);
    let id = BlockId::segment(0, 1, 0);
    write(&c.primary, &id, 0, b"hello");

    assert_eq!(read_all(&c.replica, &id), b"hello");
    assert!(!c.replica.cache().is_primary(&id));
}

#[test]
fn test_replica_refreshes_after_freshness_window() {
    let c = cluster("replica-refresh", true, 50);
    let id = BlockId::segment(0, 2, 0);
    write(&c.primary, &id, 0, b"abc");
    assert_eq!(read_all(&c.replica, &id), b"abc");

    write(&c.primary, &id, 3, b"def");
    thread::sleep(Duration::from_millis(80));
    assert_eq!(read_all(&c.replica, &id), b"abcdef");
}

#[test]
fn test_replica_loads_full_segment_from_durable_tier() {
    let c = cluster("replica-durable", false, 10_000);
    let id = BlockId::segment(0, 3, 0);
    let data = common::pattern(9, c.primary.config().segment_size);
    write(&c.primary, &id, 0, &data);

    assert!(wait_for(Duration::from_secs(5), || c
        .primary
        .global()
        .contains(&id)
        .unwrap_or(false)));
    assert_eq!(read_all(&c.replica, &id), data);
    assert!(c.replica.stats().global.loads >= 1);
}

#[test]
fn test_replica_cannot_write() {
    let c = cluster("replica-write", true, 10_000);
    let id = BlockId::segment(0, 4, 0);

    assert_matches!(
        c.replica.append(&id, 0, b"nope"),
        Err(Error::ProtocolViolation(_))
    );
    assert_matches!(
        c.replica.cache().create(&BlockId::metadata(0)),
        Err(Error::ProtocolViolation(_))
    );
    assert_eq!(c.replica.cache().len(), 0);
}

#[test]
fn test_unknown_block_is_not_found() {
    let c = cluster("replica-missing", true, 10_000);
    let id = BlockId::segment(0, 99, 0);

    assert_matches!(c.replica.cache().acquire(&id), Err(Error::NotFound { .. }));
    assert_eq!(c.replica.cache().ref_count(&id), 0);
    assert_matches!(c.primary.cache().acquire(&id), Err(Error::NotFound { .. }));
}
