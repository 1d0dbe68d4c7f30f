use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use haven_swarm::{
    BlockHashVerifier, BlockReader, BlockVerifier, ConnectionState, FailureReason, QueueInfo,
    RandomFailVerifier, Range, RangeSet, SwarmCoordinator, SwarmOutcome,
};

fn r(start: u64, end: u64) -> Range {
    Range::new(start, end).unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

/// Counts `verify` calls on the wrapped verifier.
struct Counting {
    inner: BlockHashVerifier,
    calls: AtomicUsize,
}

impl BlockVerifier for Counting {
    fn block_size(&self) -> u64 {
        self.inner.block_size()
    }

    fn scan_verifiable(&self, written: &RangeSet, total_length: u64) -> Vec<Range> {
        self.inner.scan_verifiable(written, total_length)
    }

    fn verify(&self, range: Range, reader: &dyn BlockReader) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.verify(range, reader)
    }
}

fn assert_assignments_disjoint(coord: &SwarmCoordinator) {
    let held: Vec<Range> = coord
        .connections()
        .iter()
        .filter_map(|c| c.assignment())
        .collect();
    for (i, a) in held.iter().enumerate() {
        for b in &held[i + 1..] {
            assert!(!a.overlaps(b), "assignments {} and {} overlap", a, b);
        }
    }
    let union: RangeSet = held.iter().copied().collect();
    assert_eq!(union, coord.assigned());
}

#[test]
fn test_single_write_two_blocks_verified() {
    let data = payload(10);
    let verifier = Arc::new(Counting {
        inner: BlockHashVerifier::from_data(5, &data),
        calls: AtomicUsize::new(0),
    });
    let coord = SwarmCoordinator::new(10, verifier.clone(), Arc::new(data)).unwrap();

    let a = coord.register("a", None).unwrap();
    assert_eq!(coord.became_active(a).unwrap(), Some(r(0, 10)));
    assert_eq!(coord.write_completed(a, 0, 10).unwrap(), None);

    assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
    assert_eq!(coord.progress().verification_failures.load(Ordering::Relaxed), 0);
    assert_eq!(coord.verified(), RangeSet::from_range(r(0, 10)));
    assert!(coord.is_complete());
    assert_eq!(coord.outcome(), Some(SwarmOutcome::Complete { bytes: 10 }));
}

#[test]
fn test_failed_block_returns_to_needed() {
    let data = payload(1024);
    // Digests of different content: the only block must fail.
    let verifier = Arc::new(BlockHashVerifier::from_data(1024, &[0xAAu8; 1024]));
    let coord = SwarmCoordinator::new(1024, verifier, Arc::new(data)).unwrap();

    let a = coord.register("a", None).unwrap();
    assert_eq!(coord.became_active(a).unwrap(), Some(r(0, 1024)));
    assert_eq!(coord.write_completed(a, 0, 1024).unwrap(), None);

    assert_eq!(coord.needed(), RangeSet::from_range(r(0, 1024)));
    assert!(coord.written().is_empty());
    assert!(coord.verified().is_empty());
    assert!(!coord.is_complete());
    assert_eq!(coord.outcome(), None);
    assert_eq!(coord.progress().lost(), 1024);
}

#[test]
fn test_queued_connection_releases_assignment() {
    let data = payload(200);
    let verifier = Arc::new(BlockHashVerifier::from_data(50, &data));
    let coord = SwarmCoordinator::new(200, verifier, Arc::new(data))
        .unwrap()
        .with_max_chunk_size(100);

    let a = coord.register("a", None).unwrap();
    let b = coord.register("b", None).unwrap();

    assert_eq!(coord.became_active(a).unwrap(), Some(r(0, 100)));
    assert_assignments_disjoint(&coord);

    coord.became_queued(a, QueueInfo::new(Some(3), None)).unwrap();
    assert!(coord.needed().contains(r(0, 100)));
    assert_eq!(coord.connection(a).unwrap().state(), ConnectionState::Queued);
    assert_eq!(coord.connection(a).unwrap().assignment(), None);
    assert_assignments_disjoint(&coord);

    // The released bytes go to the next active source.
    assert_eq!(coord.became_active(b).unwrap(), Some(r(0, 100)));
    assert_assignments_disjoint(&coord);

    assert_eq!(coord.became_active(a).unwrap(), Some(r(100, 200)));
    assert_assignments_disjoint(&coord);
}

#[test]
fn test_failed_source_range_reassigned() {
    let data = payload(300);
    let verifier = Arc::new(BlockHashVerifier::from_data(100, &data));
    let coord = SwarmCoordinator::new(300, verifier, Arc::new(data))
        .unwrap()
        .with_max_chunk_size(100);

    let a = coord.register("a", None).unwrap();
    let b = coord.register("b", None).unwrap();
    assert_eq!(coord.became_active(a).unwrap(), Some(r(0, 100)));
    assert_eq!(coord.write_completed(a, 0, 40).unwrap(), Some(r(40, 100)));
    coord.failed(a, "timed out").unwrap();

    // Written bytes stay written, the unwritten remainder is free again.
    assert_eq!(coord.written(), RangeSet::from_range(r(0, 40)));
    // Cut at the block boundary.
    assert_eq!(coord.became_active(b).unwrap(), Some(r(40, 100)));
    assert_eq!(coord.progress().failed_sources(), 1);
    assert_eq!(coord.outcome(), None);

    coord.closed(b).unwrap();
    assert_eq!(
        coord.outcome(),
        Some(SwarmOutcome::Failed(FailureReason::InsufficientSources { missing: 260 }))
    );
}

#[test]
fn test_random_failures_still_complete() {
    let data = payload(4096);
    let inner: Arc<dyn BlockVerifier> = Arc::new(BlockHashVerifier::from_data(256, &data));
    let verifier = Arc::new(RandomFailVerifier::seeded(inner, 0.3, 7));
    let coord = SwarmCoordinator::new(4096, verifier, Arc::new(data))
        .unwrap()
        .with_max_chunk_size(512);

    let a = coord.register("a", None).unwrap();
    let mut rounds = 0;
    while let Some(range) = coord.became_active(a).unwrap() {
        coord.write_completed(a, range.start(), range.len()).unwrap();
        rounds += 1;
        assert!(rounds < 10_000, "transfer does not converge");
    }

    assert!(coord.is_complete());
    assert!(coord.progress().lost() > 0);
    assert_eq!(coord.progress().lost() % 256, 0);
    assert_eq!(coord.outcome(), Some(SwarmOutcome::Complete { bytes: 4096 }));
}
