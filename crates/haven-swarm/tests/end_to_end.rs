//! Full swarm runs over in-memory transports writing to scratch directories.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use haven_swarm::{
    BlockHashVerifier, ConnectionState, FailureReason, FetchReply, FileSet, LogicalFileMap,
    NoopVerifier, NullLogger, QueueInfo, Range, RangeSet, SourceTransport, Swarm, SwarmConfig,
    SwarmOutcome,
};

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy)]
enum Behavior {
    Good,
    /// Errors on the n-th fetch.
    FailAfter(usize),
    /// Answers "queued" to the first n fetches.
    QueuedFirst(usize),
    /// Flips one byte in every reply.
    Corrupt,
    /// Never answers.
    Stalled,
}

struct MemorySource {
    label: String,
    data: Arc<Vec<u8>>,
    step: usize,
    behavior: Behavior,
    available: Option<RangeSet>,
    fetches: usize,
}

impl MemorySource {
    fn new(label: &str, data: &Arc<Vec<u8>>, step: usize, behavior: Behavior) -> Self {
        Self {
            label: label.to_string(),
            data: data.clone(),
            step,
            behavior,
            available: None,
            fetches: 0,
        }
    }

    fn holding(mut self, available: RangeSet) -> Self {
        self.available = Some(available);
        self
    }
}

impl SourceTransport for MemorySource {
    type Error = io::Error;

    fn label(&self) -> String {
        self.label.clone()
    }

    fn available(&self) -> Option<RangeSet> {
        self.available.clone()
    }

    async fn fetch(&mut self, range: Range) -> Result<FetchReply, io::Error> {
        self.fetches += 1;
        match self.behavior {
            Behavior::FailAfter(n) if self.fetches > n => {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"));
            }
            Behavior::QueuedFirst(n) if self.fetches <= n => {
                return Ok(FetchReply::Queued(QueueInfo::new(
                    Some(n as u32),
                    Some(Duration::from_millis(5)),
                )));
            }
            Behavior::Stalled => std::future::pending::<()>().await,
            _ => {}
        }
        tokio::task::yield_now().await;

        let start = range.start() as usize;
        let end = (range.end() as usize).min(start + self.step);
        let mut chunk = self.data[start..end].to_vec();
        if matches!(self.behavior, Behavior::Corrupt) {
            chunk[0] ^= 0xFF;
        }
        Ok(FetchReply::Data(Bytes::from(chunk)))
    }
}

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("haven-swarm-e2e-{}-{}", name, uuid::Uuid::new_v4()))
}

fn payload(len: usize) -> Arc<Vec<u8>> {
    Arc::new((0..len).map(|i| ((i * 131 + 7) % 256) as u8).collect())
}

fn config(max_chunk_size: u64) -> SwarmConfig {
    SwarmConfig {
        max_chunk_size,
        queue_retry_ms: 5,
        ..SwarmConfig::default()
    }
}

async fn finish(swarm: &mut Swarm) -> SwarmOutcome {
    tokio::time::timeout(TIMEOUT, swarm.wait())
        .await
        .expect("swarm did not finish in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_file_download_with_unreliable_sources() {
    let data = payload(50_000);
    let root = scratch("multi");
    let map = LogicalFileMap::new([
        ("disc/a.bin", 20_000u64),
        ("disc/empty.txt", 0),
        ("disc/b.bin", 17_000),
        ("c.bin", 13_000),
    ])
    .unwrap();
    let files = FileSet::create(&root, map).unwrap();
    let verifier = Arc::new(BlockHashVerifier::from_data(4096, &data));
    let mut swarm = Swarm::new(files, verifier, config(8192), Arc::new(NullLogger)).unwrap();

    swarm.add_source(MemorySource::new("good", &data, 3000, Behavior::Good)).unwrap();
    swarm.add_source(MemorySource::new("flaky", &data, 5000, Behavior::FailAfter(3))).unwrap();
    swarm.add_source(MemorySource::new("busy", &data, 9000, Behavior::QueuedFirst(2))).unwrap();

    let outcome = finish(&mut swarm).await;
    assert_eq!(outcome, SwarmOutcome::Complete { bytes: 50_000 });

    let coordinator = swarm.coordinator();
    assert_eq!(coordinator.progress().failed_sources(), 1);
    assert_eq!(coordinator.progress().fraction(), 1.0);
    assert!(coordinator.assigned().is_empty());

    assert_eq!(std::fs::read(root.join("disc/a.bin")).unwrap(), data[..20_000]);
    assert_eq!(std::fs::read(root.join("disc/empty.txt")).unwrap().len(), 0);
    assert_eq!(std::fs::read(root.join("disc/b.bin")).unwrap(), data[20_000..37_000]);
    assert_eq!(std::fs::read(root.join("c.bin")).unwrap(), data[37_000..]);
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_source_data_is_refetched() {
    let data = payload(32_768);
    let root = scratch("corrupt");
    let files = FileSet::create(&root, LogicalFileMap::single("out.bin", 32_768)).unwrap();
    let verifier = Arc::new(BlockHashVerifier::from_data(1024, &data));
    let mut swarm = Swarm::new(files, verifier, config(2048), Arc::new(NullLogger)).unwrap();

    swarm.add_source(MemorySource::new("liar", &data, 2048, Behavior::Corrupt)).unwrap();
    swarm.add_source(MemorySource::new("honest", &data, 1500, Behavior::Good)).unwrap();

    // Ends only when the honest source has fixed every bad block.
    let outcome = finish(&mut swarm).await;
    assert!(outcome.is_complete());
    let progress = swarm.coordinator().progress();
    assert_eq!(progress.lost() % 1024, 0);
    assert_eq!(std::fs::read(root.join("out.bin")).unwrap(), *data);
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_partial_sources_report_missing_bytes() {
    let data = payload(10_000);
    let root = scratch("partial");
    let files = FileSet::create(&root, LogicalFileMap::single("out.bin", 10_000)).unwrap();
    let verifier = Arc::new(BlockHashVerifier::from_data(1000, &data));
    let mut swarm = Swarm::new(files, verifier, config(1000), Arc::new(NullLogger)).unwrap();

    let front = RangeSet::from_range(Range::new(0, 4000).unwrap());
    let middle = RangeSet::from_range(Range::new(3000, 6000).unwrap());
    swarm
        .add_source(MemorySource::new("front", &data, 700, Behavior::Good).holding(front))
        .unwrap();
    swarm
        .add_source(MemorySource::new("middle", &data, 700, Behavior::Good).holding(middle))
        .unwrap();

    let outcome = finish(&mut swarm).await;
    assert_eq!(
        outcome,
        SwarmOutcome::Failed(FailureReason::InsufficientSources { missing: 4000 })
    );
    let coordinator = swarm.coordinator();
    assert_eq!(coordinator.verified(), RangeSet::from_range(Range::new(0, 6000).unwrap()));
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_cancel_releases_everything() {
    let data = payload(8192);
    let root = scratch("cancel");
    let files = FileSet::create(&root, LogicalFileMap::single("out.bin", 8192)).unwrap();
    let verifier = Arc::new(BlockHashVerifier::from_data(1024, &data));
    let mut swarm = Swarm::new(files, verifier, config(1024), Arc::new(NullLogger)).unwrap();

    swarm.add_source(MemorySource::new("stuck-1", &data, 1024, Behavior::Stalled)).unwrap();
    swarm.add_source(MemorySource::new("stuck-2", &data, 1024, Behavior::Stalled)).unwrap();
    let coordinator = swarm.coordinator();

    // Let both tasks take an assignment and block in fetch.
    for _ in 0..100 {
        if coordinator.assigned().len_bytes() == 2048 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(coordinator.assigned().len_bytes(), 2048);

    let outcome = tokio::time::timeout(TIMEOUT, swarm.cancel()).await.unwrap();
    assert_eq!(outcome, SwarmOutcome::Failed(FailureReason::Cancelled));
    assert!(coordinator.assigned().is_empty());
    assert!(coordinator
        .connections()
        .iter()
        .all(|c| c.state() == ConnectionState::Closed));
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_unverified_download_completes() {
    let data = payload(5000);
    let root = scratch("noop");
    let files = FileSet::create(&root, LogicalFileMap::single("out.bin", 5000)).unwrap();
    let mut swarm = Swarm::new(files, Arc::new(NoopVerifier), config(1200), Arc::new(NullLogger)).unwrap();
    swarm.add_source(MemorySource::new("only", &data, 800, Behavior::Good)).unwrap();

    assert_eq!(finish(&mut swarm).await, SwarmOutcome::Complete { bytes: 5000 });
    assert_eq!(std::fs::read(root.join("out.bin")).unwrap(), *data);
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fault_injection_still_completes() {
    let data = payload(16_384);
    let root = scratch("inject");
    let files = FileSet::create(&root, LogicalFileMap::single("out.bin", 16_384)).unwrap();
    let verifier = Arc::new(BlockHashVerifier::from_data(2048, &data));
    let config = SwarmConfig {
        fail_rate: 0.25,
        ..config(4096)
    };
    let mut swarm = Swarm::new(files, verifier, config, Arc::new(NullLogger)).unwrap();
    swarm.add_source(MemorySource::new("a", &data, 4096, Behavior::Good)).unwrap();
    swarm.add_source(MemorySource::new("b", &data, 1000, Behavior::Good)).unwrap();

    assert!(finish(&mut swarm).await.is_complete());
    let progress = swarm.coordinator().progress();
    assert_eq!(
        progress.lost(),
        progress.verification_failures.load(std::sync::atomic::Ordering::Relaxed) * 2048
    );
    assert_eq!(std::fs::read(root.join("out.bin")).unwrap(), *data);
    std::fs::remove_dir_all(&root).ok();
}
