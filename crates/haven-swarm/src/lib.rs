/// Haven Swarm: multi-source segmented download engine.
///
/// Reconstructs one logical payload (a single file or a concatenated file
/// set) from many sources at once:
/// - Byte-exact bookkeeping of needed / assigned / written / verified ranges
/// - Non-overlapping assignments, one per source
/// - Per-source flow control (active, queued, failed, closed)
/// - Pluggable block verification with SHA-256 block hashes
/// - Failed blocks and abandoned assignments flow back into the free pool
/// - Positioned writes across a multi-file layout

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod file_map;
pub mod logging;
pub mod progress;
pub mod range;
pub mod selection;
pub mod storage;
pub mod swarm;
pub mod verifier;

// Re-export key types for convenience.
pub use config::{DEFAULT_MAX_CHUNK, DEFAULT_QUEUE_RETRY_MS, SwarmConfig};
pub use connection::{ConnectionId, ConnectionState, QueueInfo, SourceConnection};
pub use coordinator::{CoverageSnapshot, FailureReason, SwarmCoordinator, SwarmOutcome};
pub use error::{Result, SwarmError};
pub use file_map::{FileEntry, FileFragment, LogicalFileMap};
pub use logging::{NullLogger, SwarmEvent, SwarmLog, SwarmLogger, TracingLogger};
pub use progress::SwarmProgress;
pub use range::{Range, RangeSet};
pub use selection::{RandomStrategy, SelectionKind, SelectionStrategy, SequentialStrategy};
pub use storage::FileSet;
pub use swarm::{FetchReply, SourceTransport, Swarm};
pub use verifier::{
    BlockHashVerifier, BlockReader, BlockVerifier, DEFAULT_READ_CHUNK, NoopVerifier,
    RandomFailVerifier, aligned_blocks, sha256_hex,
};
