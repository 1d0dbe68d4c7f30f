/// Swarm logging trait for structured transfer logs.
///
/// The coordinator and the driver report every bookkeeping decision as a
/// `SwarmEvent`, so a UI or remote collector can follow a download without
/// scraping text logs.

use std::fmt;

use uuid::Uuid;

use crate::connection::{ConnectionId, ConnectionState};
use crate::range::Range;

/// Structured log entry for a swarm operation.
#[derive(Debug, Clone)]
pub struct SwarmLog {
    pub component: &'static str,
    pub transfer_id: Uuid,
    pub event: SwarmEvent,
}

/// Swarm events that can be logged.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// A source joined the swarm
    SourceAdded {
        id: ConnectionId,
        label: String,
    },
    /// A range was handed to a source
    RangeAssigned {
        id: ConnectionId,
        range: Range,
    },
    /// A source reported bytes on disk
    RangeWritten {
        id: ConnectionId,
        range: Range,
    },
    /// A source changed flow-control state
    StateChanged {
        id: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// An assignment went back to the free pool
    RangeReleased {
        id: ConnectionId,
        range: Range,
    },
    /// A block passed verification
    BlockVerified {
        range: Range,
    },
    /// A block failed verification and must be fetched again
    BlockRejected {
        range: Range,
    },
    /// A source failed
    SourceFailed {
        id: ConnectionId,
        reason: String,
    },
    /// Transfer complete
    TransferComplete {
        total_bytes: u64,
        lost_bytes: u64,
    },
    /// Transfer stopped before completion
    TransferFailed {
        reason: String,
    },
}

impl fmt::Display for SwarmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceAdded { id, label } => {
                write!(f, "source_added id={} label={}", id, label)
            }
            Self::RangeAssigned { id, range } => {
                write!(f, "range_assigned id={} range={}", id, range)
            }
            Self::RangeWritten { id, range } => {
                write!(f, "range_written id={} range={}", id, range)
            }
            Self::StateChanged { id, from, to } => {
                write!(f, "state_changed id={} from={} to={}", id, from, to)
            }
            Self::RangeReleased { id, range } => {
                write!(f, "range_released id={} range={}", id, range)
            }
            Self::BlockVerified { range } => {
                write!(f, "block_verified range={}", range)
            }
            Self::BlockRejected { range } => {
                write!(f, "block_rejected range={}", range)
            }
            Self::SourceFailed { id, reason } => {
                write!(f, "source_failed id={} reason={}", id, reason)
            }
            Self::TransferComplete { total_bytes, lost_bytes } => {
                write!(f, "transfer_complete bytes={} lost={}", total_bytes, lost_bytes)
            }
            Self::TransferFailed { reason } => {
                write!(f, "transfer_failed reason={}", reason)
            }
        }
    }
}

/// Trait for swarm logging. Implementations can forward logs to a socket,
/// write to tracing, or discard them.
pub trait SwarmLogger: Send + Sync {
    fn log(&self, entry: SwarmLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl SwarmLogger for TracingLogger {
    fn log(&self, entry: SwarmLog) {
        // Lifecycle at info and warn, per-range chatter at debug
        match &entry.event {
            SwarmEvent::SourceAdded { .. }
            | SwarmEvent::TransferComplete { .. }
            | SwarmEvent::TransferFailed { .. } => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            SwarmEvent::BlockRejected { .. } | SwarmEvent::SourceFailed { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl SwarmLogger for NullLogger {
    fn log(&self, _entry: SwarmLog) {}
}
