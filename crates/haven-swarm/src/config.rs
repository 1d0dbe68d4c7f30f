use std::time::Duration;

use serde::Deserialize;

use crate::selection::SelectionKind;

/// Default largest single assignment: 1 MiB.
pub const DEFAULT_MAX_CHUNK: u64 = 1024 * 1024;

/// Default wait before re-announcing a queued source.
pub const DEFAULT_QUEUE_RETRY_MS: u64 = 5000;

/// Tunables for one swarm download.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Largest range handed to a source at once.
    pub max_chunk_size: u64,
    pub selection: SelectionKind,
    /// Wait before a queued source asks again when the remote gave no hint.
    pub queue_retry_ms: u64,
    /// Fraction of good blocks to reject on purpose (0.0 disables).
    pub fail_rate: f64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK,
            selection: SelectionKind::Sequential,
            queue_retry_ms: DEFAULT_QUEUE_RETRY_MS,
            fail_rate: 0.0,
        }
    }
}

impl SwarmConfig {
    /// Defaults overlaid with `HAVEN_SWARM_*` environment variables.
    /// Unparsable values keep their default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let max_chunk_size = lookup("HAVEN_SWARM_MAX_CHUNK")
            .and_then(|v| v.parse().ok())
            .filter(|v: &u64| *v > 0)
            .unwrap_or(defaults.max_chunk_size);
        let selection = match lookup("HAVEN_SWARM_SELECTION").as_deref() {
            Some("random") => SelectionKind::Random,
            Some("sequential") => SelectionKind::Sequential,
            _ => defaults.selection,
        };
        let queue_retry_ms = lookup("HAVEN_SWARM_QUEUE_RETRY_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.queue_retry_ms);
        let fail_rate = lookup("HAVEN_SWARM_FAIL_RATE")
            .and_then(|v| v.parse().ok())
            .filter(|v: &f64| (0.0..=1.0).contains(v))
            .unwrap_or(defaults.fail_rate);

        Self {
            max_chunk_size,
            selection,
            queue_retry_ms,
            fail_rate,
        }
    }

    pub fn queue_retry(&self) -> Duration {
        Duration::from_millis(self.queue_retry_ms)
    }
}
