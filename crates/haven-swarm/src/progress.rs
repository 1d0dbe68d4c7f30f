/// Swarm statistics shared between the coordinator and whoever reports progress.
/// All fields are atomic for lock-free reads from a UI thread.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct SwarmProgress {
    /// Logical payload size in bytes.
    pub total_bytes: AtomicU64,
    /// Bytes currently written (verified or awaiting verification).
    pub bytes_written: AtomicU64,
    /// Bytes confirmed correct.
    pub bytes_verified: AtomicU64,
    /// Bytes thrown away after failing verification.
    pub bytes_lost: AtomicU64,
    pub verifications: AtomicU64,
    pub verification_failures: AtomicU64,
    /// Sources that ended in `FAILED`.
    pub sources_failed: AtomicU64,
    /// Ranges handed out.
    pub assignments: AtomicU64,
}

impl SwarmProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes: AtomicU64::new(total_bytes),
            bytes_written: AtomicU64::new(0),
            bytes_verified: AtomicU64::new(0),
            bytes_lost: AtomicU64::new(0),
            verifications: AtomicU64::new(0),
            verification_failures: AtomicU64::new(0),
            sources_failed: AtomicU64::new(0),
            assignments: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_coverage(&self, written: u64, verified: u64) {
        self.bytes_written.store(written, Ordering::Relaxed);
        self.bytes_verified.store(verified, Ordering::Relaxed);
    }

    pub(crate) fn record_verification(&self, passed: bool, bytes: u64) {
        self.verifications.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
            self.bytes_lost.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn lost(&self) -> u64 {
        self.bytes_lost.load(Ordering::Relaxed)
    }

    pub fn failed_sources(&self) -> u64 {
        self.sources_failed.load(Ordering::Relaxed)
    }

    /// Verified fraction 0.0 - 1.0.
    pub fn fraction(&self) -> f64 {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let done = self.bytes_verified.load(Ordering::Relaxed);
        (done as f64 / total as f64).min(1.0)
    }
}
