/// Block verification capability.
///
/// The coordinator asks a verifier which fully-written blocks are ready,
/// then asks it to judge each one. Verifiers never mutate coordinator state
/// and fail closed: anything they cannot prove correct is reported as bad.

use std::io;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::range::{Range, RangeSet};

/// Largest piece a verifier reads from disk at once.
pub const DEFAULT_READ_CHUNK: u64 = 1024 * 1024;

/// Read access to already-written bytes, addressed in logical offsets.
pub trait BlockReader: Send + Sync {
    fn read_range(&self, range: Range) -> io::Result<Vec<u8>>;

    /// Feed `range` to `visit` in order, at most `max_chunk` bytes at a time.
    fn read_chunks(&self, range: Range, max_chunk: u64, visit: &mut dyn FnMut(&[u8])) -> io::Result<()> {
        let step = max_chunk.max(1);
        let mut start = range.start();
        while start < range.end() {
            let end = start.saturating_add(step).min(range.end());
            let piece = Range::new(start, end).map_err(io::Error::other)?;
            let data = self.read_range(piece)?;
            if data.len() as u64 != piece.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read for {}", piece),
                ));
            }
            visit(&data);
            start = end;
        }
        Ok(())
    }
}

fn buffer_slice(buf: &[u8], range: Range) -> io::Result<&[u8]> {
    let past_end = || io::Error::new(io::ErrorKind::UnexpectedEof, format!("range {} past end of buffer", range));
    let start = usize::try_from(range.start()).map_err(|_| past_end())?;
    let end = usize::try_from(range.end()).map_err(|_| past_end())?;
    buf.get(start..end).ok_or_else(past_end)
}

/// In-memory payload, handy for tests and small transfers.
impl BlockReader for Vec<u8> {
    fn read_range(&self, range: Range) -> io::Result<Vec<u8>> {
        buffer_slice(self, range).map(<[u8]>::to_vec)
    }

    fn read_chunks(&self, range: Range, _max_chunk: u64, visit: &mut dyn FnMut(&[u8])) -> io::Result<()> {
        visit(buffer_slice(self, range)?);
        Ok(())
    }
}

pub trait BlockVerifier: Send + Sync {
    /// Verification granularity in bytes. Always positive.
    fn block_size(&self) -> u64;

    /// Fully-written blocks eligible for verification, ascending, no duplicates.
    fn scan_verifiable(&self, written: &RangeSet, total_length: u64) -> Vec<Range>;

    /// Judge one block. Misaligned or unreadable ranges fail.
    fn verify(&self, range: Range, reader: &dyn BlockReader) -> bool;
}

/// Every `[k * block_size, (k + 1) * block_size)` window, clipped to
/// `total_length`, that lies entirely inside `written`.
pub fn aligned_blocks(written: &RangeSet, block_size: u64, total_length: u64) -> Vec<Range> {
    let mut blocks = Vec::new();
    if block_size == 0 {
        return blocks;
    }
    for range in written.iter() {
        let end = range.end().min(total_length);
        let mut block_start = range.start().div_ceil(block_size).saturating_mul(block_size);
        while block_start < end {
            let block_end = block_start.saturating_add(block_size).min(total_length);
            if block_end > end {
                break;
            }
            if let Ok(block) = Range::new(block_start, block_end) {
                blocks.push(block);
            }
            block_start = block_end;
        }
    }
    blocks
}

/// Verification disabled: nothing is ever reported as verifiable.
pub struct NoopVerifier;

impl BlockVerifier for NoopVerifier {
    fn block_size(&self) -> u64 {
        u64::MAX
    }

    fn scan_verifiable(&self, _written: &RangeSet, _total_length: u64) -> Vec<Range> {
        Vec::new()
    }

    fn verify(&self, _range: Range, _reader: &dyn BlockReader) -> bool {
        false
    }
}

/// Checks each block against a SHA-256 digest known before the transfer.
pub struct BlockHashVerifier {
    block_size: u64,
    total_length: u64,
    /// Lowercase hex SHA-256 per block, in block order.
    block_hashes: Vec<String>,
    read_chunk: u64,
}

impl BlockHashVerifier {
    pub fn new(block_size: u64, total_length: u64, block_hashes: Vec<String>) -> Self {
        Self {
            block_size: block_size.max(1),
            total_length,
            block_hashes: block_hashes.into_iter().map(|h| h.to_ascii_lowercase()).collect(),
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    /// Hash blocks in reads of at most `read_chunk` bytes.
    pub fn with_read_chunk(mut self, read_chunk: u64) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    /// One digest over the whole payload.
    pub fn whole_file(total_length: u64, sha256: impl Into<String>) -> Self {
        Self::new(total_length, total_length, vec![sha256.into()])
    }

    /// Build from the payload itself. Used by publishers and tests.
    pub fn from_data(block_size: u64, data: &[u8]) -> Self {
        let hashes = data
            .chunks(block_size.max(1) as usize)
            .map(sha256_hex)
            .collect();
        Self::new(block_size, data.len() as u64, hashes)
    }

    pub fn block_count(&self) -> usize {
        self.block_hashes.len()
    }

    fn expected(&self, range: Range) -> Option<&str> {
        if range.start() % self.block_size != 0 {
            return None;
        }
        let index = range.start() / self.block_size;
        let expected_end = range.start().saturating_add(self.block_size).min(self.total_length);
        if range.end() != expected_end {
            return None;
        }
        self.block_hashes.get(index as usize).map(String::as_str)
    }
}

impl BlockVerifier for BlockHashVerifier {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn scan_verifiable(&self, written: &RangeSet, total_length: u64) -> Vec<Range> {
        aligned_blocks(written, self.block_size, total_length.min(self.total_length))
    }

    fn verify(&self, range: Range, reader: &dyn BlockReader) -> bool {
        let Some(expected) = self.expected(range) else {
            debug!(%range, "block not aligned to a known digest");
            return false;
        };
        let mut hasher = Sha256::new();
        let mut seen = 0u64;
        let read = reader.read_chunks(range, self.read_chunk, &mut |piece| {
            hasher.update(piece);
            seen += piece.len() as u64;
        });
        match read {
            Ok(()) if seen == range.len() => hex::encode(hasher.finalize()) == expected,
            Ok(()) => {
                debug!(%range, got = seen, "short read during verification");
                false
            }
            Err(e) => {
                debug!(%range, error = %e, "read failed during verification");
                false
            }
        }
    }
}

/// Fails a fraction of otherwise-passing blocks. For resilience testing.
pub struct RandomFailVerifier {
    inner: Arc<dyn BlockVerifier>,
    fail_rate: f64,
    rng: Mutex<StdRng>,
}

impl RandomFailVerifier {
    pub fn new(inner: Arc<dyn BlockVerifier>, fail_rate: f64) -> Self {
        Self::with_rng(inner, fail_rate, StdRng::from_os_rng())
    }

    pub fn seeded(inner: Arc<dyn BlockVerifier>, fail_rate: f64, seed: u64) -> Self {
        Self::with_rng(inner, fail_rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inner: Arc<dyn BlockVerifier>, fail_rate: f64, rng: StdRng) -> Self {
        Self {
            inner,
            fail_rate: fail_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }
}

impl BlockVerifier for RandomFailVerifier {
    fn block_size(&self) -> u64 {
        self.inner.block_size()
    }

    fn scan_verifiable(&self, written: &RangeSet, total_length: u64) -> Vec<Range> {
        self.inner.scan_verifiable(written, total_length)
    }

    fn verify(&self, range: Range, reader: &dyn BlockReader) -> bool {
        if !self.inner.verify(range, reader) {
            return false;
        }
        let roll: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.random(),
            // A poisoned generator still produces numbers.
            Err(poisoned) => poisoned.into_inner().random(),
        };
        if roll < self.fail_rate {
            debug!(%range, "injected verification failure");
            return false;
        }
        true
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
