/// Range selection heuristics.
///
/// Given the bytes a connection could fetch right now, a strategy picks the
/// next assignment. The coordinator owns the strategy, so swapping heuristics
/// never touches the bookkeeping.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::range::{Range, RangeSet};

pub trait SelectionStrategy: Send + Sync {
    /// Pick a non-empty sub-range of `candidates`, at most `max_chunk` bytes.
    fn pick(&self, candidates: &RangeSet, max_chunk: u64, block_size: u64) -> Option<Range>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind {
    #[default]
    Sequential,
    Random,
}

impl SelectionKind {
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            Self::Sequential => Box::new(SequentialStrategy),
            Self::Random => Box::new(RandomStrategy::new()),
        }
    }
}

/// Lowest offset first. Favors playback of a partially downloaded file.
pub struct SequentialStrategy;

impl SelectionStrategy for SequentialStrategy {
    fn pick(&self, candidates: &RangeSet, max_chunk: u64, block_size: u64) -> Option<Range> {
        let gap = candidates.first()?;
        chunk_from(gap, gap.start(), max_chunk, block_size)
    }
}

/// Random gap, random block-aligned start inside it.
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RandomStrategy {
    fn pick(&self, candidates: &RangeSet, max_chunk: u64, block_size: u64) -> Option<Range> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };

        let gap = candidates.as_slice()[rng.random_range(0..candidates.count())];
        let block = block_size.max(1);
        // Block boundaries strictly inside the gap, plus the gap start itself.
        let first_boundary = gap.start().div_ceil(block).saturating_mul(block);
        let start = if first_boundary < gap.end() && block < u64::MAX {
            let boundaries = (gap.end() - 1 - first_boundary) / block + 1;
            let choice = rng.random_range(0..=boundaries);
            if choice == 0 {
                gap.start()
            } else {
                first_boundary + (choice - 1) * block
            }
        } else {
            gap.start()
        };
        chunk_from(gap, start, max_chunk, block_size)
    }
}

/// `[start, start + max_chunk)` clipped to `gap`. A chunk cut short of the
/// gap end is rounded down to a block boundary when that leaves bytes.
fn chunk_from(gap: Range, start: u64, max_chunk: u64, block_size: u64) -> Option<Range> {
    let limit = start.saturating_add(max_chunk.max(1));
    let mut end = gap.end().min(limit);
    if end < gap.end() && block_size > 0 {
        let aligned = end / block_size * block_size;
        if aligned > start {
            end = aligned;
        }
    }
    Range::new(start, end).ok()
}
