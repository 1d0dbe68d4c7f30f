/// Byte interval algebra over one logical file.
///
/// A `Range` is a half-open `[start, end)` interval with `end > start`.
/// A `RangeSet` keeps its members sorted, non-overlapping and with touching
/// members merged, so two sets covering the same bytes always compare equal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

/// Half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "(u64, u64)", into = "(u64, u64)")]
pub struct Range {
    start: u64,
    end: u64,
}

impl Range {
    /// Build `[start, end)`. Empty or inverted input is rejected.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end <= start {
            return Err(SwarmError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Build from a closed interval `[low, high]`, as carried by
    /// `Range: bytes=low-high` headers.
    pub fn inclusive(low: u64, high: u64) -> Result<Self> {
        if high < low || high == u64::MAX {
            return Err(SwarmError::InvalidRange {
                start: low,
                end: high.saturating_add(1),
            });
        }
        Ok(Self {
            start: low,
            end: high + 1,
        })
    }

    /// Build `[start, start + len)`.
    pub fn with_len(start: u64, len: u64) -> Result<Self> {
        let end = start
            .checked_add(len)
            .ok_or(SwarmError::InvalidRange { start, end: u64::MAX })?;
        Self::new(start, end)
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered. Always positive.
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Closed-interval form `(low, high)`.
    pub fn to_inclusive(&self) -> (u64, u64) {
        (self.start, self.end - 1)
    }

    /// True if the two ranges share at least one byte.
    #[inline]
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True if one range ends exactly where the other starts.
    #[inline]
    pub fn adjacent(&self, other: &Range) -> bool {
        self.end == other.start || other.end == self.start
    }

    #[inline]
    pub fn contains_offset(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    /// True if every byte of `other` lies inside `self`.
    #[inline]
    pub fn covers(&self, other: &Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &Range) -> Option<Range> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Range { start, end })
    }

    /// Reject ranges reaching past `total`.
    pub fn check_bounds(&self, total: u64) -> Result<()> {
        if self.end > total {
            return Err(SwarmError::OutOfBounds {
                start: self.start,
                end: self.end,
                total,
            });
        }
        Ok(())
    }
}

impl TryFrom<(u64, u64)> for Range {
    type Error = SwarmError;

    fn try_from((start, end): (u64, u64)) -> Result<Self> {
        Range::new(start, end)
    }
}

impl From<Range> for (u64, u64) {
    fn from(range: Range) -> Self {
        (range.start, range.end)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Canonical set of byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Set holding exactly `range`.
    pub fn from_range(range: Range) -> Self {
        Self {
            ranges: vec![range],
        }
    }

    /// Insert `range`, merging with anything it overlaps or touches.
    pub fn add(&mut self, range: Range) {
        // [lo, hi) are the members overlapping or touching `range`.
        let lo = self.ranges.partition_point(|r| r.end < range.start);
        let hi = self.ranges.partition_point(|r| r.start <= range.end);

        let mut merged = range;
        if lo < hi {
            merged.start = merged.start.min(self.ranges[lo].start);
            merged.end = merged.end.max(self.ranges[hi - 1].end);
        }
        self.ranges.splice(lo..hi, std::iter::once(merged));
    }

    /// Exclude exactly `range`, splitting members that straddle it.
    pub fn remove(&mut self, range: Range) {
        let lo = self.ranges.partition_point(|r| r.end <= range.start);
        let hi = self.ranges.partition_point(|r| r.start < range.end);
        if lo >= hi {
            return;
        }

        let mut kept = Vec::with_capacity(2);
        let first = self.ranges[lo];
        let last = self.ranges[hi - 1];
        if first.start < range.start {
            kept.push(Range {
                start: first.start,
                end: range.start,
            });
        }
        if last.end > range.end {
            kept.push(Range {
                start: range.end,
                end: last.end,
            });
        }
        self.ranges.splice(lo..hi, kept);
    }

    pub fn add_set(&mut self, other: &RangeSet) {
        for range in &other.ranges {
            self.add(*range);
        }
    }

    pub fn remove_set(&mut self, other: &RangeSet) {
        for range in &other.ranges {
            self.remove(*range);
        }
    }

    /// Ordered gaps inside `within` that this set does not cover.
    pub fn complement(&self, within: Range) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut cursor = within.start;
        let first = self.ranges.partition_point(|r| r.end <= within.start);

        for range in &self.ranges[first..] {
            if range.start >= within.end {
                break;
            }
            if range.start > cursor {
                gaps.push(Range {
                    start: cursor,
                    end: range.start,
                });
            }
            cursor = cursor.max(range.end);
            if cursor >= within.end {
                break;
            }
        }
        if cursor < within.end {
            gaps.push(Range {
                start: cursor,
                end: within.end,
            });
        }
        gaps
    }

    /// Bytes present in both sets.
    pub fn intersect(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            if let Some(common) = a.intersection(&b) {
                out.push(common);
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        // Pieces cut from disjoint, non-touching inputs cannot touch each other.
        RangeSet { ranges: out }
    }

    /// Portion of the set falling inside `range`.
    pub fn intersect_range(&self, range: Range) -> RangeSet {
        self.intersect(&RangeSet::from_range(range))
    }

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut out = self.clone();
        out.add_set(other);
        out
    }

    pub fn difference(&self, other: &RangeSet) -> RangeSet {
        let mut out = self.clone();
        out.remove_set(other);
        out
    }

    /// True if every byte of `range` is in the set.
    pub fn contains(&self, range: Range) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges.get(idx).is_some_and(|r| r.covers(&range))
    }

    pub fn covers(&self, range: Range) -> bool {
        self.contains(range)
    }

    /// True if any byte of `range` is in the set.
    pub fn overlaps(&self, range: Range) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges.get(idx).is_some_and(|r| r.overlaps(&range))
    }

    /// Total number of bytes covered.
    pub fn len_bytes(&self) -> u64 {
        self.ranges.iter().map(Range::len).sum()
    }

    /// Number of disjoint members.
    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn first(&self) -> Option<Range> {
        self.ranges.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[Range] {
        &self.ranges
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

impl FromIterator<Range> for RangeSet {
    fn from_iter<I: IntoIterator<Item = Range>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.add(range);
        }
        set
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", range)?;
        }
        write!(f, "}}")
    }
}
