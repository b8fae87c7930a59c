//! Range Tracker
//!
//! Keeps the set of byte ranges durably written for a session. The set is
//! always sorted, non-overlapping, and has adjacent ranges merged, so the
//! contiguous write offset is simply the end of the first range when that
//! range starts at zero.

use super::types::ByteRange;
use crate::error::IngestError;

/// Merged set of written ranges for one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTracker {
    total_size: u64,
    ranges: Vec<ByteRange>,
}

impl RangeTracker {
    /// Create an empty tracker for an upload of `total_size` bytes
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            ranges: Vec::new(),
        }
    }

    /// Rebuild a tracker from persisted ranges.
    ///
    /// Stored ranges are re-inserted one by one, so a record written by an
    /// older version with unmerged neighbours comes back normalized.
    pub fn from_ranges(total_size: u64, ranges: &[ByteRange]) -> Result<Self, IngestError> {
        let mut tracker = Self::new(total_size);
        for range in ranges {
            tracker.insert(*range)?;
        }
        Ok(tracker)
    }

    /// Merge `range` into the set and return the resulting ranges
    pub fn insert(&mut self, range: ByteRange) -> Result<&[ByteRange], IngestError> {
        range.validate(self.total_size)?;

        // First range that could touch the new one (its end reaches range.start)
        let first = self.ranges.partition_point(|r| r.end < range.start);
        // One past the last range that could touch (its start is within range.end)
        let last = self.ranges.partition_point(|r| r.start <= range.end);

        let merged = if first < last {
            ByteRange::new(
                range.start.min(self.ranges[first].start),
                range.end.max(self.ranges[last - 1].end),
            )
        } else {
            range
        };

        self.ranges.splice(first..last, std::iter::once(merged));
        Ok(&self.ranges)
    }

    /// Length of the contiguous prefix starting at byte 0
    pub fn contiguous_offset(&self) -> u64 {
        match self.ranges.first() {
            Some(first) if first.start == 0 => first.end,
            _ => 0,
        }
    }

    /// Whether every byte of `range` is already written
    pub fn covers(&self, range: ByteRange) -> bool {
        let idx = self.ranges.partition_point(|r| r.end < range.end);
        self.ranges
            .get(idx)
            .map(|r| r.start <= range.start && range.end <= r.end)
            .unwrap_or(false)
    }

    /// Parts of `range` not yet written, in order
    pub fn gaps_in(&self, range: ByteRange) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = range.start;

        let first = self.ranges.partition_point(|r| r.end <= range.start);
        for written in &self.ranges[first..] {
            if written.start >= range.end {
                break;
            }
            if written.start > cursor {
                gaps.push(ByteRange::new(cursor, written.start));
            }
            cursor = cursor.max(written.end);
        }

        if cursor < range.end {
            gaps.push(ByteRange::new(cursor, range.end));
        }

        gaps
    }

    /// Total bytes covered, gaps excluded
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.contiguous_offset() == self.total_size
    }

    /// Gaps that still need uploading
    pub fn missing(&self) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0;

        for range in &self.ranges {
            if range.start > cursor {
                gaps.push(ByteRange::new(cursor, range.start));
            }
            cursor = range.end;
        }

        if cursor < self.total_size {
            gaps.push(ByteRange::new(cursor, self.total_size));
        }

        gaps
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn into_ranges(self) -> Vec<ByteRange> {
        self.ranges
    }
}
