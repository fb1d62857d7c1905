// Segment Bookkeeper: remembers which time ranges were pushed to a sink and at which bitrate.
//
// The sink only reports what is buffered, not the quality of it. The bookkeeper keeps
// that information so already buffered media of good enough quality is not requested
// again. It can drift from reality when the sink evicts data on its own; `intersect`
// reconciles it with the ranges the sink reports.

use crate::ranges::{RANGE_EPSILON, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
    /// Bitrate of the Representation the data was loaded from, in bits per second.
    pub bitrate: u64,
}

impl BufferedRange {
    fn new(start: f64, end: f64, bitrate: u64) -> Self {
        Self {
            start,
            end,
            bitrate,
        }
    }

    #[inline]
    pub fn as_time_range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// Sorted, non-overlapping list of buffered ranges. Adjacent ranges with the same
/// bitrate are merged.
#[derive(Debug, Default, Clone)]
pub struct SegmentBookkeeper {
    ranges: Vec<BufferedRange>,
}

impl SegmentBookkeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[BufferedRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Records `[start, end)` as buffered at `bitrate`.
    ///
    /// Overlapped parts of existing ranges are replaced, as the sink replaces
    /// overlapped media on append.
    pub fn insert(&mut self, bitrate: u64, start: f64, end: f64) {
        if end - start <= 0.0 {
            return;
        }
        self.cut(start, end);
        let pos = self.ranges.partition_point(|r| r.start < start);
        self.ranges.insert(pos, BufferedRange::new(start, end, bitrate));
        self.merge_adjacent();
    }

    /// Forgets `[start, end)`.
    pub fn remove(&mut self, start: f64, end: f64) {
        if end - start <= 0.0 {
            return;
        }
        self.cut(start, end);
    }

    /// The range fully covering `[time, time + duration)`, if any.
    pub fn has_range(&self, time: f64, duration: f64) -> Option<BufferedRange> {
        let end = time + duration;
        self.ranges
            .iter()
            .find(|r| r.start <= time + RANGE_EPSILON && r.end >= end - RANGE_EPSILON)
            .copied()
    }

    /// The range containing `time`.
    pub fn get_range(&self, time: f64) -> Option<BufferedRange> {
        self.ranges
            .iter()
            .find(|r| time >= r.start - RANGE_EPSILON && time < r.end)
            .copied()
    }

    pub fn get_bitrate(&self, time: f64) -> Option<u64> {
        self.get_range(time).map(|r| r.bitrate)
    }

    /// Restricts the known ranges to what the sink actually reports as buffered.
    pub fn intersect(&mut self, buffered: &[TimeRange]) {
        let mut kept = Vec::with_capacity(self.ranges.len());
        for range in &self.ranges {
            let own = range.as_time_range();
            for external in buffered {
                if let Some(common) = own.intersection(external) {
                    kept.push(BufferedRange::new(common.start, common.end, range.bitrate));
                }
            }
        }
        kept.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.ranges = kept;
        self.merge_adjacent();
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    fn cut(&mut self, start: f64, end: f64) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= start || r.start >= end {
                kept.push(r);
                continue;
            }
            if start - r.start > RANGE_EPSILON {
                kept.push(BufferedRange::new(r.start, start, r.bitrate));
            }
            if r.end - end > RANGE_EPSILON {
                kept.push(BufferedRange::new(end, r.end, r.bitrate));
            }
        }
        self.ranges = kept;
    }

    fn merge_adjacent(&mut self) {
        let mut merged: Vec<BufferedRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.bitrate == r.bitrate && r.start <= last.end + RANGE_EPSILON => {
                    last.end = last.end.max(r.end);
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }
}
