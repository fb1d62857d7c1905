// Time range helpers shared by the bookkeeper, the garbage collector and the switch strategy.

use serde::{Deserialize, Serialize};

/// Tolerance used when comparing range edges, in seconds.
pub const RANGE_EPSILON: f64 = 1.0 / 60.0;

/// A half-open `[start, end)` interval in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    #[inline]
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    #[inline]
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (end - start > RANGE_EPSILON).then_some(TimeRange { start, end })
    }

    /// Distance from `time` to the closest point of the range, 0 when inside.
    pub fn distance_to(&self, time: f64) -> f64 {
        if time < self.start {
            self.start - time
        } else if time >= self.end {
            time - self.end
        } else {
            0.0
        }
    }
}

/// The range containing `time`, tolerating a small gap before its start.
pub fn range_containing(ranges: &[TimeRange], time: f64) -> Option<TimeRange> {
    ranges
        .iter()
        .find(|r| time >= r.start - RANGE_EPSILON && time < r.end)
        .copied()
}

/// Distance between `time` and the closest range edge, if anything is buffered.
pub fn nearest_edge_distance(ranges: &[TimeRange], time: f64) -> Option<f64> {
    ranges
        .iter()
        .flat_map(|r| [(r.start - time).abs(), (r.end - time).abs()])
        .min_by(f64::total_cmp)
}

/// Parts of `ranges` inside `[start, end)`.
pub fn clip(ranges: &[TimeRange], start: f64, end: f64) -> Vec<TimeRange> {
    let bounds = TimeRange::new(start, end);
    ranges.iter().filter_map(|r| r.intersection(&bounds)).collect()
}

/// Parts of `ranges` outside the `(start, end)` window.
pub fn exclude(ranges: &[TimeRange], start: f64, end: f64) -> Vec<TimeRange> {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for r in ranges {
        if r.end <= start || r.start >= end {
            out.push(*r);
            continue;
        }
        if r.start < start && start - r.start > RANGE_EPSILON {
            out.push(TimeRange::new(r.start, start));
        }
        if r.end > end && r.end - end > RANGE_EPSILON {
            out.push(TimeRange::new(end, r.end));
        }
    }
    out
}

/// Sorts and merges overlapping or touching ranges.
pub fn normalize(ranges: &mut Vec<TimeRange>) {
    ranges.retain(|r| r.end > r.start);
    ranges.sort_by(|a, b| a.start.total_cmp(&b.start));
    let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if r.start <= last.end + RANGE_EPSILON => last.end = last.end.max(r.end),
            _ => merged.push(r),
        }
    }
    *ranges = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: f64, end: f64) -> TimeRange {
        TimeRange::new(start, end)
    }

    #[test]
    fn containing_range_tolerates_small_gaps() {
        let ranges = [r(0.0, 10.0), r(20.0, 30.0)];
        assert_eq!(range_containing(&ranges, 5.0), Some(r(0.0, 10.0)));
        assert_eq!(range_containing(&ranges, 19.995), Some(r(20.0, 30.0)));
        assert_eq!(range_containing(&ranges, 15.0), None);
        assert_eq!(range_containing(&ranges, 10.0), None);
    }

    #[test]
    fn nearest_edge() {
        let ranges = [r(0.0, 10.0), r(20.0, 30.0)];
        assert_eq!(nearest_edge_distance(&ranges, 12.0), Some(2.0));
        assert_eq!(nearest_edge_distance(&ranges, 21.0), Some(1.0));
        assert_eq!(nearest_edge_distance(&[], 21.0), None);
    }

    #[test]
    fn clip_and_exclude() {
        let ranges = [r(0.0, 10.0), r(20.0, 30.0)];
        assert_eq!(clip(&ranges, 5.0, 25.0), vec![r(5.0, 10.0), r(20.0, 25.0)]);
        assert_eq!(
            exclude(&ranges, 8.0, 22.0),
            vec![r(0.0, 8.0), r(22.0, 30.0)]
        );
        assert_eq!(exclude(&ranges, -5.0, 40.0), vec![]);
    }

    #[test]
    fn normalize_merges_touching() {
        let mut ranges = vec![r(10.0, 20.0), r(0.0, 10.0), r(25.0, 30.0), r(28.0, 29.0)];
        normalize(&mut ranges);
        assert_eq!(ranges, vec![r(0.0, 20.0), r(25.0, 30.0)]);
    }
}
