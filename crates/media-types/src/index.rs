// Segment Index: resolves a Representation into concrete segment descriptors for a time window.
//
// Two shapes are supported: an explicit timeline of segments (SegmentTimeline, sidx,
// playlist entries) and a number-based template with a constant duration. Dynamic
// (live) indexes grow over time, either through manifest refreshes or through index
// information discovered inside loaded segments, and never shrink.

use crate::segment::{Segment, rescale};
use tracing::{debug, warn};

/// Upper bound on segments returned by one `get_segments` call on an unbounded template.
const MAX_SEGMENTS_PER_WINDOW: usize = 2048;

/// The requested window cannot (yet) be resolved from a dynamic index.
///
/// This is recoverable: refreshing the manifest usually extends the index.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "time {requested:.3}s is outside of the known segment index (last known position: {last_position:?})"
)]
pub struct OutOfIndexError {
    pub requested: f64,
    pub last_position: Option<f64>,
}

/// Number-based template index.
///
/// Segment `n` starts at `start_time + (n - start_number) * duration`. `media` may
/// contain `$Number$` and `$Time$` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTemplate {
    pub media: String,
    pub duration: u64,
    pub start_number: u64,
    pub start_time: u64,
    /// End of the content (static) or current live edge (dynamic), in timescale units.
    pub end_time: Option<u64>,
}

impl SegmentTemplate {
    pub fn new(media: impl Into<String>, duration: u64) -> Self {
        Self {
            media: media.into(),
            duration,
            start_number: 1,
            start_time: 0,
            end_time: None,
        }
    }

    pub fn with_start_number(mut self, start_number: u64) -> Self {
        self.start_number = start_number;
        self
    }

    pub fn with_start_time(mut self, start_time: u64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_end_time(mut self, end_time: u64) -> Self {
        self.end_time = Some(end_time);
        self
    }

    fn segment_at(&self, position: u64, timescale: u32) -> Segment {
        let number = self.start_number + position;
        let time = self.start_time + position * self.duration;
        let mut duration = self.duration;
        if let Some(end) = self.end_time {
            if time + duration > end {
                duration = end.saturating_sub(time);
            }
        }
        let url = self
            .media
            .replace("$Number$", &number.to_string())
            .replace("$Time$", &time.to_string());
        Segment::media(number.to_string(), time, duration, timescale).with_url(url)
    }

    fn rescale(&mut self, from: u32, to: u32) {
        self.duration = rescale(self.duration, from, to);
        self.start_time = rescale(self.start_time, from, to);
        self.end_time = self.end_time.map(|end| rescale(end, from, to));
    }

    /// Last segment boundary that is fully available.
    fn last_complete_boundary(&self) -> Option<u64> {
        let end = self.end_time?;
        let duration = self.duration.max(1);
        let complete = end.saturating_sub(self.start_time) / duration;
        Some(self.start_time + complete * duration)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum IndexKind {
    Timeline(Vec<Segment>),
    Template(SegmentTemplate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentIndex {
    timescale: u32,
    init: Option<Segment>,
    kind: IndexKind,
    dynamic: bool,
    finished: bool,
}

impl SegmentIndex {
    /// Index backed by an explicit list of segments. Entries are sorted by time.
    pub fn timeline(timescale: u32, init: Option<Segment>, entries: Vec<Segment>, dynamic: bool) -> Self {
        let timescale = timescale.max(1);
        let mut timeline: Vec<Segment> = Vec::with_capacity(entries.len());
        insert_timeline_entries(&mut timeline, &entries, timescale, 0);
        Self {
            timescale,
            init,
            kind: IndexKind::Timeline(timeline),
            dynamic,
            finished: !dynamic,
        }
    }

    pub fn template(timescale: u32, init: Option<Segment>, template: SegmentTemplate, dynamic: bool) -> Self {
        Self {
            timescale: timescale.max(1),
            init,
            kind: IndexKind::Template(template),
            dynamic,
            finished: !dynamic,
        }
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// No segment will ever be added to this index.
    pub fn is_finished(&self) -> bool {
        !self.dynamic || self.finished
    }

    /// Marks a dynamic index as complete (the live content ended).
    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    pub fn init_segment(&self) -> Option<Segment> {
        self.init.clone()
    }

    /// Start of the first known segment, in seconds.
    pub fn first_position(&self) -> Option<f64> {
        match &self.kind {
            IndexKind::Timeline(entries) => entries.first().map(Segment::start_secs),
            IndexKind::Template(t) => Some(t.start_time as f64 / f64::from(self.timescale)),
        }
    }

    /// End of the last available segment, in seconds. `None` for unbounded templates.
    pub fn last_position(&self) -> Option<f64> {
        let end = match &self.kind {
            IndexKind::Timeline(entries) => entries.last().map(Segment::end),
            IndexKind::Template(t) if self.is_finished() => t.end_time,
            IndexKind::Template(t) => t.last_complete_boundary(),
        }?;
        Some(end as f64 / f64::from(self.timescale))
    }

    /// Returns the segments overlapping `[time - padding, time - padding + duration]`.
    ///
    /// A dynamic index whose known content ends before the window start returns an
    /// [`OutOfIndexError`].
    pub fn get_segments(&self, time: f64, padding: f64, duration: f64) -> Result<Vec<Segment>, OutOfIndexError> {
        let start = (time - padding).max(0.0);
        let end = time - padding + duration;
        if !(end > start) {
            return Ok(Vec::new());
        }

        let scale = f64::from(self.timescale);
        let from = (start * scale).floor() as u64;
        let to = if end.is_finite() {
            (end * scale).ceil() as u64
        } else {
            u64::MAX
        };

        match &self.kind {
            IndexKind::Timeline(entries) => {
                if !self.is_finished() {
                    let exhausted = entries.last().is_none_or(|last| from >= last.end());
                    if exhausted {
                        return Err(self.out_of_index(start));
                    }
                }
                Ok(entries
                    .iter()
                    .filter(|seg| seg.end() > from && seg.time < to)
                    .cloned()
                    .collect())
            }
            IndexKind::Template(t) => {
                let available_end = if self.is_finished() {
                    t.end_time
                } else {
                    t.last_complete_boundary()
                };
                if let Some(available_end) = available_end {
                    if from >= available_end {
                        if self.is_finished() {
                            return Ok(Vec::new());
                        }
                        return Err(self.out_of_index(start));
                    }
                } else if !self.is_finished() {
                    return Err(self.out_of_index(start));
                }

                let duration = t.duration.max(1);
                let mut position = from.saturating_sub(t.start_time) / duration;
                let mut segments = Vec::new();
                loop {
                    let seg_time = t.start_time + position * duration;
                    if seg_time >= to {
                        break;
                    }
                    if available_end.is_some_and(|available| seg_time >= available) {
                        break;
                    }
                    segments.push(t.segment_at(position, self.timescale));
                    if segments.len() >= MAX_SEGMENTS_PER_WINDOW {
                        warn!(
                            start,
                            end,
                            "Segment window truncated, too many template segments requested"
                        );
                        break;
                    }
                    position += 1;
                }
                Ok(segments)
            }
        }
    }

    /// Whether a window ending at `end` (seconds) reaches beyond what a live index
    /// currently knows, meaning a manifest refresh would be useful.
    pub fn should_refresh(&self, end: f64) -> bool {
        if self.is_finished() {
            return false;
        }
        self.last_position().is_none_or(|last| end > last)
    }

    /// Merges segment metadata discovered while loading `reference` (e.g. from a
    /// `sidx` box or live-edge hints).
    ///
    /// Idempotent: segments overlapping an already known one are ignored. Returns
    /// whether the index changed.
    pub fn insert_new_segments(&mut self, segments: &[Segment], reference: &Segment) -> bool {
        let timescale = self.timescale;
        let min_time = if reference.is_init {
            0
        } else {
            reference.rescaled(timescale).time
        };
        match &mut self.kind {
            IndexKind::Timeline(entries) => {
                let inserted = insert_timeline_entries(entries, segments, timescale, min_time);
                if inserted > 0 {
                    debug!(inserted, reference = %reference.id, "Inserted new segments into timeline index");
                }
                inserted > 0
            }
            IndexKind::Template(t) => {
                if !self.dynamic {
                    return false;
                }
                let new_end = segments
                    .iter()
                    .filter(|s| s.has_timing())
                    .map(|s| s.rescaled(timescale).end())
                    .max();
                match new_end {
                    Some(end) if t.end_time.is_none_or(|current| end > current) => {
                        t.end_time = Some(end);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    /// Updates the timescale once it is learned from parsed media. Known entries
    /// keep their position in seconds.
    pub fn set_timescale(&mut self, timescale: u32) {
        if timescale == 0 || timescale == self.timescale {
            return;
        }
        let previous = self.timescale;
        match &mut self.kind {
            IndexKind::Timeline(entries) => {
                for entry in entries.iter_mut() {
                    *entry = entry.rescaled(timescale);
                }
            }
            IndexKind::Template(t) => t.rescale(previous, timescale),
        }
        debug!(previous, timescale, "Segment index timescale updated");
        self.timescale = timescale;
    }

    /// Merges the index of the same Representation coming from a refreshed manifest.
    /// Known segments are never removed.
    pub fn merge_update(&mut self, newer: &SegmentIndex) {
        self.dynamic = newer.dynamic;
        self.finished = newer.finished;
        if self.init.is_none() {
            self.init = newer.init.clone();
        }

        let timescale = self.timescale;
        match (&mut self.kind, &newer.kind) {
            (IndexKind::Timeline(entries), IndexKind::Timeline(new_entries)) => {
                insert_timeline_entries(entries, new_entries, timescale, 0);
            }
            (IndexKind::Template(current), IndexKind::Template(new)) => {
                let mut new = new.clone();
                new.rescale(newer.timescale, timescale);
                current.end_time = match (current.end_time, new.end_time) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            _ => {
                warn!("Segment index kind changed on manifest update, replacing index");
                *self = newer.clone();
            }
        }
    }

    fn out_of_index(&self, requested: f64) -> OutOfIndexError {
        OutOfIndexError {
            requested,
            last_position: self.last_position(),
        }
    }
}

/// Inserts timed segments not overlapping any existing entry, keeping time order.
fn insert_timeline_entries(entries: &mut Vec<Segment>, segments: &[Segment], timescale: u32, min_time: u64) -> usize {
    let mut inserted = 0;
    for seg in segments.iter().filter(|s| s.has_timing()) {
        let seg = seg.rescaled(timescale);
        if seg.time < min_time {
            continue;
        }
        let pos = entries.partition_point(|e| e.time < seg.time);
        let overlaps_prev = pos > 0 && entries[pos - 1].end() > seg.time;
        let overlaps_next = pos < entries.len() && entries[pos].time < seg.end();
        if overlaps_prev || overlaps_next {
            continue;
        }
        entries.insert(pos, seg);
        inserted += 1;
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn timeline(count: u64, dynamic: bool) -> SegmentIndex {
        let entries = (0..count)
            .map(|i| Segment::media(format!("s{i}"), i * 2_000, 2_000, 1_000))
            .collect();
        SegmentIndex::timeline(1_000, Some(Segment::init("init")), entries, dynamic)
    }

    #[test]
    fn timeline_window_selection() {
        let index = timeline(10, false);
        let segs = index.get_segments(5.0, 1.0, 4.0).unwrap();
        // window [4, 8]
        let ids: Vec<_> = segs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s3"]);
    }

    #[test]
    fn window_start_is_clamped_to_zero() {
        let index = timeline(10, false);
        // window [-3, 3]
        let segs = index.get_segments(1.0, 4.0, 6.0).unwrap();
        let ids: Vec<_> = segs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1"]);
    }

    #[test]
    fn static_index_past_end_is_empty() {
        let index = timeline(3, false);
        assert!(index.get_segments(100.0, 0.0, 10.0).unwrap().is_empty());
    }

    #[test]
    fn dynamic_index_past_end_is_out_of_index() {
        let index = timeline(3, true);
        let err = index.get_segments(10.0, 0.0, 10.0).unwrap_err();
        assert_eq!(err.last_position, Some(6.0));
        assert_eq!(err.requested, 10.0);
    }

    #[test]
    fn empty_window_returns_nothing() {
        let index = timeline(3, true);
        assert!(index.get_segments(2.0, 0.0, 0.0).unwrap().is_empty());
    }

    #[test]
    fn insert_new_segments_is_idempotent() {
        let mut index = timeline(3, true);
        let reference = Segment::media("s2", 4_000, 2_000, 1_000);
        let discovered = vec![
            Segment::media("s3", 6_000, 2_000, 1_000),
            Segment::media("s4", 8_000, 2_000, 1_000),
        ];

        assert!(index.insert_new_segments(&discovered, &reference));
        let once = index.clone();
        assert!(!index.insert_new_segments(&discovered, &reference));
        assert_eq!(index, once);
        assert_eq!(index.last_position(), Some(10.0));
    }

    #[test]
    fn insert_new_segments_keeps_order_and_skips_overlaps() {
        let mut index = timeline(2, true);
        let reference = Segment::init("init");
        let discovered = vec![
            Segment::media("late", 10_000, 2_000, 1_000),
            Segment::media("overlap", 3_000, 2_000, 1_000),
            Segment::media("gap", 6_000, 2_000, 1_000),
        ];
        index.insert_new_segments(&discovered, &reference);
        let segs = index.get_segments(0.0, 0.0, 20.0).unwrap();
        let ids: Vec<_> = segs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "gap", "late"]);
    }

    #[test]
    fn insert_new_segments_in_other_timescale() {
        let mut index = timeline(1, true);
        let reference = Segment::media("s0", 0, 2_000, 1_000);
        let discovered = vec![Segment::media("s1", 180_000, 180_000, 90_000)];
        assert!(index.insert_new_segments(&discovered, &reference));
        assert_eq!(index.last_position(), Some(4.0));
    }

    #[test]
    fn set_timescale_preserves_positions() {
        let mut index = timeline(3, false);
        index.set_timescale(90_000);
        assert_eq!(index.timescale(), 90_000);
        assert_eq!(index.last_position(), Some(6.0));
        let segs = index.get_segments(2.0, 0.0, 2.0).unwrap();
        assert_eq!(segs[0].time, 180_000);
    }

    #[rstest]
    #[case(0.0, 4.0, vec!["1", "2"])]
    #[case(3.0, 2.0, vec!["2", "3"])]
    #[case(9.0, 10.0, vec!["5"])]
    fn template_window(#[case] time: f64, #[case] duration: f64, #[case] expected: Vec<&str>) {
        let template = SegmentTemplate::new("seg-$Number$.m4s", 2).with_end_time(10);
        let index = SegmentIndex::template(1, None, template, false);
        let segs = index.get_segments(time, 0.0, duration).unwrap();
        let ids: Vec<_> = segs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn template_builds_urls() {
        let template = SegmentTemplate::new("v/$Number$-$Time$.m4s", 4).with_start_number(10);
        let index = SegmentIndex::template(1, None, template, false);
        let segs = index.get_segments(4.0, 0.0, 1.0).unwrap();
        assert_eq!(segs[0].url.as_deref(), Some("v/11-4.m4s"));
    }

    #[test]
    fn static_template_truncates_last_segment() {
        let template = SegmentTemplate::new("s", 4).with_end_time(10);
        let index = SegmentIndex::template(1, None, template, false);
        let segs = index.get_segments(8.0, 0.0, 10.0).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].duration, 2);
    }

    #[test]
    fn live_template_grows_and_never_shrinks() {
        let template = SegmentTemplate::new("s", 2).with_end_time(10);
        let mut index = SegmentIndex::template(1, None, template, true);
        assert!(index.get_segments(10.0, 0.0, 4.0).is_err());

        let reference = Segment::media("5", 8, 2, 1);
        assert!(index.insert_new_segments(&[Segment::media("6", 10, 2, 1)], &reference));
        assert_eq!(index.get_segments(10.0, 0.0, 4.0).unwrap().len(), 1);

        let older = SegmentIndex::template(1, None, SegmentTemplate::new("s", 2).with_end_time(8), true);
        index.merge_update(&older);
        assert_eq!(index.last_position(), Some(12.0));
    }

    #[test]
    fn live_template_only_exposes_complete_segments() {
        let template = SegmentTemplate::new("s", 4).with_end_time(10);
        let index = SegmentIndex::template(1, None, template, true);
        assert_eq!(index.last_position(), Some(8.0));
        assert!(index.get_segments(8.5, 0.0, 2.0).is_err());
    }

    #[test]
    fn merge_update_extends_timeline() {
        let mut index = timeline(3, true);
        let newer = timeline(5, true);
        index.merge_update(&newer);
        assert_eq!(index.last_position(), Some(10.0));
        assert!(index.get_segments(8.0, 0.0, 2.0).is_ok());
    }

    #[test]
    fn should_refresh_only_for_live_windows_past_edge() {
        let live = timeline(3, true);
        assert!(live.should_refresh(7.0));
        assert!(!live.should_refresh(5.0));
        let vod = timeline(3, false);
        assert!(!vod.should_refresh(100.0));
    }
}
