// Manifest model: Period -> Adaptation -> Representation trees shared with the buffering engine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::index::SegmentIndex;
use crate::track::TrackType;

pub type SharedSegmentIndex = Arc<RwLock<SegmentIndex>>;
pub type SharedManifest = Arc<RwLock<Manifest>>;

/// Picture size of a video Representation, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Frame height of the usual 16:9 rung of a bitrate ladder ("720p").
    pub fn from_height(height: u32) -> Self {
        Self::new(height.div_ceil(9) * 16, height)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}p", self.height)
    }
}

/// One quality variant of a track.
#[derive(Debug)]
pub struct Representation {
    pub id: String,
    /// Average bitrate in bits per second.
    pub bitrate: u64,
    pub codec: Option<String>,
    pub mime_type: Option<String>,
    pub resolution: Option<Resolution>,
    /// Mutated in place while segments are loaded and on manifest refresh.
    pub index: SharedSegmentIndex,
}

impl Representation {
    pub fn new(id: impl Into<String>, bitrate: u64, index: SegmentIndex) -> Self {
        Self {
            id: id.into(),
            bitrate,
            codec: None,
            mime_type: None,
            resolution: None,
            index: Arc::new(RwLock::new(index)),
        }
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }
}

/// A selectable track within a Period.
#[derive(Debug)]
pub struct Adaptation {
    pub id: String,
    pub track_type: TrackType,
    pub language: Option<String>,
    /// Sorted by ascending bitrate.
    pub representations: Vec<Arc<Representation>>,
}

impl Adaptation {
    pub fn new(id: impl Into<String>, track_type: TrackType, mut representations: Vec<Representation>) -> Self {
        representations.sort_by_key(|r| r.bitrate);
        Self {
            id: id.into(),
            track_type,
            language: None,
            representations: representations.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn representation(&self, id: &str) -> Option<&Arc<Representation>> {
        self.representations.iter().find(|r| r.id == id)
    }
}

/// A time-bounded section of the presentation with its own set of tracks.
#[derive(Debug, Clone)]
pub struct Period {
    pub id: String,
    /// Start in seconds.
    pub start: f64,
    /// End in seconds, unknown for the last Period of a live content.
    pub end: Option<f64>,
    pub adaptations: HashMap<TrackType, Vec<Arc<Adaptation>>>,
}

impl Period {
    pub fn new(id: impl Into<String>, start: f64, end: Option<f64>) -> Self {
        Self {
            id: id.into(),
            start,
            end,
            adaptations: HashMap::new(),
        }
    }

    pub fn with_adaptation(mut self, adaptation: Adaptation) -> Self {
        self.adaptations
            .entry(adaptation.track_type)
            .or_default()
            .push(Arc::new(adaptation));
        self
    }

    pub fn adaptations_for(&self, track_type: TrackType) -> &[Arc<Adaptation>] {
        self.adaptations
            .get(&track_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn adaptation(&self, id: &str) -> Option<&Arc<Adaptation>> {
        self.adaptations.values().flatten().find(|a| a.id == id)
    }

    /// Track types with at least one Adaptation.
    pub fn track_types(&self) -> Vec<TrackType> {
        let mut types: Vec<_> = self
            .adaptations
            .iter()
            .filter(|(_, adaptations)| !adaptations.is_empty())
            .map(|(t, _)| *t)
            .collect();
        types.sort();
        types
    }

    /// End in seconds, `f64::INFINITY` when unknown.
    #[inline]
    pub fn end_or_infinity(&self) -> f64 {
        self.end.unwrap_or(f64::INFINITY)
    }

    #[inline]
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end_or_infinity()
    }

    fn merge_indexes_from(&self, newer: &Period) {
        for adaptation in self.adaptations.values().flatten() {
            let Some(new_adaptation) = newer.adaptation(&adaptation.id) else {
                continue;
            };
            for representation in &adaptation.representations {
                if let Some(new_repr) = new_adaptation.representation(&representation.id) {
                    if Arc::ptr_eq(&representation.index, &new_repr.index) {
                        continue;
                    }
                    let newer_index = new_repr.index.read().clone();
                    representation.index.write().merge_update(&newer_index);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub id: String,
    pub is_live: bool,
    /// Sorted by start time, non-overlapping.
    pub periods: Vec<Arc<Period>>,
}

impl Manifest {
    pub fn new(id: impl Into<String>, is_live: bool, mut periods: Vec<Period>) -> Self {
        periods.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self {
            id: id.into(),
            is_live,
            periods: periods.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn into_shared(self) -> SharedManifest {
        Arc::new(RwLock::new(self))
    }

    pub fn period(&self, id: &str) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.id == id)
    }

    /// The Period containing `time`.
    pub fn period_for_time(&self, time: f64) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.contains(time))
    }

    /// The Period containing `time`, or the first one starting after it when `time`
    /// falls in a gap between Periods.
    pub fn period_at_or_after(&self, time: f64) -> Option<&Arc<Period>> {
        self.period_for_time(time)
            .or_else(|| self.periods.iter().find(|p| p.start > time))
    }

    /// The Period chronologically following `period`.
    pub fn next_period(&self, period: &Period) -> Option<&Arc<Period>> {
        let position = self.periods.iter().position(|p| p.id == period.id)?;
        self.periods.get(position + 1)
    }

    pub fn is_last_period(&self, period: &Period) -> bool {
        self.periods.last().is_some_and(|p| p.id == period.id)
    }

    /// End of the whole presentation, when known.
    pub fn duration(&self) -> Option<f64> {
        self.periods.last().and_then(|p| p.end)
    }

    /// Applies a refreshed version of this manifest.
    ///
    /// Segment indexes of Representations known to both versions are merged in
    /// place so running buffers observe the new entries. Periods only present in
    /// `newer` are appended, Periods missing from it are dropped.
    pub fn update(&mut self, newer: &Manifest) {
        self.is_live = newer.is_live;
        let mut periods = Vec::with_capacity(newer.periods.len());
        for new_period in &newer.periods {
            match self.period(&new_period.id) {
                Some(current) => {
                    current.merge_indexes_from(new_period);
                    if current.start == new_period.start && current.end == new_period.end {
                        periods.push(Arc::clone(current));
                    } else {
                        debug!(period = %current.id, end = ?new_period.end, "Period bounds updated");
                        periods.push(Arc::new(Period {
                            id: current.id.clone(),
                            start: new_period.start,
                            end: new_period.end,
                            adaptations: current.adaptations.clone(),
                        }));
                    }
                }
                None => {
                    debug!(period = %new_period.id, start = new_period.start, "New period added");
                    periods.push(Arc::clone(new_period));
                }
            }
        }
        self.periods = periods;
    }
}
