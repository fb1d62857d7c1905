use std::sync::Arc;

use media_types::{Adaptation, Period, Representation, Segment, TrackType};
use tokio::sync::watch;

use crate::error::BufferError;
use crate::ranges::TimeRange;

/// Lets the player choose the Adaptation buffered for one (Period, track type).
///
/// Handed out with [`StreamEvent::PeriodBufferReady`]. Selecting `None` disables the
/// track for that Period.
#[derive(Clone)]
pub struct AdaptationSelector {
    tx: Arc<watch::Sender<Option<Arc<Adaptation>>>>,
}

impl AdaptationSelector {
    pub(crate) fn new(initial: Option<Arc<Adaptation>>) -> (Self, watch::Receiver<Option<Arc<Adaptation>>>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn select(&self, adaptation: Option<Arc<Adaptation>>) {
        self.tx.send_replace(adaptation);
    }

    pub fn current(&self) -> Option<Arc<Adaptation>> {
        self.tx.borrow().clone()
    }
}

impl std::fmt::Debug for AdaptationSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptationSelector")
            .field("current", &self.tx.borrow().as_ref().map(|a| a.id.clone()))
            .finish()
    }
}

/// Events emitted by the engine to the player.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The Adaptation buffered for a Period changed (`None` when the track is disabled).
    AdaptationChange {
        track_type: TrackType,
        period: Arc<Period>,
        adaptation: Option<Arc<Adaptation>>,
    },
    RepresentationChange {
        track_type: TrackType,
        period: Arc<Period>,
        representation: Arc<Representation>,
    },
    AddedSegment {
        track_type: TrackType,
        period: Arc<Period>,
        representation: Arc<Representation>,
        segment: Segment,
        /// Index entries discovered while parsing the segment.
        new_index_entries: Vec<Segment>,
        /// Sink buffered ranges after the append.
        buffered: Vec<TimeRange>,
    },
    PeriodBufferReady {
        track_type: TrackType,
        period: Arc<Period>,
        selector: AdaptationSelector,
    },
    PeriodBufferCleared {
        track_type: TrackType,
        period: Arc<Period>,
    },
    /// Everything needed until the end of the Period is buffered.
    Full {
        track_type: TrackType,
        period: Arc<Period>,
    },
    /// The segment index could not resolve the wanted window, a newer manifest is needed.
    NeedsManifestRefresh {
        track_type: TrackType,
        period: Arc<Period>,
    },
    /// The media pipeline must be rebuilt, playback should resume at `time`.
    NeedsMediaSourceReload { track_type: TrackType, time: f64 },
    Warning {
        track_type: Option<TrackType>,
        error: BufferError,
    },
    /// Earliest Period buffered for every track type.
    ActivePeriodChanged { period: Arc<Period> },
    /// The last Period is fully buffered for every track type.
    EndOfStream,
    /// Buffering restarted after [`StreamEvent::EndOfStream`].
    ResumeStream,
}

impl StreamEvent {
    pub fn track_type(&self) -> Option<TrackType> {
        match self {
            Self::AdaptationChange { track_type, .. }
            | Self::RepresentationChange { track_type, .. }
            | Self::AddedSegment { track_type, .. }
            | Self::PeriodBufferReady { track_type, .. }
            | Self::PeriodBufferCleared { track_type, .. }
            | Self::Full { track_type, .. }
            | Self::NeedsManifestRefresh { track_type, .. }
            | Self::NeedsMediaSourceReload { track_type, .. } => Some(*track_type),
            Self::Warning { track_type, .. } => *track_type,
            Self::ActivePeriodChanged { .. } | Self::EndOfStream | Self::ResumeStream => None,
        }
    }

    pub fn period(&self) -> Option<&Arc<Period>> {
        match self {
            Self::AdaptationChange { period, .. }
            | Self::RepresentationChange { period, .. }
            | Self::AddedSegment { period, .. }
            | Self::PeriodBufferReady { period, .. }
            | Self::PeriodBufferCleared { period, .. }
            | Self::Full { period, .. }
            | Self::NeedsManifestRefresh { period, .. }
            | Self::ActivePeriodChanged { period } => Some(period),
            Self::NeedsMediaSourceReload { .. } | Self::Warning { .. } | Self::EndOfStream | Self::ResumeStream => None,
        }
    }

    /// Short name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdaptationChange { .. } => "adaptation_change",
            Self::RepresentationChange { .. } => "representation_change",
            Self::AddedSegment { .. } => "added_segment",
            Self::PeriodBufferReady { .. } => "period_buffer_ready",
            Self::PeriodBufferCleared { .. } => "period_buffer_cleared",
            Self::Full { .. } => "full",
            Self::NeedsManifestRefresh { .. } => "needs_manifest_refresh",
            Self::NeedsMediaSourceReload { .. } => "needs_media_source_reload",
            Self::Warning { .. } => "warning",
            Self::ActivePeriodChanged { .. } => "active_period_changed",
            Self::EndOfStream => "end_of_stream",
            Self::ResumeStream => "resume_stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_is_shared_between_clones() {
        let adaptation = Arc::new(Adaptation::new("fr", TrackType::Audio, vec![]));
        let (selector, mut rx) = AdaptationSelector::new(None);
        let clone = selector.clone();
        clone.select(Some(Arc::clone(&adaptation)));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().id, "fr");
        assert_eq!(selector.current().unwrap().id, "fr");
    }

    #[test]
    fn test_event_accessors() {
        let period = Arc::new(Period::new("p1", 0.0, Some(10.0)));
        let event = StreamEvent::Full {
            track_type: TrackType::Text,
            period: Arc::clone(&period),
        };
        assert_eq!(event.track_type(), Some(TrackType::Text));
        assert_eq!(event.period().unwrap().id, "p1");
        assert_eq!(event.kind(), "full");
        assert_eq!(StreamEvent::EndOfStream.track_type(), None);
    }
}
