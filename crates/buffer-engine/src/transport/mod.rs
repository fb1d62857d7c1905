// Transport collaborators: how segments and manifests are loaded and parsed.
//
// Container demuxing and manifest formats are not handled by the engine. Implementations
// of these traits provide them; the engine only consumes timing information and new
// index entries discovered while parsing.

mod fetcher;
mod http;
mod simulated;

pub use fetcher::{FetchedSegment, SegmentFetcher};
pub use http::HttpSegmentLoader;
pub use simulated::{ManifestSource, RequestRecord, SimulatedTransport};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use media_types::{Adaptation, Manifest, Period, Representation, Segment, SharedManifest, TrackType};

use crate::error::TransportError;
use crate::ranges::TimeRange;

/// Everything a transport needs to know about the segment to load.
#[derive(Debug, Clone)]
pub struct SegmentContext {
    pub track_type: TrackType,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
    pub segment: Segment,
}

/// Result of parsing a loaded segment.
#[derive(Debug, Clone, Default)]
pub struct ParsedSegment {
    /// Data to push to the sink.
    pub data: Bytes,
    /// Time range covered by the data, `None` for initialization data.
    pub timing: Option<TimeRange>,
    /// Timescale discovered in the media (usually in the initialization segment).
    pub timescale: Option<u32>,
    /// Index entries discovered in the media, e.g. from a `sidx` box.
    pub new_index_entries: Vec<Segment>,
    /// Offset to apply to the media timestamps, in seconds.
    pub timestamp_offset: f64,
}

impl ParsedSegment {
    /// Data passed through untouched, with timing taken from the segment descriptor.
    pub fn passthrough(data: Bytes, segment: &Segment) -> Self {
        let timing = segment
            .has_timing()
            .then(|| TimeRange::new(segment.start_secs(), segment.end_secs()));
        Self {
            data,
            timing,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait SegmentTransport: Send + Sync {
    async fn load_segment(&self, context: &SegmentContext) -> Result<Bytes, TransportError>;

    async fn parse_segment(&self, data: Bytes, context: &SegmentContext) -> Result<ParsedSegment, TransportError>;
}

#[async_trait]
pub trait ManifestLoader: Send + Sync {
    async fn load_manifest(&self, url: &str) -> Result<Manifest, TransportError>;

    /// Loads a newer version of `previous`. The engine merges the result into the
    /// manifest it already uses.
    async fn refresh_manifest(&self, url: &str, previous: &SharedManifest) -> Result<Manifest, TransportError>;
}
