// Simulated network: serves synthetic segments at a configurable throughput.
//
// Used by the `bufsim` simulator and by tests. Sizes are derived from the
// Representation bitrate, delays from the throughput and latency, and failures can be
// scripted per segment id. With a paused tokio clock runs are fully deterministic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use media_types::{Manifest, SharedManifest, TrackType};
use parking_lot::Mutex;
use tracing::trace;

use super::{ManifestLoader, ParsedSegment, SegmentContext, SegmentTransport};
use crate::error::TransportError;

/// Size of a synthetic initialization segment.
const INIT_SEGMENT_BYTES: usize = 1_024;

/// Produces the manifest returned by the `n`-th load (0 for the initial load).
pub type ManifestSource = Box<dyn Fn(u32) -> Option<Manifest> + Send + Sync>;

/// A segment request seen by the simulated network.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub track_type: TrackType,
    pub representation: String,
    pub segment: String,
    pub is_init: bool,
    pub start: f64,
    pub end: f64,
}

#[derive(Default)]
struct SimulatedState {
    failures: HashMap<String, VecDeque<TransportError>>,
    requests: Vec<RequestRecord>,
    in_flight: HashSet<(String, String)>,
    max_in_flight_per_representation: usize,
}

pub struct SimulatedTransport {
    /// Bits per second, stored as `f64` bits.
    throughput: AtomicU64,
    latency: Duration,
    state: Mutex<SimulatedState>,
    manifests: Option<ManifestSource>,
    manifest_loads: AtomicU32,
}

impl SimulatedTransport {
    pub fn new(throughput_bps: f64) -> Self {
        Self {
            throughput: AtomicU64::new(throughput_bps.to_bits()),
            latency: Duration::ZERO,
            state: Mutex::new(SimulatedState::default()),
            manifests: None,
            manifest_loads: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_manifests(mut self, source: ManifestSource) -> Self {
        self.manifests = Some(source);
        self
    }

    pub fn throughput_bps(&self) -> f64 {
        f64::from_bits(self.throughput.load(Ordering::Relaxed))
    }

    pub fn set_throughput_bps(&self, throughput_bps: f64) {
        self.throughput
            .store(throughput_bps.to_bits(), Ordering::Relaxed);
    }

    /// The next request for segment `segment_id` fails with `error`. Can be called
    /// several times to queue failures.
    pub fn fail_segment(&self, segment_id: impl Into<String>, error: TransportError) {
        self.state
            .lock()
            .failures
            .entry(segment_id.into())
            .or_default()
            .push_back(error);
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.lock().requests.clone()
    }

    pub fn requests_for(&self, track_type: TrackType) -> Vec<RequestRecord> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.track_type == track_type)
            .cloned()
            .collect()
    }

    /// Highest number of simultaneous requests observed for a single Representation.
    pub fn max_in_flight_per_representation(&self) -> usize {
        self.state.lock().max_in_flight_per_representation
    }

    pub fn manifest_loads(&self) -> u32 {
        self.manifest_loads.load(Ordering::Relaxed)
    }

    fn segment_size(context: &SegmentContext) -> usize {
        if context.segment.is_init {
            return INIT_SEGMENT_BYTES;
        }
        let bits = context.representation.bitrate as f64 * context.segment.duration_secs();
        (bits / 8.0).round() as usize
    }

    fn transfer_time(&self, bytes: usize) -> Duration {
        let throughput = self.throughput_bps();
        if throughput <= 0.0 || !throughput.is_finite() {
            return self.latency;
        }
        self.latency + Duration::from_secs_f64(bytes as f64 * 8.0 / throughput)
    }

    fn next_manifest(&self) -> Result<Manifest, TransportError> {
        let load = self.manifest_loads.fetch_add(1, Ordering::Relaxed);
        self.manifests
            .as_ref()
            .and_then(|source| source(load))
            .ok_or_else(|| TransportError::http(404, format!("manifest load #{load}")))
    }
}

/// Removes the request from the in-flight set when the load completes or is dropped.
struct InFlightGuard<'a> {
    state: &'a Mutex<SimulatedState>,
    key: (String, String),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.key);
    }
}

#[async_trait]
impl SegmentTransport for SimulatedTransport {
    async fn load_segment(&self, context: &SegmentContext) -> Result<Bytes, TransportError> {
        let segment = &context.segment;
        let key = (context.representation.id.clone(), segment.id.clone());
        let failure = {
            let mut state = self.state.lock();
            state.requests.push(RequestRecord {
                track_type: context.track_type,
                representation: context.representation.id.clone(),
                segment: segment.id.clone(),
                is_init: segment.is_init,
                start: segment.start_secs(),
                end: segment.end_secs(),
            });
            state.in_flight.insert(key.clone());
            let concurrent = state
                .in_flight
                .iter()
                .filter(|(repr, _)| *repr == key.0)
                .count();
            state.max_in_flight_per_representation = state.max_in_flight_per_representation.max(concurrent);
            state
                .failures
                .get_mut(&segment.id)
                .and_then(VecDeque::pop_front)
        };
        let _guard = InFlightGuard {
            state: &self.state,
            key,
        };

        let size = Self::segment_size(context);
        tokio::time::sleep(self.transfer_time(size)).await;
        if let Some(error) = failure {
            trace!(segment = %segment.id, error = %error, "Simulated request failure");
            return Err(error);
        }
        Ok(Bytes::from(vec![0u8; size]))
    }

    async fn parse_segment(&self, data: Bytes, context: &SegmentContext) -> Result<ParsedSegment, TransportError> {
        Ok(ParsedSegment::passthrough(data, &context.segment))
    }
}

#[async_trait]
impl ManifestLoader for SimulatedTransport {
    async fn load_manifest(&self, _url: &str) -> Result<Manifest, TransportError> {
        tokio::time::sleep(self.latency).await;
        self.next_manifest()
    }

    async fn refresh_manifest(&self, _url: &str, _previous: &SharedManifest) -> Result<Manifest, TransportError> {
        tokio::time::sleep(self.latency).await;
        self.next_manifest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_types::{Adaptation, Period, Representation, Segment, SegmentIndex};
    use std::sync::Arc;

    fn context(segment: Segment) -> SegmentContext {
        SegmentContext {
            track_type: TrackType::Video,
            period: Arc::new(Period::new("p", 0.0, None)),
            adaptation: Arc::new(Adaptation::new("v", TrackType::Video, vec![])),
            representation: Arc::new(Representation::new(
                "v1",
                1_000_000,
                SegmentIndex::timeline(1, None, vec![], false),
            )),
            segment,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_time_follows_throughput() {
        let transport = SimulatedTransport::new(2_000_000.0).with_latency(Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let data = transport
            .load_segment(&context(Segment::media("1", 0, 4, 1)))
            .await
            .unwrap();
        // 1 Mbps over 4 s is 500 kB, 2 s at 2 Mbps
        assert_eq!(data.len(), 500_000);
        assert_eq!(started.elapsed(), Duration::from_millis(2_100));
        assert_eq!(transport.max_in_flight_per_representation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_failures_are_consumed_in_order() {
        let transport = SimulatedTransport::new(8_000_000.0);
        transport.fail_segment("2", TransportError::http(412, "2"));
        let ctx = context(Segment::media("2", 2, 2, 1));
        assert!(transport.load_segment(&ctx).await.unwrap_err().is_precondition_failed());
        assert!(transport.load_segment(&ctx).await.is_ok());
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_manifest_source() {
        let transport = SimulatedTransport::new(1.0).with_manifests(Box::new(|n| {
            (n < 2).then(|| Manifest::new(format!("m{n}"), true, vec![]))
        }));
        assert_eq!(transport.load_manifest("x").await.unwrap().id, "m0");
        let shared = Manifest::new("m0", true, vec![]).into_shared();
        assert_eq!(transport.refresh_manifest("x", &shared).await.unwrap().id, "m1");
        assert!(transport.refresh_manifest("x", &shared).await.is_err());
        assert_eq!(transport.manifest_loads(), 3);
    }
}
