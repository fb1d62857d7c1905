use std::sync::Arc;
use std::time::Duration;

use media_types::{Adaptation, Representation, Segment, SegmentIndex, TrackType};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{BufferDeps, PeriodEmitter, PeriodMessage};
use crate::clock::ClockTick;
use crate::config::BufferConfig;
use crate::metrics::EngineMetrics;
use crate::sink::MemorySinkFactory;
use crate::sink_store::SinkStore;
use crate::transport::{SegmentFetcher, SimulatedTransport};

/// Two-second segment number `n`, in a timescale of 1.
pub(crate) fn seg(n: u64) -> Segment {
    Segment::media(n.to_string(), n * 2, 2, 1)
}

/// Static index of `count` two-second segments with an init segment.
pub(crate) fn vod_index(count: u64) -> SegmentIndex {
    SegmentIndex::timeline(1, Some(Segment::init("init")), (0..count).map(seg).collect(), false)
}

pub(crate) fn adaptation(id: &str, track_type: TrackType, bitrates: &[u64], segments: u64) -> Arc<Adaptation> {
    let representations = bitrates
        .iter()
        .map(|bitrate| Representation::new(format!("{id}-{bitrate}"), *bitrate, vod_index(segments)))
        .collect();
    Arc::new(Adaptation::new(id, track_type, representations))
}

/// Every input of the buffers, driven by the test.
pub(crate) struct TestEnv {
    pub clock_tx: watch::Sender<ClockTick>,
    pub config_tx: watch::Sender<BufferConfig>,
    pub version_tx: watch::Sender<u64>,
    pub deps: BufferDeps,
    pub sinks: Arc<SinkStore>,
    pub factory: Arc<MemorySinkFactory>,
    pub transport: Arc<SimulatedTransport>,
    pub metrics: Arc<EngineMetrics>,
}

impl TestEnv {
    pub fn new(factory: MemorySinkFactory, tick: ClockTick) -> Self {
        Self::with_config(factory, tick, BufferConfig::default())
    }

    pub fn with_config(factory: MemorySinkFactory, tick: ClockTick, config: BufferConfig) -> Self {
        let (clock_tx, clock) = watch::channel(tick);
        let (config_tx, config) = watch::channel(config);
        let (version_tx, manifest_version) = watch::channel(0);
        let metrics = Arc::new(EngineMetrics::new());
        let transport = Arc::new(SimulatedTransport::new(8_000_000.0).with_latency(Duration::from_millis(50)));
        let factory = Arc::new(factory);
        let sinks = Arc::new(SinkStore::new(
            factory.clone(),
            clock.clone(),
            config.clone(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        ));
        let deps = BufferDeps {
            fetcher: SegmentFetcher::new(transport.clone(), Arc::clone(&metrics)),
            clock,
            config,
            manifest_version,
            metrics: Arc::clone(&metrics),
        };
        Self {
            clock_tx,
            config_tx,
            version_tx,
            deps,
            sinks,
            factory,
            transport,
            metrics,
        }
    }

    pub fn emitter(&self, track_type: TrackType) -> (PeriodEmitter, mpsc::Receiver<PeriodMessage>) {
        let (tx, rx) = mpsc::channel(256);
        (PeriodEmitter::new(0, track_type, tx), rx)
    }
}
