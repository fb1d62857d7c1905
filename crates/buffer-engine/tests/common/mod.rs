//! Shared helpers for the engine integration tests.
//!
//! Every test runs on a paused tokio clock: the simulated network and the engine
//! only advance when every task is idle, so runs are deterministic.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use buffer_engine::{
    BufferConfig, BufferError, BuffersHandler, ClockTick, EngineDeps, EventReceiver, MemorySinkFactory,
    SimulatedTransport, StreamEvent, StreamHandle,
};
use media_types::{
    Adaptation, Manifest, Period, Representation, Segment, SegmentIndex, SegmentTemplate, TrackType,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Upper bound on the (virtual) time a test waits for an event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(600);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Static timeline of two-second segments covering `[start, end)`.
pub fn vod_index(start: u64, end: u64) -> SegmentIndex {
    let segments = (start..end)
        .step_by(2)
        .map(|time| Segment::media(time.to_string(), time, 2, 1))
        .collect();
    SegmentIndex::timeline(1, Some(Segment::init("init")), segments, false)
}

/// Adaptation whose Representations all use a static index covering `[start, end)`.
pub fn vod_adaptation(id: &str, track_type: TrackType, bitrates: &[u64], start: u64, end: u64) -> Adaptation {
    let representations = bitrates
        .iter()
        .map(|bitrate| Representation::new(format!("{id}-{bitrate}"), *bitrate, vod_index(start, end)))
        .collect();
    Adaptation::new(id, track_type, representations)
}

/// Static Period `[start, end)` with one Adaptation per track type.
pub fn vod_period(id: &str, start: u64, end: u64, tracks: &[(TrackType, &[u64])]) -> Period {
    tracks.iter().fold(
        Period::new(id, start as f64, Some(end as f64)),
        |period, (track_type, bitrates)| {
            let adaptation_id = format!("{id}-{track_type}");
            period.with_adaptation(vod_adaptation(&adaptation_id, *track_type, bitrates, start, end))
        },
    )
}

/// Live manifest with a single open Period whose segments are available until `edge`.
pub fn live_manifest(edge: u64) -> Manifest {
    let template = SegmentTemplate::new("v-$Number$.m4s", 2).with_end_time(edge);
    let index = SegmentIndex::template(1, Some(Segment::init("init")), template, true);
    let period = Period::new("live", 0.0, None).with_adaptation(Adaptation::new(
        "video",
        TrackType::Video,
        vec![Representation::new("v1", 500_000, index)],
    ));
    Manifest::new("live", true, vec![period])
}

/// A running engine and the inputs driving it.
pub struct Engine {
    pub clock_tx: watch::Sender<ClockTick>,
    pub config_tx: watch::Sender<BufferConfig>,
    pub events: EventReceiver,
    pub handle: StreamHandle,
    pub task: JoinHandle<()>,
    pub factory: Arc<MemorySinkFactory>,
    pub transport: Arc<SimulatedTransport>,
}

pub struct EngineBuilder {
    manifest: Manifest,
    factory: MemorySinkFactory,
    transport: SimulatedTransport,
    config: BufferConfig,
    tick: ClockTick,
    refresh_url: Option<String>,
}

impl EngineBuilder {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            factory: MemorySinkFactory::new(),
            transport: SimulatedTransport::new(8_000_000.0).with_latency(Duration::from_millis(50)),
            config: BufferConfig::default(),
            tick: ClockTick::at(0.0),
            refresh_url: None,
        }
    }

    pub fn factory(mut self, factory: MemorySinkFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn transport(mut self, transport: SimulatedTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(mut self, config: BufferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tick(mut self, tick: ClockTick) -> Self {
        self.tick = tick;
        self
    }

    /// Lets the engine refresh the manifest through the simulated transport.
    pub fn auto_refresh(mut self, url: &str) -> Self {
        self.refresh_url = Some(url.to_string());
        self
    }

    pub fn start(self) -> Engine {
        init_tracing();
        let (clock_tx, clock) = watch::channel(self.tick);
        let (config_tx, config) = watch::channel(self.config);
        let factory = Arc::new(self.factory);
        let transport = Arc::new(self.transport);

        let mut deps = EngineDeps::new(
            self.manifest.into_shared(),
            factory.clone(),
            transport.clone(),
            clock,
            config,
        );
        if let Some(url) = self.refresh_url {
            deps = deps.with_manifest_refresh(transport.clone(), url);
        }
        let (events, handle, task) =
            BuffersHandler::spawn(deps, CancellationToken::new()).expect("Failed to start the engine");
        Engine {
            clock_tx,
            config_tx,
            events,
            handle,
            task,
            factory,
            transport,
        }
    }
}

impl Engine {
    pub fn seek(&self, time: f64) {
        self.clock_tx.send_modify(|tick| tick.current_time = time);
    }

    /// Receives events until one matches `predicate`, returning every event seen.
    ///
    /// Panics on a fatal engine error, a closed channel or a timeout.
    pub async fn collect_until(&mut self, predicate: impl Fn(&StreamEvent) -> bool) -> Vec<StreamEvent> {
        let mut seen = Vec::new();
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(Ok(event)) => {
                        let done = predicate(&event);
                        seen.push(event);
                        if done {
                            return;
                        }
                    }
                    Some(Err(e)) => panic!("engine failed: {e}"),
                    None => panic!("event channel closed"),
                }
            }
        };
        let timed_out = tokio::time::timeout(EVENT_TIMEOUT, wait).await.is_err();
        assert!(!timed_out, "timed out, events so far: {:?}", kinds(&seen));
        seen
    }

    pub async fn wait_for(&mut self, predicate: impl Fn(&StreamEvent) -> bool) -> StreamEvent {
        self.collect_until(predicate)
            .await
            .pop()
            .expect("collect_until returns the matching event")
    }

    /// Receives every event for `duration` of (virtual) time.
    pub async fn collect_for(&mut self, duration: Duration) -> Vec<StreamEvent> {
        let deadline = tokio::time::Instant::now() + duration;
        let mut seen = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(Ok(event))) => seen.push(event),
                Ok(Some(Err(e))) => panic!("engine failed: {e}"),
                Ok(None) => panic!("event channel closed"),
                Err(_) => return seen,
            }
        }
    }

    /// Next fatal error reported by the engine.
    pub async fn wait_for_error(&mut self) -> BufferError {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return e,
                    None => panic!("event channel closed without an error"),
                }
            }
        };
        tokio::time::timeout(EVENT_TIMEOUT, wait)
            .await
            .expect("timed out waiting for an engine error")
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        self.task.await.expect("engine task panicked");
    }
}

pub fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::kind).collect()
}

pub fn is_full(track_type: TrackType) -> impl Fn(&StreamEvent) -> bool {
    move |event| matches!(event, StreamEvent::Full { track_type: t, .. } if *t == track_type)
}

pub fn is_added_in(period_id: &'static str) -> impl Fn(&StreamEvent) -> bool {
    move |event| matches!(event, StreamEvent::AddedSegment { period, .. } if period.id == period_id)
}

pub fn is_ready(period_id: &'static str) -> impl Fn(&StreamEvent) -> bool {
    move |event| matches!(event, StreamEvent::PeriodBufferReady { period, .. } if period.id == period_id)
}
