// Representation buffer: the segment scheduling loop of one Representation.
//
// Each cycle computes the window to buffer, resolves it through the segment index,
// filters what is already buffered or in flight, then loads and appends at most one
// segment before planning again. Requests are strictly sequential and appends keep
// request order.

use std::collections::HashSet;
use std::sync::Arc;

use media_types::{Adaptation, Period, Representation, Segment, TrackType};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::BufferDeps;
use crate::abr::RequestSample;
use crate::bookkeeper::SegmentBookkeeper;
use crate::clock::ClockTick;
use crate::config::{BufferConfig, WaterMarks};
use crate::error::{BufferError, SinkError, TransportError};
use crate::gc;
use crate::ranges::{self, RANGE_EPSILON, TimeRange};
use crate::retry::RetryPolicy;
use crate::sink::SinkChunk;
use crate::sink_store::SinkContext;
use crate::transport::SegmentContext;

/// A buffered end closer than this to the buffering target counts as reaching it.
const FULL_TOLERANCE: f64 = 0.5;

/// Seconds of media to buffer from `max(current_time, period.start)`.
///
/// Time between the playhead and the Period start is taken from the buffer goal,
/// so a following Period only gets what the current one leaves.
pub fn wanted_buffer_size(tick: &ClockTick, config: &BufferConfig, period: &Period) -> f64 {
    let time = tick.current_time.max(period.start);
    let mut wanted = config.buffer_goal() - (time - tick.current_time);
    wanted = wanted.min(period.end_or_infinity() - time);
    if let Some(live_gap) = tick.live_gap {
        wanted = wanted.min(live_gap);
    }
    wanted.max(0.0)
}

/// Margin requested behind `time`: distance to the closest buffered edge, kept
/// between the water marks.
pub fn time_shift_padding(buffered: &[TimeRange], time: f64, water_marks: WaterMarks) -> f64 {
    let distance = ranges::nearest_edge_distance(buffered, time).unwrap_or(0.0);
    distance.clamp(water_marks.low, water_marks.high.max(water_marks.low))
}

/// Time range a Representation buffer tries to have in its sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WantedWindow {
    pub start: f64,
    pub end: f64,
}

impl WantedWindow {
    pub fn new(
        tick: &ClockTick,
        config: &BufferConfig,
        period: &Period,
        track_type: TrackType,
        buffered: &[TimeRange],
    ) -> Self {
        let time = tick.current_time.max(period.start);
        let wanted = wanted_buffer_size(tick, config, period);
        if wanted <= 0.0 {
            return Self {
                start: time,
                end: time,
            };
        }
        let padding = time_shift_padding(buffered, time, *config.water_marks.get(track_type));
        Self {
            start: (time - padding).max(period.start),
            end: time + wanted,
        }
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Drops segments that do not need to be requested.
///
/// Segments without timing are always kept.
pub(crate) fn segments_to_load(
    candidates: Vec<Segment>,
    period: &Period,
    containing: Option<TimeRange>,
    in_flight: &HashSet<String>,
    bookkeeper: &SegmentBookkeeper,
    bitrate: u64,
    rebuffering_ratio: f64,
) -> Vec<Segment> {
    let period_end = period.end_or_infinity();
    candidates
        .into_iter()
        .filter(|segment| {
            if !segment.has_timing() {
                return true;
            }
            if in_flight.contains(&segment.id) {
                return false;
            }
            let start = segment.start_secs().max(period.start);
            let end = segment.end_secs().min(period_end);
            if end - start <= RANGE_EPSILON {
                return false;
            }
            if let Some(range) = containing
                && start >= range.start - RANGE_EPSILON
                && end <= range.end + RANGE_EPSILON
            {
                return false;
            }
            let good_enough = bookkeeper
                .has_range(start, end - start)
                .is_some_and(|r| r.bitrate as f64 * rebuffering_ratio >= bitrate as f64);
            !good_enough
        })
        .collect()
}

/// Events sent by a Representation buffer to its Adaptation buffer.
#[derive(Debug)]
pub(crate) enum RepresentationEvent {
    AddedSegment {
        segment: Segment,
        new_index_entries: Vec<Segment>,
        buffered: Vec<TimeRange>,
    },
    Full,
    NeedsManifestRefresh,
    RequestSample(RequestSample),
    Warning(BufferError),
}

enum Plan {
    Load(Segment),
    Idle { full: bool, needs_refresh: bool },
    OutOfIndex,
}

pub(crate) struct RepresentationBuffer {
    track_type: TrackType,
    period: Arc<Period>,
    adaptation: Arc<Adaptation>,
    representation: Arc<Representation>,
    sink: SinkContext,
    deps: BufferDeps,
    token: CancellationToken,
    in_flight: HashSet<String>,
    init_needed: bool,
    was_stalled: bool,
    full_sent: bool,
    /// Manifest version for which a refresh was already requested.
    refresh_requested_for: Option<u64>,
}

impl RepresentationBuffer {
    pub fn new(
        period: Arc<Period>,
        adaptation: Arc<Adaptation>,
        representation: Arc<Representation>,
        sink: SinkContext,
        deps: BufferDeps,
        token: CancellationToken,
    ) -> Self {
        Self {
            track_type: sink.track_type,
            period,
            adaptation,
            representation,
            sink,
            deps,
            token,
            in_flight: HashSet::new(),
            init_needed: true,
            was_stalled: false,
            full_sent: false,
            refresh_requested_for: None,
        }
    }

    /// Runs until cancelled or until an error stops the buffer.
    pub async fn run(mut self, events: mpsc::Sender<RepresentationEvent>) -> Result<(), BufferError> {
        info!(
            track = %self.track_type,
            period = %self.period.id,
            representation = %self.representation.id,
            bitrate = self.representation.bitrate,
            "Representation buffer started"
        );
        let result = self.schedule(&events).await;
        debug!(
            track = %self.track_type,
            representation = %self.representation.id,
            "Representation buffer stopped"
        );
        match result {
            Err(BufferError::Cancelled) => Ok(()),
            other => other,
        }
    }

    async fn schedule(&mut self, events: &mpsc::Sender<RepresentationEvent>) -> Result<(), BufferError> {
        let mut idle = self.sink.handle.subscribe_idle();
        let _ = idle.borrow_and_update();
        let mut first_cycle = true;

        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }
            let tick = *self.deps.clock.borrow_and_update();
            let config = self.deps.config.borrow_and_update().clone();
            let version = *self.deps.manifest_version.borrow_and_update();

            let stalled_now = self.track_type.is_native() && tick.stalled && !self.was_stalled;
            self.was_stalled = tick.stalled;
            if first_cycle || stalled_now {
                if stalled_now {
                    debug!(track = %self.track_type, time = tick.current_time, "Stall detected, reconciling buffer");
                    self.init_needed = true;
                }
                // Only native sinks evict on their own.
                if self.track_type.is_native() {
                    self.reconcile().await?;
                }
                first_cycle = false;
            }

            let buffered = self.buffered().await?;
            match self.plan(&tick, &config, &buffered) {
                Plan::Load(segment) => {
                    if !self.load_segment(segment, &config, events).await? {
                        return Ok(());
                    }
                    continue;
                }
                Plan::OutOfIndex => {
                    if !self.request_refresh(version, events).await {
                        return Ok(());
                    }
                }
                Plan::Idle { full, needs_refresh } => {
                    if needs_refresh && !self.request_refresh(version, events).await {
                        return Ok(());
                    }
                    if full && !self.full_sent {
                        debug!(track = %self.track_type, period = %self.period.id, "Period fully buffered");
                        self.full_sent = true;
                        if events.send(RepresentationEvent::Full).await.is_err() {
                            return Ok(());
                        }
                    } else if !full {
                        self.full_sent = false;
                    }
                }
            }

            if !self.wait_for_change(&mut idle).await {
                return Ok(());
            }
        }
    }

    fn plan(&mut self, tick: &ClockTick, config: &BufferConfig, buffered: &[TimeRange]) -> Plan {
        let window = WantedWindow::new(tick, config, &self.period, self.track_type, buffered);
        let index = self.representation.index.read();

        if self.init_needed {
            match index.init_segment() {
                Some(init) if !self.in_flight.contains(&init.id) => return Plan::Load(init),
                Some(_) => {}
                None => self.init_needed = false,
            }
        }

        let candidates = match index.get_segments(window.start, 0.0, window.duration()) {
            Ok(segments) => segments,
            Err(e) => {
                debug!(track = %self.track_type, representation = %self.representation.id, error = %e, "Wanted window is out of index");
                return Plan::OutOfIndex;
            }
        };
        let needs_refresh = window.duration() > 0.0 && index.should_refresh(window.end);
        let target = (!needs_refresh)
            .then(|| buffering_target(&self.period, index.is_finished(), index.last_position()))
            .flatten();
        drop(index);

        let containing = ranges::range_containing(buffered, tick.current_time);
        let mut to_load = {
            let bookkeeper = self.sink.bookkeeper.lock();
            segments_to_load(
                candidates,
                &self.period,
                containing,
                &self.in_flight,
                &bookkeeper,
                self.representation.bitrate,
                config.bitrate_rebuffering_ratio,
            )
        };
        trace!(
            track = %self.track_type,
            start = window.start,
            end = window.end,
            pending = to_load.len(),
            "Buffer cycle"
        );

        if to_load.is_empty() {
            let full = target.is_some_and(|target| window.end >= target - FULL_TOLERANCE);
            Plan::Idle { full, needs_refresh }
        } else {
            Plan::Load(to_load.remove(0))
        }
    }

    async fn request_refresh(&mut self, version: u64, events: &mpsc::Sender<RepresentationEvent>) -> bool {
        if self.refresh_requested_for == Some(version) {
            return true;
        }
        self.refresh_requested_for = Some(version);
        info!(track = %self.track_type, period = %self.period.id, version, "Segment index exhausted, manifest refresh needed");
        events.send(RepresentationEvent::NeedsManifestRefresh).await.is_ok()
    }

    /// Loads, parses and appends `segment`. Returns `false` once the Adaptation
    /// buffer stopped listening.
    async fn load_segment(
        &mut self,
        segment: Segment,
        config: &BufferConfig,
        events: &mpsc::Sender<RepresentationEvent>,
    ) -> Result<bool, BufferError> {
        let context = SegmentContext {
            track_type: self.track_type,
            period: Arc::clone(&self.period),
            adaptation: Arc::clone(&self.adaptation),
            representation: Arc::clone(&self.representation),
            segment: segment.clone(),
        };
        let policy = RetryPolicy::for_track(config, self.track_type);
        let track_type = self.track_type;

        self.in_flight.insert(segment.id.clone());
        let mut deferred_warnings = Vec::new();
        let fetched = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(TransportError::Cancelled),
            fetched = self.deps.fetcher.fetch(&context, &policy, &self.token, |err, retry| {
                trace!(track = %track_type, retry, "Segment request retry");
                let warning = RepresentationEvent::Warning(BufferError::transport(track_type, err.clone()));
                if let Err(TrySendError::Full(warning)) = events.try_send(warning) {
                    deferred_warnings.push(warning);
                }
            }) => fetched,
        };
        self.in_flight.remove(&segment.id);
        for warning in deferred_warnings {
            if events.send(warning).await.is_err() {
                return Ok(false);
            }
        }

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(TransportError::Cancelled) => return Err(BufferError::Cancelled),
            Err(e) => return Err(BufferError::transport(self.track_type, e)),
        };
        if events
            .send(RepresentationEvent::RequestSample(fetched.sample))
            .await
            .is_err()
        {
            return Ok(false);
        }

        let parsed = fetched.parsed;
        if parsed.timescale.is_some() || !parsed.new_index_entries.is_empty() {
            let mut index = self.representation.index.write();
            if let Some(timescale) = parsed.timescale {
                index.set_timescale(timescale);
            }
            if !parsed.new_index_entries.is_empty() {
                index.insert_new_segments(&parsed.new_index_entries, &segment);
            }
        }

        let period_end = self.period.end_or_infinity();
        let chunk = SinkChunk {
            data: parsed.data,
            codec: self.representation.codec.clone(),
            timestamp_offset: parsed.timestamp_offset,
            append_window: TimeRange::new(self.period.start, period_end),
            time_range: parsed.timing,
            segment_id: segment.id.clone(),
        };
        self.append(chunk, config).await?;

        if let Some(timing) = parsed.timing {
            let start = (timing.start + parsed.timestamp_offset).max(self.period.start);
            let end = (timing.end + parsed.timestamp_offset).min(period_end);
            self.sink
                .bookkeeper
                .lock()
                .insert(self.representation.bitrate, start, end);
        }
        self.deps.metrics.record_append();

        if segment.is_init {
            self.init_needed = false;
            return Ok(true);
        }
        self.full_sent = false;
        let buffered = self.buffered().await?;
        let event = RepresentationEvent::AddedSegment {
            segment,
            new_index_entries: parsed.new_index_entries,
            buffered,
        };
        Ok(events.send(event).await.is_ok())
    }

    /// Appends `chunk`, running a forced collection and retrying once on quota errors.
    async fn append(&self, chunk: SinkChunk, config: &BufferConfig) -> Result<(), BufferError> {
        let handle = &self.sink.handle;
        match handle.append(chunk.clone()).await {
            Ok(()) => return Ok(()),
            Err(SinkError::QuotaExceeded) => {}
            Err(e) => return Err(BufferError::sink(self.track_type, e)),
        }

        self.deps.metrics.record_quota_error();
        warn!(track = %self.track_type, segment = %chunk.segment_id, "Sink quota exceeded, forcing garbage collection");
        let current_time = self.deps.clock.borrow().current_time;
        gc::force_collect(
            handle,
            &self.sink.bookkeeper,
            current_time,
            &config.forced_gc,
            &self.deps.metrics,
        )
        .await
        .map_err(|e| BufferError::sink(self.track_type, e))?;

        match handle.append(chunk).await {
            Ok(()) => Ok(()),
            Err(SinkError::QuotaExceeded) => {
                self.deps.metrics.record_quota_error();
                Err(BufferError::BufferFull {
                    track_type: self.track_type,
                })
            }
            Err(e) => Err(BufferError::sink(self.track_type, e)),
        }
    }

    /// Aligns the bookkeeper with what the sink really holds.
    async fn reconcile(&self) -> Result<(), BufferError> {
        let buffered = self.buffered().await?;
        self.sink.bookkeeper.lock().intersect(&buffered);
        Ok(())
    }

    async fn buffered(&self) -> Result<Vec<TimeRange>, BufferError> {
        self.sink
            .handle
            .buffered()
            .await
            .map_err(|e| BufferError::sink(self.track_type, e))
    }

    /// Waits for anything that can change the next plan. Returns `false` when the
    /// buffer must stop.
    async fn wait_for_change(&mut self, idle: &mut watch::Receiver<u64>) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            changed = self.deps.clock.changed() => changed.is_ok(),
            changed = self.deps.config.changed() => changed.is_ok(),
            changed = self.deps.manifest_version.changed() => changed.is_ok(),
            changed = idle.changed() => changed.is_ok(),
        }
    }
}

/// Where buffering of `period` ends, if known.
fn buffering_target(period: &Period, index_finished: bool, last_position: Option<f64>) -> Option<f64> {
    let end = period.end_or_infinity();
    let target = match last_position {
        Some(last) if index_finished => last.min(end),
        _ => end,
    };
    target.is_finite().then_some(target)
}
