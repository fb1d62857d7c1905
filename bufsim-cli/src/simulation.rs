// Playback session driving the engine: a media clock fed by what the memory sinks hold.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use buffer_engine::{
    BufferConfig, BuffersHandler, ClockTick, EngineDeps, MemorySinkFactory, MetricsSnapshot, ReadyState,
    SimulatedTransport, StreamEvent, ranges,
};
use media_types::TrackType;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::Args;
use crate::error::Result;
use crate::scenario::Scenario;

const TICK: Duration = Duration::from_millis(250);
/// Buffer ahead under which playback cannot continue.
const REBUFFER_GAP: f64 = 0.05;
/// Buffer ahead at which the simulated element reports `HaveEnoughData`.
const ENOUGH_DATA_GAP: f64 = 5.0;
const NATIVE_TRACKS: [TrackType; 2] = [TrackType::Audio, TrackType::Video];

#[derive(Debug)]
pub struct Report {
    pub position: f64,
    pub elapsed: f64,
    pub stalls: u32,
    pub stalled_secs: f64,
    pub ended: bool,
    /// Representation ids buffered over the session, per track type.
    pub representations: BTreeMap<TrackType, Vec<String>>,
    pub metrics: MetricsSnapshot,
}

impl Report {
    pub fn print(&self) -> Result<()> {
        println!("position      : {:.2}s", self.position);
        println!("session       : {:.2}s", self.elapsed);
        println!("stalls        : {} ({:.2}s)", self.stalls, self.stalled_secs);
        println!("reached end   : {}", self.ended);
        for (track_type, ids) in &self.representations {
            println!("{:<14}: {}", format!("{track_type} switches"), ids.join(" -> "));
        }
        println!("{}", serde_json::to_string_pretty(&self.metrics)?);
        Ok(())
    }
}

/// Simulated media element.
struct Player {
    position: f64,
    elapsed: f64,
    stalled: bool,
    stalls: u32,
    stalled_secs: f64,
    end_of_stream: bool,
    content_end: Option<f64>,
    seek: Option<(f64, f64)>,
    throughput_change: Option<(f64, f64)>,
    representations: BTreeMap<TrackType, Vec<String>>,
}

impl Player {
    fn new(args: &Args, content_end: Option<f64>) -> Self {
        Self {
            position: args.start,
            elapsed: 0.0,
            stalled: false,
            stalls: 0,
            stalled_secs: 0.0,
            end_of_stream: false,
            content_end,
            seek: args.seek,
            throughput_change: args.throughput_change,
            representations: BTreeMap::new(),
        }
    }

    fn reached_end(&self) -> bool {
        self.end_of_stream
            && self
                .content_end
                .is_some_and(|end| self.position >= end - REBUFFER_GAP)
    }

    /// Buffer ahead of the playhead, over every native sink created so far.
    fn buffer_gap(&self, sinks: &MemorySinkFactory) -> f64 {
        NATIVE_TRACKS
            .iter()
            .filter_map(|track_type| sinks.inspector(*track_type))
            .map(|inspector| {
                ranges::range_containing(&inspector.buffered(), self.position)
                    .map_or(0.0, |range| range.end - self.position)
            })
            .fold(None, |min: Option<f64>, gap| Some(min.map_or(gap, |m| m.min(gap))))
            .unwrap_or(0.0)
    }

    /// Moves the session forward by one tick and returns the observation to publish.
    fn advance(&mut self, sinks: &MemorySinkFactory, transport: &SimulatedTransport) -> ClockTick {
        let dt = TICK.as_secs_f64();
        self.elapsed += dt;

        if let Some((at, target)) = self.seek
            && self.elapsed >= at
        {
            info!(from = self.position, to = target, "Seeking");
            self.position = target;
            self.seek = None;
        }
        if let Some((at, bps)) = self.throughput_change
            && self.elapsed >= at
        {
            info!(throughput_bps = bps, "Network throughput changed");
            transport.set_throughput_bps(bps);
            self.throughput_change = None;
        }

        let gap = self.buffer_gap(sinks);
        if gap > REBUFFER_GAP {
            if self.stalled {
                info!(position = self.position, "Playback resumed");
                self.stalled = false;
            }
            self.position += dt.min(gap);
        } else if !self.reached_end() {
            if !self.stalled {
                warn!(position = self.position, "Playback stalled");
                self.stalls += 1;
                self.stalled = true;
            }
            self.stalled_secs += dt;
        }

        let gap = self.buffer_gap(sinks);
        let ready_state = if gap >= ENOUGH_DATA_GAP {
            ReadyState::HaveEnoughData
        } else if gap > REBUFFER_GAP {
            ReadyState::HaveFutureData
        } else {
            ReadyState::HaveMetadata
        };
        ClockTick {
            current_time: self.position,
            buffer_gap: gap,
            ready_state,
            stalled: self.stalled,
            live_gap: None,
        }
    }

    fn on_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::RepresentationChange {
                track_type,
                representation,
                ..
            } => {
                info!(
                    track = %track_type,
                    representation = %representation.id,
                    bitrate = representation.bitrate,
                    resolution = ?representation.resolution.map(|r| r.to_string()),
                    "Representation changed"
                );
                self.representations
                    .entry(track_type)
                    .or_default()
                    .push(representation.id.clone());
            }
            StreamEvent::AddedSegment {
                track_type, segment, ..
            } => {
                debug!(track = %track_type, segment = %segment.id, start = segment.start_secs(), "Segment buffered");
            }
            StreamEvent::NeedsMediaSourceReload { track_type, time } => {
                warn!(track = %track_type, time, "Media pipeline reload requested");
                self.position = time;
            }
            StreamEvent::Warning { track_type, error } => {
                warn!(track = ?track_type, error = %error, "Engine warning");
            }
            StreamEvent::EndOfStream => {
                info!(position = self.position, "End of stream");
                self.end_of_stream = true;
            }
            StreamEvent::ResumeStream => self.end_of_stream = false,
            other => {
                debug!(kind = other.kind(), track = ?other.track_type(), period = ?other.period().map(|p| p.id.clone()), "Engine event");
            }
        }
    }
}

pub async fn run(args: &Args, config: BufferConfig) -> Result<Report> {
    let Scenario {
        manifest,
        transport,
        sinks,
        content_end,
    } = Scenario::from_args(args)?;
    info!(
        periods = manifest.periods.len(),
        live = manifest.is_live,
        duration = ?content_end,
        "Starting simulation"
    );

    let sinks = Arc::new(sinks);
    let transport = Arc::new(transport);
    let mut player = Player::new(args, content_end);
    let (clock_tx, clock) = watch::channel(ClockTick::at(player.position));
    let (_config_tx, config) = watch::channel(config);

    let mut deps = EngineDeps::new(manifest.into_shared(), sinks.clone(), transport.clone(), clock, config);
    if args.live {
        deps = deps.with_manifest_refresh(transport.clone(), "sim://live");
    }
    let (mut events, handle, task) = BuffersHandler::spawn(deps, CancellationToken::new())?;

    let mut ticker = tokio::time::interval(TICK);
    let mut failure = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Ok(event)) => player.on_event(event),
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => {
                clock_tx.send_replace(player.advance(&sinks, &transport));
                if player.reached_end() || player.elapsed >= args.duration {
                    break;
                }
            }
        }
    }

    handle.shutdown();
    task.await?;
    if let Some(e) = failure {
        return Err(e.into());
    }
    Ok(Report {
        position: player.position,
        elapsed: player.elapsed,
        stalls: player.stalls,
        stalled_secs: player.stalled_secs,
        ended: player.reached_end(),
        representations: player.representations,
        metrics: handle.metrics(),
    })
}
