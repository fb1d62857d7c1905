// Synthetic content served by the simulated network.

use std::time::Duration;

use buffer_engine::{MemorySinkFactory, SimulatedTransport};
use media_types::{
    Adaptation, Manifest, Period, Representation, Resolution, Segment, SegmentIndex, SegmentTemplate,
    TrackType,
};

use crate::cli::Args;
use crate::error::{AppError, Result};

/// Seconds of content published by each live manifest refresh.
const LIVE_STEP: u64 = 6;
/// Seconds available behind the live edge at startup.
const LIVE_HEADROOM: u64 = 10;

pub struct Scenario {
    pub manifest: Manifest,
    pub transport: SimulatedTransport,
    pub sinks: MemorySinkFactory,
    /// End of the content, `None` for live streams.
    pub content_end: Option<f64>,
}

impl Scenario {
    pub fn from_args(args: &Args) -> Result<Self> {
        validate(args)?;
        let transport = SimulatedTransport::new(args.throughput)
            .with_latency(Duration::from_millis(args.latency_ms));
        let mut sinks = MemorySinkFactory::new();
        if let Some(quota) = args.video_quota {
            sinks = sinks.with_capacity(TrackType::Video, quota);
        }

        if args.live {
            let layout = LiveLayout::from_args(args);
            let refresh_layout = layout.clone();
            let transport = transport.with_manifests(Box::new(move |load: u32| {
                Some(refresh_layout.manifest(refresh_layout.edge + (u64::from(load) + 1) * LIVE_STEP))
            }));
            return Ok(Self {
                manifest: layout.manifest(layout.edge),
                transport,
                sinks,
                content_end: None,
            });
        }

        let manifest = vod_manifest(args);
        let content_end = manifest.duration();
        Ok(Self {
            manifest,
            transport,
            sinks,
            content_end,
        })
    }
}

fn validate(args: &Args) -> Result<()> {
    if args.bitrates.is_empty() {
        return Err(AppError::InvalidInput("at least one video bitrate is required".into()));
    }
    if args.segment_duration == 0 || args.period_length < args.segment_duration {
        return Err(AppError::InvalidInput(format!(
            "period length ({}s) must hold at least one segment of {}s",
            args.period_length, args.segment_duration
        )));
    }
    if args.periods == 0 {
        return Err(AppError::InvalidInput("at least one period is required".into()));
    }
    if !(args.duration > 0.0) || !(args.throughput > 0.0) {
        return Err(AppError::InvalidInput("duration and throughput must be positive".into()));
    }
    Ok(())
}

fn timeline(start: u64, end: u64, segment_duration: u64) -> SegmentIndex {
    let segments = (start..end)
        .step_by(segment_duration as usize)
        .map(|time| Segment::media(time.to_string(), time, segment_duration.min(end - time), 1))
        .collect();
    SegmentIndex::timeline(1, Some(Segment::init("init")), segments, false)
}

/// Frame height usually encoded at `bitrate`.
fn ladder_height(bitrate: u64) -> u32 {
    match bitrate {
        ..=500_000 => 360,
        ..=1_500_000 => 540,
        ..=4_000_000 => 720,
        _ => 1080,
    }
}

fn representations(prefix: &str, bitrates: &[u64], codec: &str, index: impl Fn() -> SegmentIndex) -> Vec<Representation> {
    bitrates
        .iter()
        .map(|bitrate| Representation::new(format!("{prefix}-{bitrate}"), *bitrate, index()).with_codec(codec))
        .collect()
}

fn video_representations(prefix: &str, bitrates: &[u64], index: impl Fn() -> SegmentIndex) -> Vec<Representation> {
    representations(prefix, bitrates, "avc1.64001f", index)
        .into_iter()
        .map(|rep| {
            let height = ladder_height(rep.bitrate);
            rep.with_resolution(Resolution::from_height(height))
        })
        .collect()
}

pub fn vod_manifest(args: &Args) -> Manifest {
    let periods = (0..u64::from(args.periods))
        .map(|n| {
            let (start, end) = (n * args.period_length, (n + 1) * args.period_length);
            let index = || timeline(start, end, args.segment_duration);
            let id = format!("p{n}");
            Period::new(&id, start as f64, Some(end as f64))
                .with_adaptation(Adaptation::new(
                    format!("{id}-audio"),
                    TrackType::Audio,
                    representations(&format!("{id}-a"), &[args.audio_bitrate], "mp4a.40.2", index),
                ))
                .with_adaptation(Adaptation::new(
                    format!("{id}-video"),
                    TrackType::Video,
                    video_representations(&format!("{id}-v"), &args.bitrates, index),
                ))
        })
        .collect();
    Manifest::new("bufsim-vod", false, periods)
}

/// Shape of the simulated live stream.
#[derive(Clone)]
struct LiveLayout {
    bitrates: Vec<u64>,
    audio_bitrate: u64,
    segment_duration: u64,
    /// Live edge of the initial manifest.
    edge: u64,
}

impl LiveLayout {
    fn from_args(args: &Args) -> Self {
        Self {
            bitrates: args.bitrates.clone(),
            audio_bitrate: args.audio_bitrate,
            segment_duration: args.segment_duration,
            edge: args.start.max(0.0).ceil() as u64 + LIVE_HEADROOM,
        }
    }

    fn manifest(&self, edge: u64) -> Manifest {
        let index = || {
            let template = SegmentTemplate::new("$Number$.m4s", self.segment_duration).with_end_time(edge);
            SegmentIndex::template(1, Some(Segment::init("init")), template, true)
        };
        let period = Period::new("live", 0.0, None)
            .with_adaptation(Adaptation::new(
                "live-audio",
                TrackType::Audio,
                representations("live-a", &[self.audio_bitrate], "mp4a.40.2", index),
            ))
            .with_adaptation(Adaptation::new(
                "live-video",
                TrackType::Video,
                video_representations("live-v", &self.bitrates, index),
            ));
        Manifest::new("bufsim-live", true, vec![period])
    }
}
