// Buffer engine configuration. Every numeric tuning value lives here as a default.
//
// The configuration is shared through a `tokio::sync::watch` channel so that it can be
// updated while buffers are running; each scheduling cycle reads the latest value.

use std::time::Duration;

use media_types::TrackType;
use serde::{Deserialize, Serialize};

/// How a manual bitrate change is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualSwitchingMode {
    /// Keep already buffered data, only request the new quality for unbuffered time.
    #[default]
    Seamless,
    /// Apply the switch strategy immediately (clean the buffer or reload).
    Direct,
}

/// One value per track type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackParams<T> {
    pub audio: T,
    pub video: T,
    pub text: T,
    pub image: T,
}

impl<T> TrackParams<T> {
    pub fn get(&self, track_type: TrackType) -> &T {
        match track_type {
            TrackType::Audio => &self.audio,
            TrackType::Video => &self.video,
            TrackType::Text => &self.text,
            TrackType::Image => &self.image,
        }
    }

    pub fn get_mut(&mut self, track_type: TrackType) -> &mut T {
        match track_type {
            TrackType::Audio => &mut self.audio,
            TrackType::Video => &mut self.video,
            TrackType::Text => &mut self.text,
            TrackType::Image => &mut self.image,
        }
    }
}

impl<T: Clone> TrackParams<T> {
    pub fn uniform(value: T) -> Self {
        Self {
            audio: value.clone(),
            video: value.clone(),
            text: value.clone(),
            image: value,
        }
    }
}

impl<T: Default> Default for TrackParams<T> {
    fn default() -> Self {
        Self {
            audio: T::default(),
            video: T::default(),
            text: T::default(),
            image: T::default(),
        }
    }
}

/// Bounds of the time-shift padding applied before the playhead, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaterMarks {
    pub low: f64,
    pub high: f64,
}

impl WaterMarks {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }
}

/// Safety margin kept around the playhead when cleaning the buffer for a switch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SwitchPadding {
    pub before: f64,
    pub after: f64,
}

impl SwitchPadding {
    pub fn new(before: f64, after: f64) -> Self {
        Self { before, after }
    }
}

/// Backoff parameters for segment requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, doubled for each following one
    pub base_delay_ms: u64,
    /// Upper bound of a single delay
    pub max_delay_ms: u64,
    /// Random variation applied to each delay (0.3 = +/-30%)
    pub fuzz_factor: f64,
    /// Separate budget for errors caused by a lost connection
    pub max_retries_offline: u32,
    /// Failure counters reset when no error happened for this long
    pub reset_after_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_delay_ms: 3_000,
            fuzz_factor: 0.3,
            max_retries_offline: u32::MAX,
            reset_after_ms: Some(60_000),
        }
    }
}

/// Forced garbage collection gaps used to recover from a full sink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForcedGcConfig {
    /// First attempt keeps this many seconds around the playhead
    pub calm_gap: f64,
    /// Used when the first attempt freed nothing
    pub beefy_gap: f64,
}

impl Default for ForcedGcConfig {
    fn default() -> Self {
        Self {
            calm_gap: 40.0,
            beefy_gap: 5.0,
        }
    }
}

/// Bandwidth estimation and selection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    pub fast_half_life_secs: f64,
    pub slow_half_life_secs: f64,
    /// Bytes that must be sampled before the estimate is trusted
    pub min_total_bytes: u64,
    /// Requests smaller than this are not sampled
    pub min_chunk_bytes: u64,
    /// Buffer gap under which starvation mode is entered
    pub starvation_gap: f64,
    /// Buffer gap over which starvation mode is left
    pub out_of_starvation_gap: f64,
    pub starvation_bitrate_factor: f64,
    pub regular_bitrate_factor: f64,
    /// Bitrate assumed before any estimate is available
    pub initial_bitrate: TrackParams<u64>,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            fast_half_life_secs: 2.0,
            slow_half_life_secs: 10.0,
            min_total_bytes: 150_000,
            min_chunk_bytes: 16_000,
            starvation_gap: 5.0,
            out_of_starvation_gap: 7.0,
            starvation_bitrate_factor: 0.72,
            regular_bitrate_factor: 0.8,
            initial_bitrate: TrackParams::default(),
        }
    }
}

/// User constraints on Representation selection for one track type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepresentationConstraints {
    /// Disables adaptive selection: highest bitrate under this value is used
    pub manual_bitrate: Option<u64>,
    pub min_auto_bitrate: Option<u64>,
    pub max_auto_bitrate: Option<u64>,
    /// Representation ids that must never be selected
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Seconds of media the engine tries to keep ahead of the playhead
    pub wanted_buffer_ahead: f64,
    /// Hard limit on buffered media ahead of the playhead, enforced by GC
    pub max_buffer_ahead: Option<f64>,
    /// Buffered media older than this behind the playhead is collected
    pub max_buffer_behind: Option<f64>,
    pub manual_bitrate_switching_mode: ManualSwitchingMode,
    pub water_marks: TrackParams<WaterMarks>,
    pub switch_padding: TrackParams<SwitchPadding>,
    /// Retry budget for non-offline errors, per track type
    pub segment_retries: TrackParams<u32>,
    pub retry: RetryConfig,
    /// Buffered data is kept when `buffered_bitrate * ratio >= new_bitrate`
    pub bitrate_rebuffering_ratio: f64,
    /// Wait before restarting a buffer after an HTTP 412 response
    pub precondition_backoff_ms: u64,
    pub forced_gc: ForcedGcConfig,
    pub abr: AbrConfig,
    pub constraints: TrackParams<RepresentationConstraints>,
    /// Refresh the manifest automatically when a buffer needs it
    pub auto_manifest_refresh: bool,
    pub manifest_refresh_min_interval_ms: u64,
    /// Capacity of the event channel returned to the player
    pub event_channel_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            wanted_buffer_ahead: 30.0,
            max_buffer_ahead: None,
            max_buffer_behind: None,
            manual_bitrate_switching_mode: ManualSwitchingMode::default(),
            water_marks: TrackParams {
                audio: WaterMarks::new(1.0, 1.0),
                video: WaterMarks::new(4.0, 6.0),
                text: WaterMarks::new(1.0, 1.0),
                image: WaterMarks::new(1.0, 1.0),
            },
            switch_padding: TrackParams {
                audio: SwitchPadding::new(2.0, 2.5),
                video: SwitchPadding::new(2.0, 2.5),
                text: SwitchPadding::new(0.0, 0.0),
                image: SwitchPadding::new(0.0, 0.0),
            },
            segment_retries: TrackParams::uniform(4),
            retry: RetryConfig::default(),
            bitrate_rebuffering_ratio: 1.5,
            precondition_backoff_ms: 2_000,
            forced_gc: ForcedGcConfig::default(),
            abr: AbrConfig::default(),
            constraints: TrackParams::default(),
            auto_manifest_refresh: true,
            manifest_refresh_min_interval_ms: 3_000,
            event_channel_capacity: 64,
        }
    }
}

impl BufferConfig {
    /// Buffer goal after applying `max_buffer_ahead`.
    pub fn buffer_goal(&self) -> f64 {
        let goal = self.wanted_buffer_ahead.max(0.0);
        match self.max_buffer_ahead {
            Some(max) => goal.min(max),
            None => goal,
        }
    }

    pub fn precondition_backoff(&self) -> Duration {
        Duration::from_millis(self.precondition_backoff_ms)
    }

    pub fn manifest_refresh_min_interval(&self) -> Duration {
        Duration::from_millis(self.manifest_refresh_min_interval_ms)
    }

    /// Parses a JSON override; missing fields keep their default value.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
