use serde::{Deserialize, Serialize};

/// Media element readiness, ordered like the HTML `readyState` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    #[default]
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

/// Periodic playback observation pushed by the media clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockTick {
    /// Playback position in seconds.
    pub current_time: f64,
    /// Seconds buffered ahead of `current_time`.
    pub buffer_gap: f64,
    pub ready_state: ReadyState,
    /// Playback is stuck waiting for data.
    pub stalled: bool,
    /// Distance to the live edge in seconds, `None` for VOD.
    pub live_gap: Option<f64>,
}

impl Default for ClockTick {
    fn default() -> Self {
        Self {
            current_time: 0.0,
            buffer_gap: 0.0,
            ready_state: ReadyState::HaveNothing,
            stalled: false,
            live_gap: None,
        }
    }
}

impl ClockTick {
    pub fn at(current_time: f64) -> Self {
        Self {
            current_time,
            ..Self::default()
        }
    }

    pub fn with_buffer_gap(mut self, buffer_gap: f64) -> Self {
        self.buffer_gap = buffer_gap;
        self
    }

    pub fn with_ready_state(mut self, ready_state: ReadyState) -> Self {
        self.ready_state = ready_state;
        self
    }

    pub fn with_live_gap(mut self, live_gap: f64) -> Self {
        self.live_gap = Some(live_gap);
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Whether decoding has progressed past metadata.
    #[inline]
    pub fn has_current_data(&self) -> bool {
        self.ready_state > ReadyState::HaveMetadata
    }
}
