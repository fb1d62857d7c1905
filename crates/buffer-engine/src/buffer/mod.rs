// Buffer state machines, from the innermost to the outermost:
//
// - `RepresentationBuffer`: segment scheduling loop for one Representation.
// - `AdaptationBuffer`: picks the Representation and restarts the loop on changes.
// - `PeriodBuffer`: one task per (track type, Period), owns the Adaptation choice.
//
// Representation and Adaptation buffers are plain futures polled by the Period buffer
// task: dropping them stops every pending request and ignores its result.

mod adaptation;
mod period;
mod representation;
mod switch_strategy;
#[cfg(test)]
pub(crate) mod test_support;

pub use representation::{WantedWindow, time_shift_padding, wanted_buffer_size};
pub use switch_strategy::{SwitchStrategy, adaptation_switch_strategy};

pub(crate) use period::{PeriodBuffer, PeriodBufferParams};

use std::sync::Arc;

use media_types::TrackType;
use tokio::sync::{mpsc, watch};

use crate::clock::ClockTick;
use crate::config::BufferConfig;
use crate::error::BufferError;
use crate::events::StreamEvent;
use crate::metrics::EngineMetrics;
use crate::transport::SegmentFetcher;

/// Shared inputs of every buffer.
#[derive(Clone)]
pub(crate) struct BufferDeps {
    pub fetcher: SegmentFetcher,
    pub clock: watch::Receiver<ClockTick>,
    pub config: watch::Receiver<BufferConfig>,
    /// Bumped every time the manifest is updated.
    pub manifest_version: watch::Receiver<u64>,
    pub metrics: Arc<EngineMetrics>,
}

#[derive(Debug)]
pub(crate) enum PeriodMessageKind {
    Event(StreamEvent),
    /// The Period buffer stopped on an error that must stop playback.
    Failed(BufferError),
}

/// Message sent by a Period buffer task to the handler.
#[derive(Debug)]
pub(crate) struct PeriodMessage {
    /// Identifies the chain entry that sent the message.
    pub generation: u64,
    pub track_type: TrackType,
    pub kind: PeriodMessageKind,
}

/// Sending half used by a Period buffer and the buffers it drives.
#[derive(Clone)]
pub(crate) struct PeriodEmitter {
    generation: u64,
    track_type: TrackType,
    tx: mpsc::Sender<PeriodMessage>,
}

impl PeriodEmitter {
    pub fn new(generation: u64, track_type: TrackType, tx: mpsc::Sender<PeriodMessage>) -> Self {
        Self {
            generation,
            track_type,
            tx,
        }
    }

    /// Returns `false` once the handler stopped listening.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        self.send(PeriodMessageKind::Event(event)).await
    }

    pub async fn fail(&self, error: BufferError) -> bool {
        self.send(PeriodMessageKind::Failed(error)).await
    }

    async fn send(&self, kind: PeriodMessageKind) -> bool {
        self.tx
            .send(PeriodMessage {
                generation: self.generation,
                track_type: self.track_type,
                kind,
            })
            .await
            .is_ok()
    }
}
