// Media sinks: the append/remove targets data is pushed into.
//
// A sink is a single-writer resource. Every mutation goes through the `SinkHandle`
// FIFO, processed by one worker task per sink, so appends from the buffers, switch
// cleanup and garbage collection never overlap.

mod memory;
mod queue;

pub use memory::{MemorySink, MemorySinkFactory, MemorySinkInspector};
pub use queue::SinkHandle;

use async_trait::async_trait;
use bytes::Bytes;
use media_types::TrackType;

use crate::error::SinkError;
use crate::ranges::TimeRange;

/// Data pushed to a sink.
#[derive(Debug, Clone)]
pub struct SinkChunk {
    pub data: Bytes,
    pub codec: Option<String>,
    /// Offset added to the media timestamps, in seconds.
    pub timestamp_offset: f64,
    /// Data outside of this window is dropped by the sink (Period bounds).
    pub append_window: TimeRange,
    /// Time range covered by the data, `None` for initialization data.
    pub time_range: Option<TimeRange>,
    /// Identifier of the segment the data comes from, for diagnostics.
    pub segment_id: String,
}

#[async_trait]
pub trait MediaSink: Send {
    async fn append(&mut self, chunk: SinkChunk) -> Result<(), SinkError>;

    async fn remove(&mut self, start: f64, end: f64) -> Result<(), SinkError>;

    fn buffered_ranges(&self) -> Vec<TimeRange>;

    /// Releases the underlying resources. Called once the sink is no longer used.
    fn dispose(&mut self) {}
}

#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create_sink(
        &self,
        track_type: TrackType,
        codec: Option<&str>,
    ) -> Result<Box<dyn MediaSink>, SinkError>;
}
