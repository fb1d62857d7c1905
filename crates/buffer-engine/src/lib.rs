// Adaptive-bitrate buffering engine
//
// Decides which media segments to download, in which quality, and when, then pushes
// them into per-track media sinks while the playhead moves. Built around a
// `BuffersHandler` that owns one chain of Period buffers per track type.
pub mod abr;
pub mod bookkeeper;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gc;
pub mod handler;
pub mod metrics;
pub mod ranges;
pub mod retry;
pub mod sink;
pub mod sink_store;
pub mod transport;

// Export common types for ease of use
pub use abr::{AbrManager, Estimator, EwmaEstimator, RequestSample};
pub use bookkeeper::SegmentBookkeeper;
pub use clock::{ClockTick, ReadyState};
pub use config::{BufferConfig, ManualSwitchingMode, SwitchPadding, TrackParams, WaterMarks};
pub use error::{BufferError, SinkError, TransportError};
pub use events::{AdaptationSelector, StreamEvent};
pub use handler::{BuffersHandler, EngineDeps, EventReceiver, FirstAdaptation, StreamHandle, TrackSelector};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use ranges::TimeRange;
pub use sink::{MediaSink, MemorySinkFactory, MemorySinkInspector, SinkChunk, SinkFactory, SinkHandle};
pub use transport::{HttpSegmentLoader, ManifestLoader, SegmentTransport, SimulatedTransport};
