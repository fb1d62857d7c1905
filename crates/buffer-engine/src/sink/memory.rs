// In-memory sink: keeps track of appended time ranges and their size.
//
// Used by the `bufsim` simulator and by tests. A capacity can be set to reproduce
// quota errors, and failures can be injected through the inspector.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use media_types::TrackType;
use parking_lot::Mutex;
use tracing::debug;

use super::{MediaSink, SinkChunk, SinkFactory};
use crate::error::SinkError;
use crate::ranges::{RANGE_EPSILON, TimeRange, normalize};

#[derive(Debug, Clone)]
struct StoredChunk {
    range: TimeRange,
    bytes: usize,
}

impl StoredChunk {
    /// Part of the chunk inside `[start, end)`, with a proportional size.
    fn slice(&self, start: f64, end: f64) -> Option<StoredChunk> {
        let start = start.max(self.range.start);
        let end = end.min(self.range.end);
        if end - start <= RANGE_EPSILON {
            return None;
        }
        let ratio = (end - start) / self.range.duration().max(f64::EPSILON);
        Some(StoredChunk {
            range: TimeRange::new(start, end),
            bytes: (self.bytes as f64 * ratio).round() as usize,
        })
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    chunks: Vec<StoredChunk>,
    capacity: Option<usize>,
    quota_failures: u32,
    generic_failures: u32,
    append_attempts: u32,
    appended: Vec<String>,
    removals: Vec<TimeRange>,
    disposed: bool,
}

impl MemorySinkState {
    fn used_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.bytes).sum()
    }

    fn cut(&mut self, start: f64, end: f64) {
        let mut kept = Vec::with_capacity(self.chunks.len() + 1);
        for chunk in self.chunks.drain(..) {
            if chunk.range.end <= start || chunk.range.start >= end {
                kept.push(chunk);
                continue;
            }
            kept.extend(chunk.slice(f64::NEG_INFINITY, start));
            kept.extend(chunk.slice(end, f64::INFINITY));
        }
        self.chunks = kept;
    }

    fn buffered(&self) -> Vec<TimeRange> {
        let mut ranges: Vec<_> = self.chunks.iter().map(|c| c.range).collect();
        normalize(&mut ranges);
        ranges
    }
}

pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    /// Creates a sink holding at most `capacity` bytes, and an inspector observing it.
    pub fn new(capacity: Option<usize>) -> (Self, MemorySinkInspector) {
        let state = Arc::new(Mutex::new(MemorySinkState {
            capacity,
            ..MemorySinkState::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            MemorySinkInspector { state },
        )
    }
}

#[async_trait]
impl MediaSink for MemorySink {
    async fn append(&mut self, chunk: SinkChunk) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.append_attempts += 1;
        if state.disposed {
            return Err(SinkError::Closed);
        }
        if state.quota_failures > 0 {
            state.quota_failures -= 1;
            return Err(SinkError::QuotaExceeded);
        }
        if state.generic_failures > 0 {
            state.generic_failures -= 1;
            return Err(SinkError::generic("injected append failure"));
        }

        let Some(range) = chunk.time_range else {
            // Initialization data does not occupy buffered time.
            state.appended.push(chunk.segment_id);
            return Ok(());
        };
        let start = (range.start + chunk.timestamp_offset).max(chunk.append_window.start);
        let end = (range.end + chunk.timestamp_offset).min(chunk.append_window.end);
        if end - start <= RANGE_EPSILON {
            state.appended.push(chunk.segment_id);
            return Ok(());
        }

        let stored = StoredChunk {
            range: TimeRange::new(start, end),
            bytes: chunk.data.len(),
        };
        if let Some(capacity) = state.capacity {
            let replaced: usize = state
                .chunks
                .iter()
                .filter_map(|c| c.slice(start, end))
                .map(|c| c.bytes)
                .sum();
            if state.used_bytes() - replaced + stored.bytes > capacity {
                return Err(SinkError::QuotaExceeded);
            }
        }
        state.cut(start, end);
        state.chunks.push(stored);
        state.appended.push(chunk.segment_id);
        Ok(())
    }

    async fn remove(&mut self, start: f64, end: f64) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(SinkError::Closed);
        }
        state.cut(start, end);
        state.removals.push(TimeRange::new(start, end));
        Ok(())
    }

    fn buffered_ranges(&self) -> Vec<TimeRange> {
        self.state.lock().buffered()
    }

    fn dispose(&mut self) {
        self.state.lock().disposed = true;
    }
}

/// Observes and manipulates a [`MemorySink`] from outside the sink worker.
#[derive(Clone)]
pub struct MemorySinkInspector {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySinkInspector {
    pub fn buffered(&self) -> Vec<TimeRange> {
        self.state.lock().buffered()
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes()
    }

    /// Segment ids successfully appended, in order.
    pub fn appended_ids(&self) -> Vec<String> {
        self.state.lock().appended.clone()
    }

    pub fn append_attempts(&self) -> u32 {
        self.state.lock().append_attempts
    }

    pub fn removals(&self) -> Vec<TimeRange> {
        self.state.lock().removals.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// The next `count` appends fail with [`SinkError::QuotaExceeded`].
    pub fn fail_next_appends_with_quota(&self, count: u32) {
        self.state.lock().quota_failures = count;
    }

    /// The next `count` appends fail with [`SinkError::Generic`].
    pub fn fail_next_appends(&self, count: u32) {
        self.state.lock().generic_failures = count;
    }

    /// Drops data as a platform would when evicting on its own.
    pub fn evict(&self, start: f64, end: f64) {
        self.state.lock().cut(start, end);
    }
}

/// Creates [`MemorySink`]s and keeps an inspector for each of them.
#[derive(Default)]
pub struct MemorySinkFactory {
    capacity: HashMap<TrackType, usize>,
    inspectors: Mutex<HashMap<TrackType, Vec<MemorySinkInspector>>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, track_type: TrackType, bytes: usize) -> Self {
        self.capacity.insert(track_type, bytes);
        self
    }

    /// Inspector of the most recently created sink for `track_type`.
    pub fn inspector(&self, track_type: TrackType) -> Option<MemorySinkInspector> {
        self.inspectors
            .lock()
            .get(&track_type)
            .and_then(|p| p.last().cloned())
    }

    /// Number of sinks created for `track_type`.
    pub fn created(&self, track_type: TrackType) -> usize {
        self.inspectors.lock().get(&track_type).map_or(0, Vec::len)
    }
}

#[async_trait]
impl SinkFactory for MemorySinkFactory {
    async fn create_sink(
        &self,
        track_type: TrackType,
        codec: Option<&str>,
    ) -> Result<Box<dyn MediaSink>, SinkError> {
        let capacity = self.capacity.get(&track_type).copied();
        debug!(track = %track_type, codec = ?codec, capacity = ?capacity, "Creating memory sink");
        let (sink, inspector) = MemorySink::new(capacity);
        self.inspectors.lock().entry(track_type).or_default().push(inspector);
        Ok(Box::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(id: &str, start: f64, end: f64, bytes: usize) -> SinkChunk {
        SinkChunk {
            data: Bytes::from(vec![0u8; bytes]),
            codec: Some("avc1.4d401f".to_string()),
            timestamp_offset: 0.0,
            append_window: TimeRange::new(0.0, 100.0),
            time_range: Some(TimeRange::new(start, end)),
            segment_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_quota_is_enforced() {
        let (mut sink, inspector) = MemorySink::new(Some(1_000));
        sink.append(chunk("a", 0.0, 2.0, 600)).await.unwrap();
        let err = sink.append(chunk("b", 2.0, 4.0, 600)).await.unwrap_err();
        assert_eq!(err, SinkError::QuotaExceeded);

        sink.remove(0.0, 2.0).await.unwrap();
        sink.append(chunk("b", 2.0, 4.0, 600)).await.unwrap();
        assert_eq!(inspector.used_bytes(), 600);
        assert_eq!(inspector.appended_ids(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_overlapping_append_replaces_data() {
        let (mut sink, inspector) = MemorySink::new(Some(1_000));
        sink.append(chunk("a", 0.0, 4.0, 800)).await.unwrap();
        sink.append(chunk("b", 2.0, 4.0, 500)).await.unwrap();
        assert_eq!(inspector.used_bytes(), 900);
        assert_eq!(sink.buffered_ranges(), vec![TimeRange::new(0.0, 4.0)]);
    }

    #[tokio::test]
    async fn test_append_window_clips_data() {
        let (mut sink, _inspector) = MemorySink::new(None);
        let mut c = chunk("a", 98.0, 102.0, 100);
        c.append_window = TimeRange::new(0.0, 100.0);
        sink.append(c).await.unwrap();
        assert_eq!(sink.buffered_ranges(), vec![TimeRange::new(98.0, 100.0)]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (mut sink, inspector) = MemorySink::new(None);
        inspector.fail_next_appends_with_quota(1);
        assert_eq!(
            sink.append(chunk("a", 0.0, 2.0, 10)).await,
            Err(SinkError::QuotaExceeded)
        );
        assert!(sink.append(chunk("a", 0.0, 2.0, 10)).await.is_ok());
        assert_eq!(inspector.append_attempts(), 2);

        inspector.evict(0.0, 1.0);
        assert_eq!(inspector.buffered(), vec![TimeRange::new(1.0, 2.0)]);
    }

    #[tokio::test]
    async fn test_factory_tracks_created_sinks() {
        let factory = MemorySinkFactory::new().with_capacity(TrackType::Video, 10);
        factory.create_sink(TrackType::Video, None).await.unwrap();
        factory.create_sink(TrackType::Text, None).await.unwrap();
        factory.create_sink(TrackType::Text, None).await.unwrap();
        assert_eq!(factory.created(TrackType::Video), 1);
        assert_eq!(factory.created(TrackType::Text), 2);
        assert!(factory.inspector(TrackType::Audio).is_none());
    }
}
