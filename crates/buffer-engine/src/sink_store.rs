// Sink Store: owns one sink per track type together with its bookkeeper and collector.
//
// A `SinkContext` is created with the sink and destroyed with it. Native sinks are
// created once and reused by every Period; custom sinks can be disposed and created
// again at will.

use std::collections::HashMap;
use std::sync::Arc;

use media_types::TrackType;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

use crate::bookkeeper::SegmentBookkeeper;
use crate::clock::ClockTick;
use crate::config::BufferConfig;
use crate::error::BufferError;
use crate::gc::run_collector;
use crate::metrics::EngineMetrics;
use crate::sink::{SinkFactory, SinkHandle};

/// A sink and the state attached to it.
#[derive(Debug, Clone)]
pub struct SinkContext {
    pub track_type: TrackType,
    pub codec: Option<String>,
    pub handle: SinkHandle,
    pub bookkeeper: Arc<Mutex<SegmentBookkeeper>>,
    token: CancellationToken,
}

impl SinkContext {
    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct SinkStore {
    factory: Arc<dyn SinkFactory>,
    clock: watch::Receiver<ClockTick>,
    config: watch::Receiver<BufferConfig>,
    metrics: Arc<EngineMetrics>,
    token: CancellationToken,
    sinks: Mutex<HashMap<TrackType, SinkContext>>,
}

impl SinkStore {
    pub fn new(
        factory: Arc<dyn SinkFactory>,
        clock: watch::Receiver<ClockTick>,
        config: watch::Receiver<BufferConfig>,
        metrics: Arc<EngineMetrics>,
        token: CancellationToken,
    ) -> Self {
        Self {
            factory,
            clock,
            config,
            metrics,
            token,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, track_type: TrackType) -> Option<SinkContext> {
        self.sinks.lock().get(&track_type).cloned()
    }

    /// Returns the existing sink for `track_type`, creating it if needed.
    pub async fn get_or_create(
        &self,
        track_type: TrackType,
        codec: Option<&str>,
    ) -> Result<SinkContext, BufferError> {
        if let Some(context) = self.get(track_type) {
            debug!(track = %track_type, "Reusing sink");
            return Ok(context);
        }
        self.create(track_type, codec).await
    }

    /// Creates the sink for `track_type`. Fails if one already exists.
    pub async fn create(&self, track_type: TrackType, codec: Option<&str>) -> Result<SinkContext, BufferError> {
        if self.sinks.lock().contains_key(&track_type) {
            return Err(BufferError::DuplicateSink { track_type });
        }
        let sink = self
            .factory
            .create_sink(track_type, codec)
            .await
            .map_err(|e| BufferError::sink(track_type, e))?;

        let token = self.token.child_token();
        let (handle, _worker) = SinkHandle::spawn(track_type, sink, token.clone());
        let bookkeeper = Arc::new(Mutex::new(SegmentBookkeeper::new()));
        let context = SinkContext {
            track_type,
            codec: codec.map(str::to_owned),
            handle: handle.clone(),
            bookkeeper: Arc::clone(&bookkeeper),
            token: token.clone(),
        };

        {
            let mut sinks = self.sinks.lock();
            if sinks.contains_key(&track_type) {
                token.cancel();
                return Err(BufferError::DuplicateSink { track_type });
            }
            sinks.insert(track_type, context.clone());
        }

        let span = tracing::debug_span!("gc", track = %track_type);
        tokio::spawn(
            run_collector(
                handle,
                bookkeeper,
                self.clock.clone(),
                self.config.clone(),
                Arc::clone(&self.metrics),
                token,
            )
            .instrument(span),
        );
        info!(track = %track_type, codec = ?codec, "Sink created");
        Ok(context)
    }

    /// Stops the sink worker and its collector. The sink is disposed once pending
    /// operations are dropped.
    pub fn dispose(&self, track_type: TrackType) {
        if let Some(context) = self.sinks.lock().remove(&track_type) {
            context.token.cancel();
            info!(track = %track_type, "Sink disposed");
        }
    }

    pub fn dispose_all(&self) {
        let drained: Vec<_> = self.sinks.lock().drain().collect();
        for (track_type, context) in drained {
            context.token.cancel();
            debug!(track = %track_type, "Sink disposed");
        }
    }

    pub fn track_types(&self) -> Vec<TrackType> {
        let mut types: Vec<_> = self.sinks.lock().keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySinkFactory;

    fn store(factory: Arc<MemorySinkFactory>) -> SinkStore {
        let (_clock_tx, clock) = watch::channel(ClockTick::default());
        let (_config_tx, config) = watch::channel(BufferConfig::default());
        SinkStore::new(
            factory,
            clock,
            config,
            Arc::new(EngineMetrics::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_native_sink_is_reused() {
        let factory = Arc::new(MemorySinkFactory::new());
        let store = store(factory.clone());
        let first = store.get_or_create(TrackType::Video, Some("avc1")).await.unwrap();
        let second = store.get_or_create(TrackType::Video, Some("hvc1")).await.unwrap();
        assert!(Arc::ptr_eq(&first.bookkeeper, &second.bookkeeper));
        assert_eq!(second.codec.as_deref(), Some("avc1"));
        assert_eq!(factory.created(TrackType::Video), 1);
    }

    #[tokio::test]
    async fn test_duplicate_creation_fails() {
        let store = store(Arc::new(MemorySinkFactory::new()));
        store.create(TrackType::Audio, None).await.unwrap();
        let err = store.create(TrackType::Audio, None).await.unwrap_err();
        assert!(matches!(err, BufferError::DuplicateSink { track_type: TrackType::Audio }));
        assert!(err.is_fatal_for(TrackType::Audio));
    }

    #[tokio::test]
    async fn test_dispose_allows_recreation() {
        let factory = Arc::new(MemorySinkFactory::new());
        let store = store(factory.clone());
        let text = store.create(TrackType::Text, None).await.unwrap();
        store.dispose(TrackType::Text);
        assert!(text.is_disposed());
        assert!(store.get(TrackType::Text).is_none());

        store.create(TrackType::Text, None).await.unwrap();
        assert_eq!(factory.created(TrackType::Text), 2);
        assert_eq!(store.track_types(), vec![TrackType::Text]);

        store.dispose_all();
        assert!(store.track_types().is_empty());
    }
}
