// Buffers handler: top-level orchestration of the Period buffers.
//
// For each track type, a chain of Period buffers covers consecutive Periods starting
// at the playhead. A Period reporting `Full` triggers the buffer of the next one,
// new segments in a Period tear down the buffers created after it, and a playhead
// leaving the chain restarts it from the Period containing the new position.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use media_types::{Adaptation, Manifest, Period, SharedManifest, TrackType};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::abr::{Estimator, EwmaEstimator, SharedEstimator};
use crate::buffer::{BufferDeps, PeriodBuffer, PeriodBufferParams, PeriodEmitter, PeriodMessage, PeriodMessageKind};
use crate::clock::ClockTick;
use crate::config::BufferConfig;
use crate::error::{BufferError, TransportError};
use crate::events::{AdaptationSelector, StreamEvent};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::sink::SinkFactory;
use crate::sink_store::SinkStore;
use crate::transport::{ManifestLoader, SegmentFetcher, SegmentTransport};

const PERIOD_MESSAGES_CAPACITY: usize = 128;
const COMMANDS_CAPACITY: usize = 8;

/// Events delivered to the player. A fatal error is sent as `Err` right before the
/// engine stops.
pub type EventReceiver = mpsc::Receiver<Result<StreamEvent, BufferError>>;

/// Picks the Adaptation buffered when a Period buffer is created.
pub trait TrackSelector: Send + Sync {
    fn select(&self, period: &Period, track_type: TrackType) -> Option<Arc<Adaptation>>;
}

/// Selects the first Adaptation of each track type.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAdaptation;

impl TrackSelector for FirstAdaptation {
    fn select(&self, period: &Period, track_type: TrackType) -> Option<Arc<Adaptation>> {
        period.adaptations_for(track_type).first().cloned()
    }
}

/// Where refreshed manifests are loaded from.
pub struct ManifestRefresh {
    pub loader: Arc<dyn ManifestLoader>,
    pub url: String,
}

/// Collaborators of the engine.
pub struct EngineDeps {
    pub manifest: SharedManifest,
    pub sink_factory: Arc<dyn SinkFactory>,
    pub transport: Arc<dyn SegmentTransport>,
    pub clock: watch::Receiver<ClockTick>,
    pub config: watch::Receiver<BufferConfig>,
    /// Enables automatic manifest refreshes.
    pub manifest_refresh: Option<ManifestRefresh>,
    pub track_selector: Arc<dyn TrackSelector>,
}

impl EngineDeps {
    pub fn new(
        manifest: SharedManifest,
        sink_factory: Arc<dyn SinkFactory>,
        transport: Arc<dyn SegmentTransport>,
        clock: watch::Receiver<ClockTick>,
        config: watch::Receiver<BufferConfig>,
    ) -> Self {
        Self {
            manifest,
            sink_factory,
            transport,
            clock,
            config,
            manifest_refresh: None,
            track_selector: Arc::new(FirstAdaptation),
        }
    }

    pub fn with_manifest_refresh(mut self, loader: Arc<dyn ManifestLoader>, url: impl Into<String>) -> Self {
        self.manifest_refresh = Some(ManifestRefresh {
            loader,
            url: url.into(),
        });
        self
    }

    pub fn with_track_selector(mut self, selector: Arc<dyn TrackSelector>) -> Self {
        self.track_selector = selector;
        self
    }
}

enum Command {
    UpdateManifest(Manifest),
}

/// Control surface of a running engine.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    commands: mpsc::Sender<Command>,
    metrics: Arc<EngineMetrics>,
    token: CancellationToken,
}

impl StreamHandle {
    /// Merges a newer version of the manifest into the one being buffered.
    pub async fn update_manifest(&self, manifest: Manifest) -> Result<(), BufferError> {
        self.commands
            .send(Command::UpdateManifest(manifest))
            .await
            .map_err(|_| BufferError::Cancelled)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct ChainEntry {
    /// Identifies messages coming from this entry's Period buffer.
    generation: u64,
    period: Arc<Period>,
    token: CancellationToken,
    /// Keeps the Adaptation choice open for as long as the entry lives, whatever
    /// the player does with the copy sent in `PeriodBufferReady`.
    selector: AdaptationSelector,
    full: bool,
    task: JoinHandle<()>,
}

/// Track types with at least one Adaptation in some Period.
fn manifest_track_types(manifest: &Manifest) -> Vec<TrackType> {
    let mut types: Vec<TrackType> = manifest.periods.iter().flat_map(|p| p.track_types()).collect();
    types.sort();
    types.dedup();
    types
}

/// Earliest Period present in every chain.
fn earliest_common_period(chains: &[Vec<Arc<Period>>]) -> Option<Arc<Period>> {
    let (first, rest) = chains.split_first()?;
    first
        .iter()
        .filter(|period| rest.iter().all(|chain| chain.iter().any(|p| p.id == period.id)))
        .min_by(|a, b| a.start.total_cmp(&b.start))
        .cloned()
}

pub struct BuffersHandler {
    manifest: SharedManifest,
    sinks: Arc<SinkStore>,
    deps: BufferDeps,
    clock: watch::Receiver<ClockTick>,
    track_selector: Arc<dyn TrackSelector>,
    manifest_refresh: Option<ManifestRefresh>,
    estimators: HashMap<TrackType, SharedEstimator>,
    track_types: Vec<TrackType>,
    chains: BTreeMap<TrackType, Vec<ChainEntry>>,
    next_generation: u64,
    period_tx: mpsc::Sender<PeriodMessage>,
    events: mpsc::Sender<Result<StreamEvent, BufferError>>,
    version_tx: watch::Sender<u64>,
    refresh_tx: mpsc::Sender<Result<Manifest, TransportError>>,
    refresh_pending: bool,
    last_refresh: Option<Instant>,
    active_period: Option<String>,
    end_of_stream: bool,
    metrics: Arc<EngineMetrics>,
    token: CancellationToken,
}

impl BuffersHandler {
    /// Starts buffering from the current clock position.
    ///
    /// Fails when no Period contains or follows the current position.
    pub fn spawn(
        deps: EngineDeps,
        token: CancellationToken,
    ) -> Result<(EventReceiver, StreamHandle, JoinHandle<()>), BufferError> {
        let start_time = deps.clock.borrow().current_time;
        let (track_types, has_period) = {
            let manifest = deps.manifest.read();
            (
                manifest_track_types(&manifest),
                manifest.period_at_or_after(start_time).is_some(),
            )
        };
        if !has_period {
            return Err(BufferError::MissingPeriod { time: start_time });
        }

        let token = token.child_token();
        let capacity = deps.config.borrow().event_channel_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (period_tx, period_rx) = mpsc::channel(PERIOD_MESSAGES_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMANDS_CAPACITY);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let (version_tx, manifest_version) = watch::channel(0u64);
        let metrics = Arc::new(EngineMetrics::new());

        let sinks = Arc::new(SinkStore::new(
            deps.sink_factory,
            deps.clock.clone(),
            deps.config.clone(),
            Arc::clone(&metrics),
            token.child_token(),
        ));
        let buffer_deps = BufferDeps {
            fetcher: SegmentFetcher::new(deps.transport, Arc::clone(&metrics)),
            clock: deps.clock.clone(),
            config: deps.config,
            manifest_version,
            metrics: Arc::clone(&metrics),
        };
        let handler = Self {
            manifest: deps.manifest,
            sinks,
            deps: buffer_deps,
            clock: deps.clock,
            track_selector: deps.track_selector,
            manifest_refresh: deps.manifest_refresh,
            estimators: HashMap::new(),
            track_types,
            chains: BTreeMap::new(),
            next_generation: 0,
            period_tx,
            events: events_tx,
            version_tx,
            refresh_tx,
            refresh_pending: false,
            last_refresh: None,
            active_period: None,
            end_of_stream: false,
            metrics: Arc::clone(&metrics),
            token: token.clone(),
        };
        let handle = StreamHandle {
            commands: commands_tx,
            metrics,
            token,
        };

        let span = tracing::info_span!("buffers_handler");
        let task = tokio::spawn(handler.run(period_rx, commands_rx, refresh_rx).instrument(span));
        Ok((events_rx, handle, task))
    }

    async fn run(
        mut self,
        mut period_rx: mpsc::Receiver<PeriodMessage>,
        mut commands: mpsc::Receiver<Command>,
        mut refresh_rx: mpsc::Receiver<Result<Manifest, TransportError>>,
    ) {
        info!(tracks = ?self.track_types, "Buffers handler started");
        let result = self
            .event_loop(&mut period_rx, &mut commands, &mut refresh_rx)
            .await;
        match result {
            Ok(()) | Err(BufferError::Cancelled) => {}
            Err(e) => {
                error!(error = %e, "Fatal buffering error, stopping");
                let _ = self.events.send(Err(e)).await;
            }
        }
        drop(period_rx);
        self.shutdown().await;
    }

    async fn event_loop(
        &mut self,
        period_rx: &mut mpsc::Receiver<PeriodMessage>,
        commands: &mut mpsc::Receiver<Command>,
        refresh_rx: &mut mpsc::Receiver<Result<Manifest, TransportError>>,
    ) -> Result<(), BufferError> {
        let time = self.clock.borrow_and_update().current_time;
        for track_type in self.track_types.clone() {
            self.start_chain(track_type, time).await?;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                Some(message) = period_rx.recv() => self.on_period_message(message).await?,
                changed = self.clock.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let time = self.clock.borrow_and_update().current_time;
                    self.on_clock_tick(time).await?;
                }
                Some(command) = commands.recv() => match command {
                    Command::UpdateManifest(manifest) => self.apply_manifest(manifest).await?,
                },
                Some(result) = refresh_rx.recv() => self.on_refresh_result(result).await?,
            }
        }
    }

    async fn shutdown(&mut self) {
        self.token.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .chains
            .values_mut()
            .flat_map(|chain| chain.drain(..).rev())
            .map(|entry| entry.task)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Period buffer task did not stop cleanly");
            }
        }
        self.sinks.dispose_all();
        self.metrics.log_summary();
        info!("Buffers handler stopped");
    }

    async fn emit(&self, event: StreamEvent) -> Result<(), BufferError> {
        trace!(kind = event.kind(), track = ?event.track_type(), "Stream event");
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(BufferError::Cancelled),
            sent = self.events.send(Ok(event)) => sent.map_err(|_| BufferError::Cancelled),
        }
    }

    async fn on_period_message(&mut self, message: PeriodMessage) -> Result<(), BufferError> {
        let PeriodMessage {
            generation,
            track_type,
            kind,
        } = message;
        let Some(position) = self
            .chains
            .get(&track_type)
            .and_then(|chain| chain.iter().position(|e| e.generation == generation))
        else {
            trace!(track = %track_type, generation, "Ignoring message of a stopped period buffer");
            return Ok(());
        };
        let event = match kind {
            PeriodMessageKind::Failed(e) => return Err(e),
            PeriodMessageKind::Event(event) => event,
        };

        match event {
            StreamEvent::Full { .. } => {
                self.set_full(track_type, position, true);
                self.emit(event).await?;
                self.extend_chain(track_type).await?;
                self.update_end_of_stream().await
            }
            StreamEvent::AddedSegment { .. } => {
                self.set_full(track_type, position, false);
                self.emit(event).await?;
                self.truncate_chain(track_type, position + 1).await?;
                self.update_end_of_stream().await
            }
            StreamEvent::NeedsManifestRefresh { .. } => {
                self.emit(event).await?;
                self.schedule_refresh();
                Ok(())
            }
            other => self.emit(other).await,
        }
    }

    async fn on_clock_tick(&mut self, time: f64) -> Result<(), BufferError> {
        for track_type in self.track_types.clone() {
            let (outside, consumed) = {
                let Some(chain) = self.chains.get(&track_type).filter(|c| !c.is_empty()) else {
                    self.start_chain(track_type, time).await?;
                    continue;
                };
                let first = &chain[0];
                let last = &chain[chain.len() - 1];
                let manifest = self.manifest.read();
                let past_content_end = time > last.period.end_or_infinity() && manifest.is_last_period(&last.period);
                // In a gap before the first Period, the chain already starts where it should.
                let before_first = time < first.period.start
                    && manifest
                        .period_at_or_after(time)
                        .is_none_or(|next| next.id != first.period.id);
                let outside = !past_content_end && (before_first || time > last.period.end_or_infinity());
                let consumed = chain[..chain.len() - 1]
                    .iter()
                    .take_while(|e| time >= e.period.end_or_infinity())
                    .count();
                (outside, consumed)
            };

            if outside {
                self.restart_chain(track_type, time).await?;
            } else if consumed > 0 {
                let removed: Vec<ChainEntry> = self
                    .chains
                    .get_mut(&track_type)
                    .map(|chain| chain.drain(..consumed).collect())
                    .unwrap_or_default();
                for entry in removed {
                    self.destroy(track_type, entry).await?;
                }
                self.update_active_period().await?;
            }
        }
        Ok(())
    }

    fn set_full(&mut self, track_type: TrackType, position: usize, full: bool) {
        if let Some(entry) = self
            .chains
            .get_mut(&track_type)
            .and_then(|chain| chain.get_mut(position))
        {
            entry.full = full;
        }
    }

    fn estimator(&mut self, track_type: TrackType) -> SharedEstimator {
        let config = &self.deps.config;
        let estimator = self.estimators.entry(track_type).or_insert_with(|| {
            let estimator = EwmaEstimator::new(&config.borrow().abr);
            Arc::new(Mutex::new(Box::new(estimator) as Box<dyn Estimator>))
        });
        Arc::clone(estimator)
    }

    async fn start_chain(&mut self, track_type: TrackType, time: f64) -> Result<(), BufferError> {
        let period = self
            .manifest
            .read()
            .period_at_or_after(time)
            .cloned()
            .ok_or(BufferError::MissingPeriod { time })?;
        self.push_entry(track_type, period).await?;
        self.update_end_of_stream().await
    }

    /// Destroys the whole chain, newest first, and starts a new one at `time`.
    async fn restart_chain(&mut self, track_type: TrackType, time: f64) -> Result<(), BufferError> {
        info!(track = %track_type, time, "Playback left the buffered periods, restarting");
        self.truncate_chain(track_type, 0).await?;
        if !track_type.is_native() {
            self.sinks.dispose(track_type);
        }
        self.start_chain(track_type, time).await
    }

    async fn push_entry(&mut self, track_type: TrackType, period: Arc<Period>) -> Result<(), BufferError> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let (selector, adaptation_rx) = AdaptationSelector::new(self.track_selector.select(&period, track_type));
        let token = self.token.child_token();
        let task = PeriodBuffer::spawn(PeriodBufferParams {
            track_type,
            period: Arc::clone(&period),
            adaptation_rx,
            sinks: Arc::clone(&self.sinks),
            deps: self.deps.clone(),
            estimator: self.estimator(track_type),
            emitter: PeriodEmitter::new(generation, track_type, self.period_tx.clone()),
            token: token.clone(),
        });
        info!(track = %track_type, period = %period.id, generation, "Period buffer created");
        self.chains
            .entry(track_type)
            .or_default()
            .push(ChainEntry {
                generation,
                period: Arc::clone(&period),
                token,
                selector: selector.clone(),
                full: false,
                task,
            });

        self.emit(StreamEvent::PeriodBufferReady {
            track_type,
            period,
            selector,
        })
        .await?;
        self.update_active_period().await
    }

    /// Creates the buffer of the next Period when the last one is full.
    async fn extend_chain(&mut self, track_type: TrackType) -> Result<(), BufferError> {
        let next = {
            let Some(last) = self.chains.get(&track_type).and_then(|chain| chain.last()) else {
                return Ok(());
            };
            if !last.full {
                return Ok(());
            }
            self.manifest.read().next_period(&last.period).cloned()
        };
        match next {
            Some(next) => {
                debug!(track = %track_type, period = %next.id, "Pre-buffering next period");
                self.push_entry(track_type, next).await
            }
            None => Ok(()),
        }
    }

    /// Destroys the entries from `from` onwards, newest first.
    async fn truncate_chain(&mut self, track_type: TrackType, from: usize) -> Result<(), BufferError> {
        let removed = match self.chains.get_mut(&track_type) {
            Some(chain) if chain.len() > from => chain.split_off(from),
            _ => return Ok(()),
        };
        for entry in removed.into_iter().rev() {
            self.destroy(track_type, entry).await?;
        }
        self.update_active_period().await
    }

    async fn destroy(&self, track_type: TrackType, entry: ChainEntry) -> Result<(), BufferError> {
        entry.token.cancel();
        debug!(
            track = %track_type,
            period = %entry.period.id,
            generation = entry.generation,
            adaptation = ?entry.selector.current().map(|a| a.id.clone()),
            "Period buffer destroyed"
        );
        self.emit(StreamEvent::PeriodBufferCleared {
            track_type,
            period: entry.period,
        })
        .await
    }

    async fn update_active_period(&mut self) -> Result<(), BufferError> {
        let chains: Vec<Vec<Arc<Period>>> = self
            .track_types
            .iter()
            .map(|track_type| {
                self.chains
                    .get(track_type)
                    .map(|chain| chain.iter().map(|e| Arc::clone(&e.period)).collect())
                    .unwrap_or_default()
            })
            .collect();
        let Some(active) = earliest_common_period(&chains) else {
            return Ok(());
        };
        if self.active_period.as_deref() == Some(active.id.as_str()) {
            return Ok(());
        }
        info!(period = %active.id, "Active period changed");
        self.active_period = Some(active.id.clone());
        self.emit(StreamEvent::ActivePeriodChanged { period: active }).await
    }

    async fn update_end_of_stream(&mut self) -> Result<(), BufferError> {
        let ended = {
            let manifest = self.manifest.read();
            !manifest.is_live
                && !self.track_types.is_empty()
                && self.track_types.iter().all(|track_type| {
                    self.chains
                        .get(track_type)
                        .and_then(|chain| chain.last())
                        .is_some_and(|last| last.full && manifest.is_last_period(&last.period))
                })
        };
        if ended == self.end_of_stream {
            return Ok(());
        }
        self.end_of_stream = ended;
        if ended {
            info!("Every track is buffered until the end of the content");
            self.emit(StreamEvent::EndOfStream).await
        } else {
            self.emit(StreamEvent::ResumeStream).await
        }
    }

    async fn apply_manifest(&mut self, newer: Manifest) -> Result<(), BufferError> {
        self.manifest.write().update(&newer);
        self.metrics.record_manifest_update();
        self.version_tx.send_modify(|version| *version += 1);
        info!(
            manifest = %newer.id,
            periods = newer.periods.len(),
            version = *self.version_tx.borrow(),
            "Manifest updated"
        );

        let time = self.clock.borrow().current_time;
        for track_type in self.track_types.clone() {
            let stale = {
                let manifest = self.manifest.read();
                self.chains.get(&track_type).is_some_and(|chain| {
                    chain.iter().any(|entry| {
                        manifest
                            .period(&entry.period.id)
                            .is_none_or(|current| !Arc::ptr_eq(current, &entry.period))
                    })
                })
            };
            if stale {
                self.restart_chain(track_type, time).await?;
            } else {
                self.extend_chain(track_type).await?;
            }
        }

        let all_types = manifest_track_types(&self.manifest.read());
        for track_type in all_types {
            if !self.track_types.contains(&track_type) {
                info!(track = %track_type, "New track type in manifest");
                self.track_types.push(track_type);
                self.start_chain(track_type, time).await?;
            }
        }
        self.update_end_of_stream().await
    }

    fn schedule_refresh(&mut self) {
        let Some(refresh) = &self.manifest_refresh else {
            return;
        };
        let (enabled, interval) = {
            let config = self.deps.config.borrow();
            (config.auto_manifest_refresh, config.manifest_refresh_min_interval())
        };
        if !enabled || self.refresh_pending {
            return;
        }
        self.refresh_pending = true;

        let not_before = self.last_refresh.map(|last| last + interval);
        let loader = Arc::clone(&refresh.loader);
        let url = refresh.url.clone();
        let manifest = Arc::clone(&self.manifest);
        let tx = self.refresh_tx.clone();
        let token = self.token.clone();
        let task = async move {
            if let Some(at) = not_before {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            debug!(url = %url, "Refreshing manifest");
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = loader.refresh_manifest(&url, &manifest) => result,
            };
            let _ = tx.send(result).await;
        };
        tokio::spawn(task.instrument(tracing::debug_span!("manifest_refresh")));
    }

    async fn on_refresh_result(&mut self, result: Result<Manifest, TransportError>) -> Result<(), BufferError> {
        self.refresh_pending = false;
        self.last_refresh = Some(Instant::now());
        match result {
            Ok(manifest) => self.apply_manifest(manifest).await,
            Err(source) => {
                warn!(error = %source, "Manifest refresh failed");
                self.emit(StreamEvent::Warning {
                    track_type: None,
                    error: BufferError::ManifestRefresh { source },
                })
                .await?;
                self.schedule_refresh();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySinkFactory;
    use crate::transport::SimulatedTransport;
    use media_types::{Representation, SegmentIndex};

    fn period(id: &str, start: f64, end: f64) -> Arc<Period> {
        Arc::new(Period::new(id, start, Some(end)))
    }

    #[test]
    fn test_earliest_common_period() {
        let (a, b, c) = (period("a", 0.0, 10.0), period("b", 10.0, 20.0), period("c", 20.0, 30.0));
        let chains = vec![
            vec![Arc::clone(&a), Arc::clone(&b)],
            vec![Arc::clone(&b), Arc::clone(&c)],
        ];
        assert_eq!(earliest_common_period(&chains).unwrap().id, "b");

        let chains = vec![vec![Arc::clone(&a)], vec![]];
        assert!(earliest_common_period(&chains).is_none());
        assert!(earliest_common_period(&[]).is_none());
    }

    #[test]
    fn test_first_adaptation_selector() {
        let index = || SegmentIndex::timeline(1, None, vec![], false);
        let period = Period::new("p", 0.0, None)
            .with_adaptation(Adaptation::new("en", TrackType::Audio, vec![Representation::new("a", 1, index())]))
            .with_adaptation(Adaptation::new("fr", TrackType::Audio, vec![Representation::new("b", 1, index())]));
        assert_eq!(FirstAdaptation.select(&period, TrackType::Audio).unwrap().id, "en");
        assert!(FirstAdaptation.select(&period, TrackType::Video).is_none());

        let manifest = Manifest::new("m", false, vec![period]);
        assert_eq!(manifest_track_types(&manifest), vec![TrackType::Audio]);
    }

    #[tokio::test]
    async fn test_spawn_without_period_fails() {
        let manifest = Manifest::new("m", false, vec![Period::new("p", 0.0, Some(10.0))]).into_shared();
        let (_clock_tx, clock) = watch::channel(ClockTick::at(50.0));
        let (_config_tx, config) = watch::channel(BufferConfig::default());
        let deps = EngineDeps::new(
            manifest,
            Arc::new(MemorySinkFactory::new()),
            Arc::new(SimulatedTransport::new(1_000_000.0)),
            clock,
            config,
        );
        let err = BuffersHandler::spawn(deps, CancellationToken::new()).unwrap_err();
        assert!(matches!(err, BufferError::MissingPeriod { time } if time == 50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_event_channel() {
        let manifest = Manifest::new("m", false, vec![Period::new("p", 0.0, Some(10.0))]).into_shared();
        let (_clock_tx, clock) = watch::channel(ClockTick::at(0.0));
        let (_config_tx, config) = watch::channel(BufferConfig::default());
        let deps = EngineDeps::new(
            manifest,
            Arc::new(MemorySinkFactory::new()),
            Arc::new(SimulatedTransport::new(1_000_000.0)),
            clock,
            config,
        );
        let (mut events, handle, task) = BuffersHandler::spawn(deps, CancellationToken::new()).unwrap();
        handle.shutdown();
        task.await.unwrap();
        while let Some(event) = events.recv().await {
            assert!(event.is_ok());
        }
        assert!(handle.is_stopped());
        assert!(handle.update_manifest(Manifest::new("m", false, vec![])).await.is_err());
    }
}
