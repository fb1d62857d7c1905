// Period buffer: buffers one track type of one Period.
//
// Waits for the Adaptation choice, creates or reuses the sink, then runs an
// Adaptation buffer until the choice changes. A disabled track, or a pipeline
// stopped by a recoverable error, leaves an empty buffer that still reports `Full`
// so the handler can move on to the next Period.

use std::sync::Arc;

use media_types::{Adaptation, Period, TrackType};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::adaptation::AdaptationBuffer;
use super::switch_strategy::{SwitchStrategy, apply_switch_strategy};
use super::{BufferDeps, PeriodEmitter};
use crate::abr::{AbrManager, SharedEstimator};
use crate::error::BufferError;
use crate::events::StreamEvent;
use crate::sink_store::SinkStore;

pub(crate) struct PeriodBufferParams {
    pub track_type: TrackType,
    pub period: Arc<Period>,
    pub adaptation_rx: watch::Receiver<Option<Arc<Adaptation>>>,
    pub sinks: Arc<SinkStore>,
    pub deps: BufferDeps,
    pub estimator: SharedEstimator,
    pub emitter: PeriodEmitter,
    pub token: CancellationToken,
}

/// How a buffering step ended.
enum Step {
    /// A new Adaptation was selected.
    AdaptationChanged,
    /// Nothing more to do until the Adaptation changes.
    Idle,
    Stop,
}

pub(crate) struct PeriodBuffer {
    track_type: TrackType,
    period: Arc<Period>,
    adaptation_rx: watch::Receiver<Option<Arc<Adaptation>>>,
    sinks: Arc<SinkStore>,
    deps: BufferDeps,
    estimator: SharedEstimator,
    emitter: PeriodEmitter,
    token: CancellationToken,
}

impl PeriodBuffer {
    pub fn spawn(params: PeriodBufferParams) -> JoinHandle<()> {
        let span = tracing::info_span!("period_buffer", track = %params.track_type, period = %params.period.id);
        let buffer = Self {
            track_type: params.track_type,
            period: params.period,
            adaptation_rx: params.adaptation_rx,
            sinks: params.sinks,
            deps: params.deps,
            estimator: params.estimator,
            emitter: params.emitter,
            token: params.token,
        };
        tokio::spawn(buffer.run().instrument(span))
    }

    async fn run(mut self) {
        debug!("Period buffer started");
        if let Err(e) = self.drive().await {
            error!(error = %e, "Period buffer failed");
            self.emitter.fail(e).await;
        }
        debug!("Period buffer stopped");
    }

    async fn drive(&mut self) -> Result<(), BufferError> {
        let mut previous: Option<Arc<Adaptation>> = None;
        loop {
            let adaptation = self.adaptation_rx.borrow_and_update().clone();
            info!(adaptation = ?adaptation.as_ref().map(|a| a.id.as_str()), "Adaptation selected");
            let event = StreamEvent::AdaptationChange {
                track_type: self.track_type,
                period: Arc::clone(&self.period),
                adaptation: adaptation.clone(),
            };
            if !self.emitter.emit(event).await {
                return Ok(());
            }

            let step = match &adaptation {
                None => {
                    self.disable().await?;
                    self.emit_full().await
                }
                Some(adaptation) => self.buffer(adaptation, previous.as_ref()).await?,
            };
            let step = match step {
                Step::Idle => self.wait_for_adaptation().await,
                other => other,
            };
            match step {
                Step::AdaptationChanged => previous = adaptation,
                Step::Idle | Step::Stop => return Ok(()),
            }
        }
    }

    async fn buffer(&mut self, adaptation: &Arc<Adaptation>, previous: Option<&Arc<Adaptation>>) -> Result<Step, BufferError> {
        let codec = adaptation
            .representations
            .first()
            .and_then(|r| r.codec.as_deref());
        let sink = match self.sinks.get_or_create(self.track_type, codec).await {
            Ok(sink) => sink,
            Err(e) => return self.recover(e).await,
        };

        let switched = previous.is_some_and(|previous| !Arc::ptr_eq(previous, adaptation));
        if switched {
            let tick = *self.deps.clock.borrow();
            let padding = *self.deps.config.borrow().switch_padding.get(self.track_type);
            match apply_switch_strategy(&sink, &self.period, &tick, padding).await {
                Ok(SwitchStrategy::NeedsReload) => return Ok(self.request_reload().await),
                Ok(_) => {}
                Err(e) => return self.recover(e).await,
            }
        }

        let ab_token = self.token.child_token();
        let buffer = AdaptationBuffer::new(
            Arc::clone(&self.period),
            Arc::clone(adaptation),
            sink,
            self.deps.clone(),
            AbrManager::new(self.track_type, Arc::clone(&self.estimator)),
            self.emitter.clone(),
            ab_token.clone(),
        );
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Ok(Step::Stop),
            changed = self.adaptation_rx.changed() => {
                ab_token.cancel();
                return Ok(if changed.is_ok() { Step::AdaptationChanged } else { Step::Stop });
            }
            result = buffer.run() => result,
        };
        match result {
            Ok(()) => Ok(Step::Idle),
            Err(e) => self.recover(e).await,
        }
    }

    /// Stops the pipeline after `error`. Only errors fatal for this track type are
    /// returned, others leave an empty buffer.
    async fn recover(&self, error: BufferError) -> Result<Step, BufferError> {
        if error.is_fatal_for(self.track_type) {
            return Err(error);
        }
        warn!(error = %error, "Buffer stopped, continuing without this track");
        let event = StreamEvent::Warning {
            track_type: Some(self.track_type),
            error,
        };
        if !self.emitter.emit(event).await {
            return Ok(Step::Stop);
        }
        Ok(self.emit_full().await)
    }

    /// Removes what was buffered for this Period of a disabled track.
    async fn disable(&self) -> Result<(), BufferError> {
        let Some(sink) = self.sinks.get(self.track_type) else {
            return Ok(());
        };
        let (start, end) = (self.period.start, self.period.end_or_infinity());
        debug!(start, end, "Track disabled, removing period data");
        sink.handle
            .remove(start, end)
            .await
            .map_err(|e| BufferError::sink(self.track_type, e))?;
        sink.bookkeeper.lock().remove(start, end);
        Ok(())
    }

    async fn request_reload(&self) -> Step {
        let time = self.deps.clock.borrow().current_time;
        info!(time, "Adaptation switch needs a media source reload");
        let event = StreamEvent::NeedsMediaSourceReload {
            track_type: self.track_type,
            time,
        };
        if !self.emitter.emit(event).await {
            return Step::Stop;
        }
        self.token.cancelled().await;
        Step::Stop
    }

    async fn emit_full(&self) -> Step {
        let event = StreamEvent::Full {
            track_type: self.track_type,
            period: Arc::clone(&self.period),
        };
        if self.emitter.emit(event).await {
            Step::Idle
        } else {
            Step::Stop
        }
    }

    async fn wait_for_adaptation(&mut self) -> Step {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Step::Stop,
            changed = self.adaptation_rx.changed() => {
                if changed.is_ok() { Step::AdaptationChanged } else { Step::Stop }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abr::{Estimator, EwmaEstimator};
    use crate::buffer::test_support::{TestEnv, adaptation};
    use crate::buffer::{PeriodMessage, PeriodMessageKind};
    use crate::clock::ClockTick;
    use crate::config::AbrConfig;
    use crate::error::TransportError;
    use crate::events::AdaptationSelector;
    use crate::ranges::TimeRange;
    use crate::sink::{MemorySinkFactory, SinkChunk};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct Running {
        rx: mpsc::Receiver<PeriodMessage>,
        selector: AdaptationSelector,
        token: CancellationToken,
        task: JoinHandle<()>,
    }

    fn start(env: &TestEnv, track_type: TrackType, initial: Option<Arc<Adaptation>>) -> Running {
        let (selector, adaptation_rx) = AdaptationSelector::new(initial);
        let (emitter, rx) = env.emitter(track_type);
        let token = CancellationToken::new();
        let estimator: SharedEstimator = Arc::new(Mutex::new(
            Box::new(EwmaEstimator::new(&AbrConfig::default())) as Box<dyn Estimator>
        ));
        let task = PeriodBuffer::spawn(PeriodBufferParams {
            track_type,
            period: Arc::new(Period::new("p", 0.0, Some(20.0))),
            adaptation_rx,
            sinks: Arc::clone(&env.sinks),
            deps: env.deps.clone(),
            estimator,
            emitter,
            token: token.clone(),
        });
        Running {
            rx,
            selector,
            token,
            task,
        }
    }

    async fn next_message(rx: &mut mpsc::Receiver<PeriodMessage>) -> PeriodMessageKind {
        rx.recv().await.expect("period buffer stopped").kind
    }

    async fn wait_for<F>(rx: &mut mpsc::Receiver<PeriodMessage>, mut predicate: F) -> StreamEvent
    where
        F: FnMut(&StreamEvent) -> bool,
    {
        loop {
            match next_message(rx).await {
                PeriodMessageKind::Event(event) if predicate(&event) => return event,
                PeriodMessageKind::Event(_) => continue,
                PeriodMessageKind::Failed(e) => panic!("unexpected failure {e:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_track_removes_period_data_and_reports_full() {
        let env = TestEnv::new(MemorySinkFactory::new(), ClockTick::at(0.0));
        let sink = env.sinks.get_or_create(TrackType::Text, None).await.unwrap();
        sink.handle
            .append(SinkChunk {
                data: Bytes::from_static(b"webvtt"),
                codec: None,
                timestamp_offset: 0.0,
                append_window: TimeRange::new(0.0, f64::INFINITY),
                time_range: Some(TimeRange::new(2.0, 30.0)),
                segment_id: "1".into(),
            })
            .await
            .unwrap();

        let mut running = start(&env, TrackType::Text, None);
        match next_message(&mut running.rx).await {
            PeriodMessageKind::Event(StreamEvent::AdaptationChange { adaptation, .. }) => assert!(adaptation.is_none()),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(matches!(
            next_message(&mut running.rx).await,
            PeriodMessageKind::Event(StreamEvent::Full { .. })
        ));
        let inspector = env.factory.inspector(TrackType::Text).unwrap();
        assert_eq!(inspector.buffered(), vec![TimeRange::new(20.0, 30.0)]);

        running.token.cancel();
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptation_switch_cleans_previous_data() {
        let env = TestEnv::new(MemorySinkFactory::new(), ClockTick::at(6.0));
        let english = adaptation("en", TrackType::Text, &[2_000], 10);
        let french = adaptation("fr", TrackType::Text, &[2_000], 10);
        let mut running = start(&env, TrackType::Text, Some(english));

        wait_for(&mut running.rx, |e| matches!(e, StreamEvent::Full { .. })).await;
        let inspector = env.factory.inspector(TrackType::Text).unwrap();
        assert!(inspector.removals().is_empty());

        running.selector.select(Some(Arc::clone(&french)));
        match wait_for(&mut running.rx, |e| matches!(e, StreamEvent::AdaptationChange { .. })).await {
            StreamEvent::AdaptationChange { adaptation, .. } => assert_eq!(adaptation.unwrap().id, "fr"),
            _ => unreachable!(),
        }
        wait_for(&mut running.rx, |e| matches!(e, StreamEvent::RepresentationChange { .. })).await;
        assert!(!inspector.removals().is_empty());
        assert_eq!(env.factory.created(TrackType::Text), 1);

        running.token.cancel();
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_errors_are_isolated() {
        let env = TestEnv::new(MemorySinkFactory::new(), ClockTick::at(0.0));
        env.transport.fail_segment("0", TransportError::http(403, "subs-0"));
        let subs = adaptation("subs", TrackType::Text, &[2_000], 10);
        let mut running = start(&env, TrackType::Text, Some(subs));

        match wait_for(&mut running.rx, |e| matches!(e, StreamEvent::Warning { .. })).await {
            StreamEvent::Warning { error, .. } => assert!(!error.is_fatal_for(TrackType::Text)),
            _ => unreachable!(),
        }
        assert!(matches!(
            next_message(&mut running.rx).await,
            PeriodMessageKind::Event(StreamEvent::Full { .. })
        ));
        running.token.cancel();
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_errors_fail_the_period() {
        let env = TestEnv::new(MemorySinkFactory::new(), ClockTick::at(0.0));
        env.transport.fail_segment("0", TransportError::http(403, "video-0"));
        let video = adaptation("video", TrackType::Video, &[300_000], 10);
        let mut running = start(&env, TrackType::Video, Some(video));

        let failure = loop {
            if let PeriodMessageKind::Failed(e) = next_message(&mut running.rx).await {
                break e;
            }
        };
        assert!(matches!(failure, BufferError::Transport { track_type: TrackType::Video, .. }));
        running.task.await.unwrap();
    }
}
