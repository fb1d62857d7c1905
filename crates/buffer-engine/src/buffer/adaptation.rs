// Adaptation buffer: chooses the Representation to buffer and drives its
// Representation buffer.
//
// ABR is re-evaluated on every clock tick, configuration change and request sample.
// A new choice drops the running Representation buffer, which cancels its pending
// request, before the next one starts.

use std::sync::Arc;

use futures::future::BoxFuture;
use media_types::{Adaptation, Period, Representation, TrackType};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::representation::{RepresentationBuffer, RepresentationEvent};
use super::switch_strategy::{SwitchStrategy, apply_switch_strategy};
use super::{BufferDeps, PeriodEmitter};
use crate::abr::{AbrDecision, AbrManager, AbrReason};
use crate::config::ManualSwitchingMode;
use crate::error::BufferError;
use crate::events::StreamEvent;
use crate::retry::{RetryPolicy, RetryState};
use crate::sink_store::SinkContext;

const REPRESENTATION_EVENTS_CAPACITY: usize = 32;

type RunningFuture = BoxFuture<'static, Result<(), BufferError>>;

/// Completes with the future output, or never when there is no future.
async fn poll_optional<T>(future: &mut Option<BoxFuture<'static, T>>) -> T {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn recv_optional<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Outcome of applying a Representation switch.
enum Switch {
    Started,
    /// The media pipeline must be rebuilt, nothing else will be buffered.
    Reload,
}

pub(crate) struct AdaptationBuffer {
    track_type: TrackType,
    period: Arc<Period>,
    adaptation: Arc<Adaptation>,
    sink: SinkContext,
    deps: BufferDeps,
    abr: AbrManager,
    emitter: PeriodEmitter,
    token: CancellationToken,
    current: Option<Arc<Representation>>,
    running: Option<RunningFuture>,
    running_events: Option<mpsc::Receiver<RepresentationEvent>>,
    running_token: Option<CancellationToken>,
    /// Restarts after "precondition failed" responses.
    precondition_retries: RetryState,
}

impl AdaptationBuffer {
    pub fn new(
        period: Arc<Period>,
        adaptation: Arc<Adaptation>,
        sink: SinkContext,
        deps: BufferDeps,
        abr: AbrManager,
        emitter: PeriodEmitter,
        token: CancellationToken,
    ) -> Self {
        Self {
            track_type: sink.track_type,
            period,
            adaptation,
            sink,
            deps,
            abr,
            emitter,
            token,
            current: None,
            running: None,
            running_events: None,
            running_token: None,
            precondition_retries: RetryState::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), BufferError> {
        debug!(track = %self.track_type, adaptation = %self.adaptation.id, "Adaptation buffer started");
        let result = self.drive().await;
        self.stop_representation();
        result
    }

    async fn drive(&mut self) -> Result<(), BufferError> {
        let mut warned_no_representation = false;
        loop {
            match self.choose() {
                AbrDecision::Selected { representation, reason } => {
                    warned_no_representation = false;
                    let changed = self
                        .current
                        .as_ref()
                        .is_none_or(|current| !Arc::ptr_eq(current, &representation));
                    if changed {
                        match self.switch_to(representation, reason).await? {
                            Switch::Started => {}
                            Switch::Reload => {
                                self.token.cancelled().await;
                                return Ok(());
                            }
                        }
                    }
                }
                AbrDecision::NoValidRepresentation => {
                    self.stop_representation();
                    self.current = None;
                    if !warned_no_representation {
                        warned_no_representation = true;
                        let error = BufferError::NoValidRepresentation {
                            track_type: self.track_type,
                            adaptation: self.adaptation.id.clone(),
                        };
                        warn!(track = %self.track_type, error = %error, "Nothing to buffer");
                        if !self.emit_warning(error).await {
                            return Ok(());
                        }
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                Some(event) = recv_optional(&mut self.running_events) => {
                    if !self.forward(event).await {
                        return Ok(());
                    }
                }
                result = poll_optional(&mut self.running) => {
                    self.running = None;
                    self.running_events = None;
                    self.running_token = None;
                    match result {
                        Ok(()) => return Ok(()),
                        Err(e) if e.is_precondition_failed() => {
                            if !self.recover_precondition_failed(e).await? {
                                return Ok(());
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                changed = self.deps.clock.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                changed = self.deps.config.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn choose(&mut self) -> AbrDecision {
        let buffer_gap = self.deps.clock.borrow_and_update().buffer_gap;
        let config = self.deps.config.borrow_and_update();
        self.abr.select(
            &self.adaptation.representations,
            buffer_gap,
            &config.abr,
            config.constraints.get(self.track_type),
        )
    }

    async fn switch_to(&mut self, representation: Arc<Representation>, reason: AbrReason) -> Result<Switch, BufferError> {
        self.stop_representation();
        let previous = self.current.take();

        let direct = self.deps.config.borrow().manual_bitrate_switching_mode == ManualSwitchingMode::Direct;
        if previous.is_some() && reason == AbrReason::Manual && direct {
            let tick = *self.deps.clock.borrow();
            let padding = *self.deps.config.borrow().switch_padding.get(self.track_type);
            match apply_switch_strategy(&self.sink, &self.period, &tick, padding).await? {
                SwitchStrategy::NeedsReload => {
                    let time = self.deps.clock.borrow().current_time;
                    info!(track = %self.track_type, time, "Manual switch needs a media source reload");
                    self.emitter
                        .emit(StreamEvent::NeedsMediaSourceReload {
                            track_type: self.track_type,
                            time,
                        })
                        .await;
                    return Ok(Switch::Reload);
                }
                SwitchStrategy::Continue | SwitchStrategy::CleanBuffer(_) => {}
            }
        }

        info!(
            track = %self.track_type,
            period = %self.period.id,
            from = ?previous.as_ref().map(|r| r.id.as_str()),
            to = %representation.id,
            bitrate = representation.bitrate,
            reason = ?reason,
            "Switching representation"
        );
        self.deps.metrics.record_representation_switch();
        self.emitter
            .emit(StreamEvent::RepresentationChange {
                track_type: self.track_type,
                period: Arc::clone(&self.period),
                representation: Arc::clone(&representation),
            })
            .await;
        self.start_representation(representation);
        Ok(Switch::Started)
    }

    fn start_representation(&mut self, representation: Arc<Representation>) {
        let token = self.token.child_token();
        let buffer = RepresentationBuffer::new(
            Arc::clone(&self.period),
            Arc::clone(&self.adaptation),
            Arc::clone(&representation),
            self.sink.clone(),
            self.deps.clone(),
            token.clone(),
        );
        let (tx, rx) = mpsc::channel(REPRESENTATION_EVENTS_CAPACITY);
        self.running = Some(Box::pin(buffer.run(tx)));
        self.running_events = Some(rx);
        self.running_token = Some(token);
        self.current = Some(representation);
    }

    fn stop_representation(&mut self) {
        if let Some(token) = self.running_token.take() {
            token.cancel();
        }
        self.running = None;
        self.running_events = None;
    }

    /// Waits the configured backoff then restarts the same Representation. Fails
    /// with `error` once the track's retry budget is spent.
    async fn recover_precondition_failed(&mut self, error: BufferError) -> Result<bool, BufferError> {
        let (policy, backoff) = {
            let config = self.deps.config.borrow();
            (RetryPolicy::for_track(&config, self.track_type), config.precondition_backoff())
        };
        let BufferError::Transport { source, .. } = &error else {
            return Err(error);
        };
        let Some(attempt) = self.precondition_retries.on_failure(&policy, source) else {
            warn!(track = %self.track_type, error = %error, "Precondition failures exhausted the retry budget");
            return Err(error);
        };
        warn!(
            track = %self.track_type,
            backoff_ms = backoff.as_millis() as u64,
            attempt,
            error = %error,
            "Precondition failed, restarting representation buffer"
        );
        if !self.emit_warning(error).await {
            return Ok(false);
        }
        tokio::select! {
            _ = self.token.cancelled() => return Ok(false),
            _ = tokio::time::sleep(backoff) => {}
        }
        match self.current.take() {
            Some(representation) => self.start_representation(representation),
            None => return Err(BufferError::internal("precondition failure without a representation")),
        }
        Ok(true)
    }

    /// Handles an event of the running Representation buffer. Returns `false` once
    /// the handler stopped listening.
    async fn forward(&mut self, event: RepresentationEvent) -> bool {
        let track_type = self.track_type;
        let period = Arc::clone(&self.period);
        let stream_event = match event {
            RepresentationEvent::RequestSample(sample) => {
                self.abr.add_sample(sample);
                return true;
            }
            RepresentationEvent::AddedSegment {
                segment,
                new_index_entries,
                buffered,
            } => {
                let Some(representation) = self.current.clone() else {
                    return true;
                };
                StreamEvent::AddedSegment {
                    track_type,
                    period,
                    representation,
                    segment,
                    new_index_entries,
                    buffered,
                }
            }
            RepresentationEvent::Full => StreamEvent::Full { track_type, period },
            RepresentationEvent::NeedsManifestRefresh => StreamEvent::NeedsManifestRefresh { track_type, period },
            RepresentationEvent::Warning(error) => StreamEvent::Warning {
                track_type: Some(track_type),
                error,
            },
        };
        self.emitter.emit(stream_event).await
    }

    async fn emit_warning(&mut self, error: BufferError) -> bool {
        self.emitter
            .emit(StreamEvent::Warning {
                track_type: Some(self.track_type),
                error,
            })
            .await
    }
}
