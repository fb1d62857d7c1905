use media_types::TrackType;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace, warn};

use super::{MediaSink, SinkChunk};
use crate::error::SinkError;
use crate::ranges::TimeRange;

const QUEUE_CAPACITY: usize = 16;

enum SinkOperation {
    Append {
        chunk: SinkChunk,
        reply: oneshot::Sender<Result<(), SinkError>>,
    },
    Remove {
        start: f64,
        end: f64,
        reply: oneshot::Sender<Result<(), SinkError>>,
    },
    Buffered {
        reply: oneshot::Sender<Vec<TimeRange>>,
    },
}

/// Cloneable access to a sink owned by a worker task.
///
/// Operations are processed one at a time in submission order. Awaiting an
/// operation returns once the sink completed it.
#[derive(Clone)]
pub struct SinkHandle {
    track_type: TrackType,
    tx: mpsc::Sender<SinkOperation>,
    idle: watch::Receiver<u64>,
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("track_type", &self.track_type)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SinkHandle {
    /// Moves `sink` into a dedicated worker task.
    pub fn spawn(
        track_type: TrackType,
        sink: Box<dyn MediaSink>,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (idle_tx, idle_rx) = watch::channel(0u64);
        let span = tracing::debug_span!("sink", track = %track_type);
        let handle = tokio::spawn(run_worker(sink, rx, idle_tx, token).instrument(span));
        (
            Self {
                track_type,
                tx,
                idle: idle_rx,
            },
            handle,
        )
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    pub async fn append(&self, chunk: SinkChunk) -> Result<(), SinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SinkOperation::Append { chunk, reply })
            .await
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)?
    }

    pub async fn remove(&self, start: f64, end: f64) -> Result<(), SinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SinkOperation::Remove { start, end, reply })
            .await
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)?
    }

    pub async fn buffered(&self) -> Result<Vec<TimeRange>, SinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SinkOperation::Buffered { reply })
            .await
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)
    }

    /// Counter bumped every time the queue drains after a mutation.
    pub fn subscribe_idle(&self) -> watch::Receiver<u64> {
        self.idle.clone()
    }
}

async fn run_worker(
    mut sink: Box<dyn MediaSink>,
    mut rx: mpsc::Receiver<SinkOperation>,
    idle_tx: watch::Sender<u64>,
    token: CancellationToken,
) {
    debug!("Sink worker started");
    loop {
        let op = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let mutated = match op {
            SinkOperation::Append { chunk, reply } => {
                trace!(segment = %chunk.segment_id, bytes = chunk.data.len(), "Appending to sink");
                let result = sink.append(chunk).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Sink append failed");
                }
                let _ = reply.send(result);
                true
            }
            SinkOperation::Remove { start, end, reply } => {
                trace!(start, end, "Removing from sink");
                let _ = reply.send(sink.remove(start, end).await);
                true
            }
            SinkOperation::Buffered { reply } => {
                let _ = reply.send(sink.buffered_ranges());
                false
            }
        };

        if mutated && rx.is_empty() {
            idle_tx.send_modify(|n| *n = n.wrapping_add(1));
        }
    }
    sink.dispose();
    debug!("Sink worker stopped");
}
