// Segment Fetcher: loads and parses one segment through the transport, with retries.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{ParsedSegment, SegmentContext, SegmentTransport};
use crate::abr::RequestSample;
use crate::error::TransportError;
use crate::metrics::EngineMetrics;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// A parsed segment and the measurement of the request that loaded it.
#[derive(Debug, Clone)]
pub struct FetchedSegment {
    pub parsed: ParsedSegment,
    pub sample: RequestSample,
}

#[derive(Clone)]
pub struct SegmentFetcher {
    transport: Arc<dyn SegmentTransport>,
    metrics: Arc<EngineMetrics>,
}

impl SegmentFetcher {
    pub fn new(transport: Arc<dyn SegmentTransport>, metrics: Arc<EngineMetrics>) -> Self {
        Self { transport, metrics }
    }

    /// Loads the segment described by `context`, retrying transient errors according
    /// to `policy`, then parses it. Parse errors are not retried.
    ///
    /// `on_retry` is called before each retry with the error and the retry number.
    pub async fn fetch<R>(
        &self,
        context: &SegmentContext,
        policy: &RetryPolicy,
        token: &CancellationToken,
        mut on_retry: R,
    ) -> Result<FetchedSegment, TransportError>
    where
        R: FnMut(&TransportError, u32),
    {
        self.metrics.record_request();
        let transport = &self.transport;
        let loaded = retry_with_backoff(
            policy,
            token,
            |err, retry| {
                self.metrics.record_retry();
                on_retry(err, retry);
            },
            |attempt| async move {
                trace!(segment = %context.segment.id, attempt, "Loading segment");
                let started = Instant::now();
                RetryAction::from_result(
                    transport
                        .load_segment(context)
                        .await
                        .map(|data| (data, started.elapsed())),
                )
            },
        )
        .await;

        let (data, elapsed) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                if !matches!(e, TransportError::Cancelled) {
                    self.metrics.record_request_failure();
                }
                return Err(e);
            }
        };

        let bytes = data.len() as u64;
        self.metrics
            .record_download(bytes, elapsed.as_millis() as u64);
        debug!(
            track = %context.track_type,
            representation = %context.representation.id,
            segment = %context.segment.id,
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Segment loaded"
        );

        let parsed = self.transport.parse_segment(data, context).await?;
        Ok(FetchedSegment {
            parsed,
            sample: RequestSample::new(bytes, elapsed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedTransport;
    use media_types::{Adaptation, Period, Representation, Segment, SegmentIndex, TrackType};
    use std::time::Duration;

    fn context() -> SegmentContext {
        let representation = Arc::new(Representation::new(
            "v1",
            800_000,
            SegmentIndex::timeline(1, None, vec![], false),
        ));
        let adaptation = Arc::new(Adaptation::new("video", TrackType::Video, vec![]));
        SegmentContext {
            track_type: TrackType::Video,
            period: Arc::new(Period::new("p", 0.0, Some(10.0))),
            adaptation,
            representation,
            segment: Segment::media("1", 0, 2, 1),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            max_retries_offline: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            fuzz_factor: 0.0,
            reset_after: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_retries_and_records_metrics() {
        let transport = Arc::new(SimulatedTransport::new(8_000_000.0));
        transport.fail_segment("1", TransportError::http(503, "1"));
        let metrics = Arc::new(EngineMetrics::new());
        let fetcher = SegmentFetcher::new(transport.clone(), metrics.clone());

        let mut retries = Vec::new();
        let fetched = fetcher
            .fetch(&context(), &policy(), &CancellationToken::new(), |_, n| retries.push(n))
            .await
            .unwrap();

        // 800 kbps over 2 s
        assert_eq!(fetched.sample.bytes, 200_000);
        assert_eq!(fetched.parsed.timing.unwrap().end, 2.0);
        assert_eq!(retries, vec![1]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.segments_requested, 1);
        assert_eq!(snapshot.request_retries, 1);
        assert_eq!(snapshot.bytes_downloaded, 200_000);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_counts_as_failure() {
        let transport = Arc::new(SimulatedTransport::new(8_000_000.0));
        transport.fail_segment("1", TransportError::http(403, "1"));
        let metrics = Arc::new(EngineMetrics::new());
        let fetcher = SegmentFetcher::new(transport, metrics.clone());

        let err = fetcher
            .fetch(&context(), &policy(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::http(403, "1"));
        assert_eq!(metrics.snapshot().request_failures, 1);
    }
}
