// Retry Utility: exponential backoff with fuzz for segment requests.
//
// Delays grow as `base * 2^(n-1)`, fuzzed by a random factor and capped. Offline errors
// draw from their own budget, and failure counters reset after a quiet period.

use std::future::Future;
use std::time::Duration;

use media_types::TrackType;
use rand::RngExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::BufferConfig;
use crate::error::TransportError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retry budget for retryable non-offline errors.
    pub max_retries: u32,
    /// Retry budget for offline errors.
    pub max_retries_offline: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Relative random variation, `0.3` draws the delay from `[0.7d, 1.3d]`.
    pub fuzz_factor: f64,
    /// Counters reset when no failure happened for this long.
    pub reset_after: Option<Duration>,
}

impl RetryPolicy {
    pub fn for_track(config: &BufferConfig, track_type: TrackType) -> Self {
        Self {
            max_retries: *config.segment_retries.get(track_type),
            max_retries_offline: config.retry.max_retries_offline,
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            fuzz_factor: config.retry.fuzz_factor.clamp(0.0, 1.0),
            reset_after: config.retry.reset_after_ms.map(Duration::from_millis),
        }
    }

    /// Unfuzzed delay before retry number `retry_count` (1-indexed).
    fn base_delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Fuzzed delay before retry number `retry_count` (1-indexed).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = self.base_delay_for(retry_count);
        if self.fuzz_factor <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - self.fuzz_factor)..=(1.0 + self.fuzz_factor));
        delay.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_track(&BufferConfig::default(), TrackType::Video)
    }
}

/// Failure counters of one retried operation.
#[derive(Debug)]
pub(crate) struct RetryState {
    retries: u32,
    offline_retries: u32,
    last_failure: Option<Instant>,
}

impl RetryState {
    pub(crate) fn new() -> Self {
        Self {
            retries: 0,
            offline_retries: 0,
            last_failure: None,
        }
    }

    /// Records a failure and returns the retry number to use, or `None` when the
    /// budget for this kind of error is exhausted.
    pub(crate) fn on_failure(&mut self, policy: &RetryPolicy, err: &TransportError) -> Option<u32> {
        let now = Instant::now();
        if let (Some(window), Some(last)) = (policy.reset_after, self.last_failure)
            && now.duration_since(last) >= window
        {
            self.retries = 0;
            self.offline_retries = 0;
        }
        self.last_failure = Some(now);

        if err.is_offline() {
            if self.offline_retries >= policy.max_retries_offline {
                return None;
            }
            self.offline_retries += 1;
            Some(self.offline_retries)
        } else {
            if self.retries >= policy.max_retries {
                return None;
            }
            self.retries += 1;
            Some(self.retries)
        }
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a retryable error.
    Retry(TransportError),
    /// Operation failed with an error that must not be retried.
    Fail(TransportError),
}

impl<T> RetryAction<T> {
    /// Classifies a result with [`TransportError::is_retryable`].
    pub fn from_result(result: Result<T, TransportError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Execute an async operation with retry-and-backoff.
///
/// `operation` receives the attempt number (0-indexed). `on_retry` is called with the
/// error and the retry number before waiting, so callers can surface warnings.
pub async fn retry_with_backoff<F, Fut, T, R>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut on_retry: R,
    operation: F,
) -> Result<T, TransportError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
    R: FnMut(&TransportError, u32),
{
    let mut state = RetryState::new();
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };
        let Some(retry_count) = state.on_failure(policy, &err) else {
            return Err(err);
        };

        let delay = policy.delay_for(retry_count);
        warn!(
            retry = retry_count,
            offline = err.is_offline(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        on_retry(&err, retry_count);

        tokio::select! {
            _ = token.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
    }
}
