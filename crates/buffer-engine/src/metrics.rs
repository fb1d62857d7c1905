use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

/// Counters describing the activity of a buffering session.
///
/// Shared by every buffer of the engine. All counters use relaxed atomics.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    // Requests
    /// Segment requests issued (retries excluded)
    pub segments_requested: AtomicU64,
    /// Bytes received for segments
    pub bytes_downloaded: AtomicU64,
    /// Sum of request durations in milliseconds
    pub request_time_sum_ms: AtomicU64,
    /// Retries performed after a transient error
    pub request_retries: AtomicU64,
    /// Requests that failed after exhausting their retries
    pub request_failures: AtomicU64,

    // Sinks
    /// Segments appended to a sink
    pub segments_appended: AtomicU64,
    /// Appends rejected with a quota error
    pub quota_errors: AtomicU64,
    /// Forced garbage collections
    pub forced_gcs: AtomicU64,
    /// Ranges removed by garbage collection
    pub gc_evictions: AtomicU64,

    // Orchestration
    /// Representation changes
    pub representation_switches: AtomicU64,
    /// Manifest updates applied
    pub manifest_updates: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub segments_requested: u64,
    pub bytes_downloaded: u64,
    pub request_time_sum_ms: u64,
    pub request_retries: u64,
    pub request_failures: u64,
    pub segments_appended: u64,
    pub quota_errors: u64,
    pub forced_gcs: u64,
    pub gc_evictions: u64,
    pub representation_switches: u64,
    pub manifest_updates: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.segments_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64, duration_ms: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.request_time_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.request_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self) {
        self.request_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_append(&self) {
        self.segments_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_error(&self) {
        self.quota_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_gc(&self) {
        self.forced_gcs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gc_eviction(&self) {
        self.gc_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_representation_switch(&self) {
        self.representation_switches
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manifest_update(&self) {
        self.manifest_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Average throughput of segment requests in bits per second.
    pub fn average_throughput_bps(&self) -> Option<f64> {
        let time_ms = self.request_time_sum_ms.load(Ordering::Relaxed);
        if time_ms == 0 {
            return None;
        }
        let bytes = self.bytes_downloaded.load(Ordering::Relaxed);
        Some(bytes as f64 * 8_000.0 / time_ms as f64)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            segments_requested: self.segments_requested.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            request_time_sum_ms: self.request_time_sum_ms.load(Ordering::Relaxed),
            request_retries: self.request_retries.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            segments_appended: self.segments_appended.load(Ordering::Relaxed),
            quota_errors: self.quota_errors.load(Ordering::Relaxed),
            forced_gcs: self.forced_gcs.load(Ordering::Relaxed),
            gc_evictions: self.gc_evictions.load(Ordering::Relaxed),
            representation_switches: self.representation_switches.load(Ordering::Relaxed),
            manifest_updates: self.manifest_updates.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            segments_requested = snapshot.segments_requested,
            segments_appended = snapshot.segments_appended,
            bytes_downloaded = snapshot.bytes_downloaded,
            average_throughput_kbps = self
                .average_throughput_bps()
                .map(|bps| format!("{:.1}", bps / 1_000.0)),
            request_retries = snapshot.request_retries,
            request_failures = snapshot.request_failures,
            quota_errors = snapshot.quota_errors,
            forced_gcs = snapshot.forced_gcs,
            gc_evictions = snapshot.gc_evictions,
            representation_switches = snapshot.representation_switches,
            manifest_updates = snapshot.manifest_updates,
            "Buffer engine summary"
        );
    }
}
