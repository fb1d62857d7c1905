// Buffer Garbage Collector: evicts buffered media far from the playhead.
//
// Regular collection runs every time a sink becomes idle and removes what lies outside
// `[t - max_buffer_behind, t + max_buffer_ahead]`, furthest first, without ever touching
// the buffered range containing the playhead. Forced collection is the recovery path
// for quota errors and is allowed to trim that range, keeping a gap around `t`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bookkeeper::SegmentBookkeeper;
use crate::clock::ClockTick;
use crate::config::{BufferConfig, ForcedGcConfig};
use crate::error::SinkError;
use crate::metrics::EngineMetrics;
use crate::ranges::{RANGE_EPSILON, TimeRange};
use crate::sink::SinkHandle;

/// Ranges to evict so that only `[t - max_behind, t + max_ahead]` remains, plus the
/// range containing `t`. Sorted from the furthest to the closest to `t`.
pub fn select_gc_ranges(
    buffered: &[TimeRange],
    current_time: f64,
    max_behind: Option<f64>,
    max_ahead: Option<f64>,
) -> Vec<TimeRange> {
    let keep_from = max_behind.map_or(f64::NEG_INFINITY, |b| current_time - b);
    let keep_to = max_ahead.map_or(f64::INFINITY, |a| current_time + a);

    let mut selected: Vec<TimeRange> = Vec::new();
    for range in buffered {
        if range.start - RANGE_EPSILON <= current_time && current_time < range.end {
            continue;
        }
        if range.end <= current_time {
            if range.start < keep_from {
                let end = range.end.min(keep_from);
                if end - range.start > RANGE_EPSILON {
                    selected.push(TimeRange::new(range.start, end));
                }
            }
        } else if range.end > keep_to {
            let start = range.start.max(keep_to);
            if range.end - start > RANGE_EPSILON {
                selected.push(TimeRange::new(start, range.end));
            }
        }
    }
    sort_furthest_first(&mut selected, current_time);
    selected
}

/// Everything further than `gap` seconds from `current_time`, including parts of the
/// range containing it.
pub fn select_forced_gc_ranges(buffered: &[TimeRange], current_time: f64, gap: f64) -> Vec<TimeRange> {
    let mut selected = crate::ranges::exclude(buffered, current_time - gap, current_time + gap);
    sort_furthest_first(&mut selected, current_time);
    selected
}

fn sort_furthest_first(ranges: &mut [TimeRange], time: f64) {
    ranges.sort_by(|a, b| b.distance_to(time).total_cmp(&a.distance_to(time)));
}

/// Removes `ranges` through the sink queue, keeping the bookkeeper in sync.
async fn evict(
    sink: &SinkHandle,
    bookkeeper: &Mutex<SegmentBookkeeper>,
    ranges: &[TimeRange],
    metrics: &EngineMetrics,
) -> Result<(), SinkError> {
    for range in ranges {
        debug!(track = %sink.track_type(), start = range.start, end = range.end, "Evicting buffered range");
        sink.remove(range.start, range.end).await?;
        bookkeeper.lock().remove(range.start, range.end);
        metrics.record_gc_eviction();
    }
    Ok(())
}

/// Frees space after a quota error. Returns whether anything was removed.
pub async fn force_collect(
    sink: &SinkHandle,
    bookkeeper: &Mutex<SegmentBookkeeper>,
    current_time: f64,
    config: &ForcedGcConfig,
    metrics: &EngineMetrics,
) -> Result<bool, SinkError> {
    metrics.record_forced_gc();
    let buffered = sink.buffered().await?;

    let mut ranges = select_forced_gc_ranges(&buffered, current_time, config.calm_gap);
    if ranges.is_empty() {
        ranges = select_forced_gc_ranges(&buffered, current_time, config.beefy_gap);
    }
    info!(
        track = %sink.track_type(),
        current_time,
        ranges = ranges.len(),
        "Running forced garbage collection"
    );
    evict(sink, bookkeeper, &ranges, metrics).await?;
    Ok(!ranges.is_empty())
}

/// Collection loop attached to a sink for its whole lifetime.
pub(crate) async fn run_collector(
    sink: SinkHandle,
    bookkeeper: Arc<Mutex<SegmentBookkeeper>>,
    clock: watch::Receiver<ClockTick>,
    config: watch::Receiver<BufferConfig>,
    metrics: Arc<EngineMetrics>,
    token: CancellationToken,
) {
    let mut idle = sink.subscribe_idle();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            changed = idle.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let (max_behind, max_ahead) = {
            let config = config.borrow();
            (config.max_buffer_behind, config.max_buffer_ahead)
        };
        if max_behind.is_none() && max_ahead.is_none() {
            continue;
        }
        let current_time = clock.borrow().current_time;
        let buffered = match sink.buffered().await {
            Ok(buffered) => buffered,
            Err(_) => break,
        };
        let ranges = select_gc_ranges(&buffered, current_time, max_behind, max_ahead);
        if ranges.is_empty() {
            continue;
        }
        if let Err(e) = evict(&sink, &bookkeeper, &ranges, &metrics).await {
            warn!(track = %sink.track_type(), error = %e, "Garbage collection failed");
            break;
        }
    }
    debug!(track = %sink.track_type(), "Garbage collector stopped");
}
