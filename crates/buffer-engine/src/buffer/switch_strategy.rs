use media_types::{Period, TrackType};
use tracing::debug;

use crate::clock::ClockTick;
use crate::config::SwitchPadding;
use crate::error::BufferError;
use crate::ranges::{self, TimeRange};
use crate::sink_store::SinkContext;

/// What to do with already buffered data when the buffered Adaptation or
/// Representation changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchStrategy {
    /// Keep the buffer as is.
    Continue,
    /// Remove these ranges before buffering the new content.
    CleanBuffer(Vec<TimeRange>),
    /// Buffered data cannot be removed safely, the media pipeline must be rebuilt.
    NeedsReload,
}

/// Decides how to switch content for `period` given what the sink buffered.
///
/// Native sinks already decoding inside the Period need a reload. Otherwise every
/// buffered part of the Period is cleaned, except a margin around the playhead.
pub fn adaptation_switch_strategy(
    buffered: &[TimeRange],
    period: &Period,
    track_type: TrackType,
    tick: &ClockTick,
    padding: SwitchPadding,
) -> SwitchStrategy {
    let in_period = ranges::clip(buffered, period.start, period.end_or_infinity());
    if in_period.is_empty() {
        return SwitchStrategy::Continue;
    }

    let time = tick.current_time;
    if track_type.is_native() && period.contains(time) && tick.has_current_data() {
        return SwitchStrategy::NeedsReload;
    }

    let to_clean = ranges::exclude(&in_period, time - padding.before, time + padding.after);
    if to_clean.is_empty() {
        SwitchStrategy::Continue
    } else {
        SwitchStrategy::CleanBuffer(to_clean)
    }
}

/// Computes the strategy for what `sink` holds and performs the removals it asks
/// for before returning.
pub(crate) async fn apply_switch_strategy(
    sink: &SinkContext,
    period: &Period,
    tick: &ClockTick,
    padding: SwitchPadding,
) -> Result<SwitchStrategy, BufferError> {
    let track_type = sink.track_type;
    let buffered = sink
        .handle
        .buffered()
        .await
        .map_err(|e| BufferError::sink(track_type, e))?;
    let strategy = adaptation_switch_strategy(&buffered, period, track_type, tick, padding);
    if let SwitchStrategy::CleanBuffer(to_clean) = &strategy {
        for range in to_clean {
            debug!(track = %track_type, start = range.start, end = range.end, "Cleaning buffer for switch");
            sink.handle
                .remove(range.start, range.end)
                .await
                .map_err(|e| BufferError::sink(track_type, e))?;
            sink.bookkeeper.lock().remove(range.start, range.end);
        }
    }
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReadyState;
    use rstest::rstest;

    fn r(start: f64, end: f64) -> TimeRange {
        TimeRange::new(start, end)
    }

    fn period() -> Period {
        Period::new("p", 10.0, Some(60.0))
    }

    #[test]
    fn test_nothing_buffered_in_period() {
        let buffered = [r(0.0, 9.0), r(70.0, 80.0)];
        let tick = ClockTick::at(20.0).with_ready_state(ReadyState::HaveEnoughData);
        let strategy = adaptation_switch_strategy(
            &buffered,
            &period(),
            TrackType::Video,
            &tick,
            SwitchPadding::new(2.0, 2.5),
        );
        assert_eq!(strategy, SwitchStrategy::Continue);
    }

    #[rstest]
    #[case(TrackType::Audio, ReadyState::HaveCurrentData, 20.0, true)]
    #[case(TrackType::Video, ReadyState::HaveEnoughData, 30.0, true)]
    #[case(TrackType::Video, ReadyState::HaveMetadata, 30.0, false)]
    #[case(TrackType::Video, ReadyState::HaveEnoughData, 5.0, false)]
    #[case(TrackType::Text, ReadyState::HaveEnoughData, 30.0, false)]
    fn test_reload_only_for_decoding_native_sinks(
        #[case] track_type: TrackType,
        #[case] ready_state: ReadyState,
        #[case] time: f64,
        #[case] reload: bool,
    ) {
        let tick = ClockTick::at(time).with_ready_state(ready_state);
        let strategy = adaptation_switch_strategy(
            &[r(10.0, 50.0)],
            &period(),
            track_type,
            &tick,
            SwitchPadding::new(2.0, 2.5),
        );
        assert_eq!(strategy == SwitchStrategy::NeedsReload, reload, "{strategy:?}");
    }

    #[test]
    fn test_clean_keeps_margin_around_playhead() {
        let tick = ClockTick::at(30.0);
        let strategy = adaptation_switch_strategy(
            &[r(0.0, 50.0)],
            &period(),
            TrackType::Text,
            &tick,
            SwitchPadding::new(2.0, 2.5),
        );
        assert_eq!(
            strategy,
            SwitchStrategy::CleanBuffer(vec![r(10.0, 28.0), r(32.5, 50.0)])
        );
    }

    #[test]
    fn test_cleaned_ranges_never_touch_padding_window() {
        let padding = SwitchPadding::new(1.5, 3.0);
        let buffered = [r(10.0, 14.0), r(15.0, 27.0), r(29.0, 45.0), r(50.0, 60.0)];
        for step in 0..120 {
            let time = step as f64 * 0.5;
            let tick = ClockTick::at(time);
            let strategy = adaptation_switch_strategy(&buffered, &period(), TrackType::Image, &tick, padding);
            if let SwitchStrategy::CleanBuffer(cleaned) = strategy {
                let window = r(time - padding.before, time + padding.after);
                for range in cleaned {
                    assert!(range.intersection(&window).is_none(), "{range:?} at {time}");
                    assert!(range.start >= 10.0 && range.end <= 60.0);
                }
            }
        }
    }

    #[test]
    fn test_everything_inside_margin_continues() {
        let tick = ClockTick::at(20.0);
        let strategy = adaptation_switch_strategy(
            &[r(19.0, 21.0)],
            &period(),
            TrackType::Text,
            &tick,
            SwitchPadding::new(2.0, 2.5),
        );
        assert_eq!(strategy, SwitchStrategy::Continue);
    }
}
