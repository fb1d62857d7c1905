use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "bufsim",
    version,
    about = "Simulates a playback session against the buffer engine"
)]
pub struct Args {
    /// Session length, in seconds of simulated wall-clock time
    #[arg(short, long, default_value_t = 120.0)]
    pub duration: f64,

    /// Number of Periods in the synthetic manifest
    #[arg(long, default_value_t = 1)]
    pub periods: u32,

    /// Length of each Period, in seconds
    #[arg(long, default_value_t = 60)]
    pub period_length: u64,

    /// Segment duration, in seconds
    #[arg(long, default_value_t = 2)]
    pub segment_duration: u64,

    /// Video bitrates, in bits per second
    #[arg(long, value_delimiter = ',', default_values_t = [400_000u64, 1_200_000, 3_000_000])]
    pub bitrates: Vec<u64>,

    /// Audio bitrate, in bits per second
    #[arg(long, default_value_t = 128_000)]
    pub audio_bitrate: u64,

    /// Simulated network throughput, in bits per second
    #[arg(short, long, default_value_t = 5_000_000.0)]
    pub throughput: f64,

    /// Per-request latency, in milliseconds
    #[arg(long, default_value_t = 40)]
    pub latency_ms: u64,

    /// Throughput change during the session, as `AT_SECS:BITS_PER_SEC`
    #[arg(long, value_parser = parse_pair)]
    pub throughput_change: Option<(f64, f64)>,

    /// Initial playback position, in seconds
    #[arg(long, default_value_t = 0.0)]
    pub start: f64,

    /// Seek during the session, as `AT_SECS:TARGET_SECS`
    #[arg(long, value_parser = parse_pair)]
    pub seek: Option<(f64, f64)>,

    /// Simulate a live stream refreshed through the manifest loader
    #[arg(long)]
    pub live: bool,

    /// JSON file overriding the buffer configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Video sink capacity, in bytes
    #[arg(long)]
    pub video_quota: Option<usize>,

    /// Run on the real clock instead of the simulated one
    #[arg(long)]
    pub realtime: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Parses `A:B` into two numbers.
fn parse_pair(s: &str) -> Result<(f64, f64), String> {
    let (a, b) = s
        .split_once(':')
        .ok_or_else(|| format!("expected `A:B`, got `{s}`"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid number `{v}`: {e}"))
    };
    Ok((parse(a)?, parse(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("30:1500000"), Ok((30.0, 1_500_000.0)));
        assert_eq!(parse_pair(" 12.5 : 300 "), Ok((12.5, 300.0)));
        assert!(parse_pair("30").is_err());
        assert!(parse_pair("a:1").is_err());
    }

    #[test]
    fn test_defaults_and_lists() {
        let args = Args::parse_from(["bufsim", "--bitrates", "100000,200000", "--seek", "10:50"]);
        assert_eq!(args.bitrates, vec![100_000, 200_000]);
        assert_eq!(args.seek, Some((10.0, 50.0)));
        assert_eq!(args.periods, 1);
        assert!(!args.live);
    }
}
