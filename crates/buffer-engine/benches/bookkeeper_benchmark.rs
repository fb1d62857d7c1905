use std::hint::black_box;

use buffer_engine::{SegmentBookkeeper, TimeRange};
use buffer_engine::ranges;
use criterion::{Criterion, criterion_group, criterion_main};

/// Two-second segments covering `[0, count * 2)`, alternating between two bitrates.
fn filled_bookkeeper(count: u64) -> SegmentBookkeeper {
    let mut bookkeeper = SegmentBookkeeper::new();
    for n in 0..count {
        let bitrate = if n % 2 == 0 { 500_000 } else { 1_500_000 };
        bookkeeper.insert(bitrate, n as f64 * 2.0, n as f64 * 2.0 + 2.0);
    }
    bookkeeper
}

/// Buffered ranges with a one-second hole every `every` segments.
fn fragmented_ranges(count: u64, every: u64) -> Vec<TimeRange> {
    let mut buffered = Vec::new();
    let mut start = 0.0;
    for n in (every..count).step_by(every as usize) {
        let hole = n as f64 * 2.0;
        buffered.push(TimeRange::new(start, hole));
        start = hole + 1.0;
    }
    buffered.push(TimeRange::new(start, count as f64 * 2.0));
    buffered
}

fn benchmark_bookkeeper(c: &mut Criterion) {
    let mut group = c.benchmark_group("Segment Bookkeeper");

    group.bench_function("Insert 1800 segments", |b| {
        b.iter(|| black_box(filled_bookkeeper(black_box(1_800))))
    });

    let bookkeeper = filled_bookkeeper(1_800);
    group.bench_function("Lookup (has_range)", |b| {
        b.iter(|| {
            for n in (0..1_800).step_by(7) {
                black_box(bookkeeper.has_range(black_box(n as f64 * 2.0), 2.0));
            }
        })
    });

    let buffered = fragmented_ranges(1_800, 10);
    group.bench_function("Intersect with fragmented sink", |b| {
        b.iter(|| {
            let mut bookkeeper = filled_bookkeeper(1_800);
            bookkeeper.intersect(black_box(&buffered));
            black_box(bookkeeper.ranges().len())
        })
    });

    group.bench_function("Exclude playhead margin", |b| {
        b.iter(|| black_box(ranges::exclude(black_box(&buffered), 1_000.0, 1_030.0)))
    });

    group.finish();
}

criterion_group!(benches, benchmark_bookkeeper);
criterion_main!(benches);
