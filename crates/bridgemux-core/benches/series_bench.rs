//! Criterion benchmarks for metrics decompression and the series store.
//!
//! Run with:
//! ```bash
//! cargo bench --package bridgemux-core --bench series_bench
//! ```

use bridgemux_core::metrics::MetricsDecoder;
use bridgemux_core::series::{SeriesIndex, SeriesSink, SeriesGrid, Timestep, PRIVATE_LIMIT};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn meta() -> Value {
    json!({
        "timestamp": 0,
        "now": 0,
        "interval": 1000,
        "metrics": [
            { "name": "cpu.basic.user", "units": "millisec", "derive": "rate" },
            { "name": "mem.used", "units": "bytes" },
            { "name": "disk.dev.read", "units": "bytes", "instances": ["sda", "sdb", "nvme0n1"] }
        ]
    })
}

/// A data message of `rows` rows where every other row repeats the previous
/// values as nulls.
fn data(rows: usize) -> Value {
    let rows: Vec<Value> = (0..rows)
        .map(|i| {
            if i % 2 == 0 {
                json!([i, i * 1024, [i, i + 1, i + 2]])
            } else {
                json!([null, null, [null, i + 1]])
            }
        })
        .collect();
    Value::Array(rows)
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

/// Benchmarks decompressing a data message after a meta.
fn bench_decompress(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics_decompress");
    for &rows in &[1usize, 60, 600] {
        let message = data(rows);
        group.bench_with_input(BenchmarkId::new("rows", rows), &message, |b, message| {
            b.iter(|| {
                let mut decoder = MetricsDecoder::new(1000);
                decoder.feed(meta(), 0.0).unwrap();
                decoder.feed(black_box(message.clone()), 0.0).unwrap()
            })
        });
    }
    group.finish();
}

/// Benchmarks stashing overlapping blocks into a bounded index.
fn bench_stash(c: &mut Criterion) {
    c.bench_function("series_stash_overlapping", |b| {
        b.iter(|| {
            let mut index = SeriesIndex::new(PRIVATE_LIMIT);
            for beg in 0..256i64 {
                let items = (0..8).map(|i| Some(json!(beg + i))).collect();
                index.stash(black_box(beg * 4), items, None);
            }
            index.count()
        })
    });
}

/// Benchmarks a grid sync served entirely from the cache.
fn bench_grid_sync(c: &mut Criterion) {
    let sink = SeriesSink::new(1000);
    for beg in (0..600i64).step_by(60) {
        let items = (0..60).map(|i| json!({ "cpu": [beg + i] })).collect();
        sink.input(beg, items, None);
    }
    let grid = SeriesGrid::new(1000, 0, Some(Timestep::At(600)));
    grid.add_sink(&sink, "cpu.0").unwrap();

    c.bench_function("grid_sync_cached_600", |b| b.iter(|| grid.sync()));
    grid.close();
}

criterion_group!(benches, bench_decompress, bench_stash, bench_grid_sync);
criterion_main!(benches);
