//! Criterion benchmarks for the frame codec and control parsing.
//!
//! Run with:
//! ```bash
//! cargo bench --package bridgemux-core --bench codec_bench
//! ```

use bridgemux_core::protocol::control::Control;
use bridgemux_core::protocol::encoding::PayloadEncoding;
use bridgemux_core::protocol::frame::{decode_frame, encode_frame, Payload, WireMessage};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn text_payload(len: usize) -> Payload {
    Payload::Text("x".repeat(len))
}

fn binary_payload(len: usize) -> Payload {
    Payload::Binary((0..len).map(|i| (i % 251) as u8).collect())
}

const SIZES: &[usize] = &[16, 1024, 16 * 1024];

// ── Benchmarks ────────────────────────────────────────────────────────────────

/// Benchmarks `encode_frame` for text and binary payloads of several sizes.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    for &size in SIZES {
        let text = text_payload(size);
        group.bench_with_input(BenchmarkId::new("text", size), &text, |b, payload| {
            b.iter(|| encode_frame(black_box("4"), black_box(payload)).unwrap())
        });
        let binary = binary_payload(size);
        group.bench_with_input(BenchmarkId::new("binary", size), &binary, |b, payload| {
            b.iter(|| encode_frame(black_box("4"), black_box(payload)).unwrap())
        });
    }
    group.finish();
}

/// Benchmarks `decode_frame` from pre-encoded wire messages.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");
    for &size in SIZES {
        let text = encode_frame("4", &text_payload(size)).unwrap();
        group.bench_with_input(BenchmarkId::new("text", size), &text, |b, wire| {
            b.iter(|| decode_frame(black_box(wire.clone())).unwrap())
        });
        let binary = encode_frame("4", &binary_payload(size)).unwrap();
        group.bench_with_input(BenchmarkId::new("binary", size), &binary, |b, wire| {
            b.iter(|| decode_frame(black_box(wire.clone())).unwrap())
        });
    }
    group.finish();
}

/// Benchmarks the base64 fallback used when the transport lacks binary frames.
fn bench_base64_fallback(c: &mut Criterion) {
    let mut group = c.benchmark_group("base64_fallback");
    let payload = binary_payload(16 * 1024);
    group.bench_function("encode_16k", |b| {
        b.iter(|| PayloadEncoding::Base64.encode(black_box(payload.clone())))
    });
    let encoded = PayloadEncoding::Base64.encode(payload);
    group.bench_function("decode_16k", |b| {
        b.iter(|| PayloadEncoding::Base64.decode(black_box(encoded.clone())).unwrap())
    });
    group.finish();
}

/// Benchmarks parsing of a typical `open` control frame.
fn bench_control_parse(c: &mut Criterion) {
    let wire = WireMessage::Text(
        "\n{\"command\":\"open\",\"channel\":\"4\",\"payload\":\"stream\",\"spawn\":[\"ls\",\"-l\"],\"host\":\"localhost\"}"
            .to_string(),
    );
    let frame = decode_frame(wire).unwrap();
    c.bench_function("control_parse_open", |b| {
        b.iter(|| Control::parse(black_box(&frame.payload)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_base64_fallback,
    bench_control_parse
);
criterion_main!(benches);
