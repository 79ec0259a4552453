//! Criterion benchmarks for the waveform codec.
//!
//! Encoding and serializing a waveform sits on the upload path; the largest
//! arbitrary waveforms the instrument holds are a few million points.
//!
//! Run with: cargo bench --bench waveform_encode

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_fgen::waveform::{decode_catalog, encode};

fn sine(points: usize) -> Vec<f64> {
    (0..points)
        .map(|i| (i as f64 / points as f64 * std::f64::consts::TAU).sin())
        .collect()
}

/// Scaling to DAC codes and producing the wire text.
fn encode_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("waveform_encode");

    for points in [1_000usize, 16_000, 256_000, 1_000_000] {
        let samples = sine(points);
        group.throughput(Throughput::Elements(points as u64));

        group.bench_with_input(BenchmarkId::new("codes", points), &samples, |b, s| {
            b.iter(|| encode(black_box(s)));
        });
        group.bench_with_input(BenchmarkId::new("wire", points), &samples, |b, s| {
            b.iter(|| encode(black_box(s)).to_wire());
        });
    }

    group.finish();
}

fn catalog_decode(c: &mut Criterion) {
    let mut listing = String::from("+8192,+4186112");
    for i in 0..500 {
        listing.push_str(&format!(",\"wave{:03}.arb,ARB,16\"", i));
    }

    c.bench_function("catalog_decode_500", |b| {
        b.iter(|| decode_catalog(black_box(&listing), "arb"));
    });
}

criterion_group!(benches, encode_throughput, catalog_decode);
criterion_main!(benches);
