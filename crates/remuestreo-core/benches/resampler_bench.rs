//! Throughput benchmarks for the polyphase resampler and the ditherer.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use remuestreo_core::{
    Ditherer, DitherProfile, Fraction, Resampler, ResamplerSpec, StageMode,
};

const BLOCK: usize = 8192;

fn sine_block() -> Vec<f64> {
    (0..BLOCK)
        .map(|i| (2.0 * std::f64::consts::PI * 997.0 * i as f64 / 48_000.0).sin() * 0.7)
        .collect()
}

fn bench_resampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("resampler");
    group.throughput(Throughput::Elements(BLOCK as u64));

    for (name, mode) in [
        ("48k_to_44k1_multi", StageMode::Multi { max_stages: 3 }),
        ("48k_to_44k1_single", StageMode::Single),
    ] {
        let mut spec = ResamplerSpec::with_defaults(
            Fraction::from_rates(48_000, 44_100).unwrap(),
            48_000,
            44_100,
        );
        spec.mode = mode;
        let mut resampler = Resampler::<f64>::new(&spec, BLOCK).unwrap();
        let input = sine_block();
        let mut out = Vec::with_capacity(resampler.max_output_len(BLOCK));

        group.bench_function(name, |b| {
            b.iter(|| {
                resampler.process(black_box(&input), &mut out);
                black_box(out.len())
            })
        });
    }
    group.finish();
}

fn bench_ditherer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ditherer");
    group.throughput(Throughput::Elements(BLOCK as u64));

    for profile in [DitherProfile::Flat, DitherProfile::Standard, DitherProfile::Wannamaker9] {
        let mut ditherer = Ditherer::<f64>::new(16, 1.0, profile, false, 42);
        let input = sine_block();
        group.bench_function(profile.name(), |b| {
            b.iter(|| {
                let mut acc = 0.0;
                for &x in &input {
                    acc += ditherer.dither(black_box(x));
                }
                black_box(acc)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_resampler, bench_ditherer);
criterion_main!(benches);
