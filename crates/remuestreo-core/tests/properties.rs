//! Property-based tests for the conversion DSP primitives.
//!
//! Covers the output-count contract of the resampler across arbitrary
//! block splits, quantization-grid and determinism properties of the
//! ditherer, and fraction reduction invariants.

use proptest::prelude::*;
use remuestreo_core::{
    Ditherer, DitherProfile, Fraction, Resampler, ResamplerSpec, StageMode,
};

const RATES: &[u32] = &[8_000, 11_025, 22_050, 32_000, 44_100, 48_000, 88_200, 96_000];

fn fast_spec(fin: u32, fout: u32, max_stages: usize) -> ResamplerSpec {
    let mut spec =
        ResamplerSpec::with_defaults(Fraction::from_rates(fin, fout).unwrap(), fin, fout);
    // Short kernels keep the property suite quick; the count contract is
    // independent of kernel length.
    spec.attenuation_db = 70.0;
    spec.mode = StageMode::Multi { max_stages };
    spec
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Feeding any chunking of `total` samples produces exactly
    /// ceil(total * L / M) outputs, independent of the split points.
    #[test]
    fn resampler_count_contract(
        fin_idx in 0usize..RATES.len(),
        fout_idx in 0usize..RATES.len(),
        chunks in prop::collection::vec(1usize..600, 1..6),
        max_stages in 1usize..4,
    ) {
        let (fin, fout) = (RATES[fin_idx], RATES[fout_idx]);
        let spec = fast_spec(fin, fout, max_stages);
        let mut resampler = Resampler::<f32>::new(&spec, 600).unwrap();

        let mut buf = Vec::with_capacity(resampler.max_output_len(600));
        let mut fed = 0u64;
        let mut produced = 0u64;
        for len in chunks {
            let produced_now = resampler.process(&vec![0.0f32; len], &mut buf);
            fed += len as u64;
            produced += produced_now as u64;
            let expected = (fed * spec.fraction.numerator)
                .div_ceil(spec.fraction.denominator);
            prop_assert_eq!(produced, expected,
                "{} -> {} after {} samples", fin, fout, fed);
        }
    }

    /// Dithered output always lies on the target quantization grid and is
    /// reproducible from the same seed.
    #[test]
    fn dither_grid_and_determinism(
        bits in 2u32..25,
        seed in any::<u64>(),
        input in prop::collection::vec(-1.0f64..=1.0f64, 64..256),
        profile_id in 0i32..5,
    ) {
        let profile = DitherProfile::from_id(profile_id).unwrap();
        let mut a = Ditherer::<f64>::new(bits, 1.0, profile, false, seed);
        let mut b = Ditherer::<f64>::new(bits, 1.0, profile, false, seed);

        let scale = (f64::from(bits) - 1.0).exp2();
        for &x in &input {
            let qa = a.dither(x);
            let qb = b.dither(x);
            prop_assert_eq!(qa, qb, "seeded ditherers diverged");
            let steps = qa * scale;
            prop_assert!((steps - steps.round()).abs() < 1e-9,
                "off-grid sample {} at {} bits", qa, bits);
        }
    }

    /// Reduction always yields coprime factors satisfying L*Fin == M*Fout.
    #[test]
    fn fraction_reduction_invariant(fin in 1u32..400_000, fout in 1u32..400_000) {
        let f = Fraction::from_rates(fin, fout).unwrap();
        prop_assert_eq!(f.numerator * u64::from(fin), f.denominator * u64::from(fout));
        prop_assert_eq!(remuestreo_core::fraction::gcd(f.numerator, f.denominator), 1);
    }

    /// Resampler state reset gives a bit-identical second run.
    #[test]
    fn resampler_reset_is_idempotent(
        seed_samples in prop::collection::vec(-1.0f32..=1.0f32, 128..512),
    ) {
        let spec = fast_spec(48_000, 44_100, 3);
        let mut resampler = Resampler::<f32>::new(&spec, 512).unwrap();
        let mut first = Vec::with_capacity(resampler.max_output_len(512));
        let mut second = Vec::with_capacity(resampler.max_output_len(512));

        resampler.process(&seed_samples, &mut first);
        resampler.reset();
        resampler.process(&seed_samples, &mut second);
        prop_assert_eq!(&first, &second);
    }
}
