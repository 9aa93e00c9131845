//! Low-pass FIR prototype design.
//!
//! The resampler's anti-aliasing/anti-imaging kernels are windowed-sinc
//! low-pass filters with a Kaiser window. The Kaiser window is used
//! (rather than a fixed window) because the stopband attenuation and the
//! transition width are both caller-specified: beta and the tap count fall
//! out of the standard estimation formulas.
//!
//! The impulse response of the linear-phase prototype is
//! `h[n] = sinc(cutoff * (n - M/2)) * kaiser(n, beta)`, normalized to
//! unity gain at DC. The passband edge sits at `cutoff - transition/2`
//! and the stopband edge at `cutoff + transition/2`, symmetric about the
//! nominal cutoff.
//!
//! Minimum-phase kernels are derived from the linear-phase prototype by
//! cepstral reflection of the zeros inside the unit circle; magnitude
//! response is preserved while the impulse response becomes front-loaded.
//!
//! Reference: A. V. Oppenheim and R. W. Schafer, *Discrete-Time Signal
//! Processing*, 3rd ed., Sections 7.5 (Kaiser design) and 13.5
//! (cepstral minimum-phase construction).

use std::f64::consts::PI;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Phase characteristic of a designed kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterPhase {
    /// Symmetric taps, constant group delay of (N-1)/2 samples.
    #[default]
    Linear,
    /// Cepstrally-derived minimum phase, energy packed at the front.
    Minimum,
}

/// An immutable FIR kernel plus the metadata the resampler needs.
///
/// Taps are kept in f64 regardless of the pipeline precision; stages
/// narrow them once at construction.
#[derive(Debug, Clone)]
pub struct FirPrototype {
    taps: Vec<f64>,
    /// Nominal cutoff as a fraction of Nyquist, in (0, 1).
    cutoff: f64,
    /// Group delay in samples at the kernel's own rate.
    group_delay: f64,
}

impl FirPrototype {
    pub fn taps(&self) -> &[f64] {
        &self.taps
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn group_delay(&self) -> f64 {
        self.group_delay
    }

    /// Magnitude response at normalized frequency `f` (fraction of
    /// Nyquist). Direct evaluation; intended for tests and diagnostics.
    pub fn magnitude_at(&self, f: f64) -> f64 {
        let mut re = 0.0;
        let mut im = 0.0;
        for (n, &h) in self.taps.iter().enumerate() {
            let phase = PI * f * n as f64;
            re += h * phase.cos();
            im -= h * phase.sin();
        }
        (re * re + im * im).sqrt()
    }
}

/// Zeroth-order modified Bessel function of the first kind.
///
/// Power-series evaluation; converges quickly for the beta range produced
/// by [`kaiser_beta`] (< 20).
fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut sum = 1.0;
    let mut term = 1.0;
    for k in 1..64 {
        term *= half / k as f64;
        let t = term * term;
        sum += t;
        if t < sum * 1e-18 {
            break;
        }
    }
    sum
}

/// Kaiser window shape parameter for a target stopband attenuation in dB.
pub fn kaiser_beta(attenuation_db: f64) -> f64 {
    if attenuation_db > 50.0 {
        0.1102 * (attenuation_db - 8.7)
    } else if attenuation_db > 21.0 {
        0.5842 * (attenuation_db - 21.0).powf(0.4) + 0.07886 * (attenuation_db - 21.0)
    } else {
        0.0
    }
}

/// Estimated tap count for a Kaiser design, forced odd.
///
/// `transition` is the transition-band width as a fraction of Nyquist.
pub fn kaiser_length(attenuation_db: f64, transition: f64) -> usize {
    let delta_omega = PI * transition.max(1e-6);
    let n = ((attenuation_db - 7.95) / (2.285 * delta_omega)).ceil() as usize + 1;
    // Type I (odd) so the group delay is an integer number of samples.
    if n % 2 == 0 {
        n + 1
    } else {
        n
    }
}

/// Design a linear-phase windowed-sinc low-pass prototype.
///
/// * `cutoff` - nominal cutoff as a fraction of Nyquist, in (0, 1)
/// * `transition` - transition width as a fraction of Nyquist
/// * `attenuation_db` - target stopband attenuation
///
/// The tap count follows from the Kaiser estimate, the sinc is centred on
/// `cutoff`, and the result is normalized to unity DC gain.
pub fn design_lowpass(cutoff: f64, transition: f64, attenuation_db: f64) -> FirPrototype {
    assert!(
        cutoff > 0.0 && cutoff < 1.0,
        "cutoff must be a fraction of Nyquist in (0, 1), got {cutoff}"
    );
    assert!(transition > 0.0, "transition width must be positive");

    let num_taps = kaiser_length(attenuation_db, transition);
    let beta = kaiser_beta(attenuation_db);
    let m = (num_taps - 1) as f64;
    let i0_beta = bessel_i0(beta);

    let mut taps = Vec::with_capacity(num_taps);
    for n in 0..num_taps {
        let x = n as f64 - m / 2.0;

        let sinc = if x.abs() < 1e-9 {
            cutoff
        } else {
            (PI * cutoff * x).sin() / (PI * x)
        };

        // Kaiser window: I0(beta * sqrt(1 - (2n/M - 1)^2)) / I0(beta)
        let r = 2.0 * n as f64 / m - 1.0;
        let window = bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / i0_beta;

        taps.push(sinc * window);
    }

    // Unity DC gain.
    let sum: f64 = taps.iter().sum();
    if sum.abs() > 1e-12 {
        for t in taps.iter_mut() {
            *t /= sum;
        }
    }

    FirPrototype {
        taps,
        cutoff,
        group_delay: m / 2.0,
    }
}

/// Derive the minimum-phase counterpart of a linear-phase prototype.
///
/// Homomorphic (cepstral) construction: take the log-magnitude spectrum,
/// fold the real cepstrum onto its causal half, and exponentiate back.
/// The magnitude response is preserved; the group delay collapses toward
/// zero, so the prototype reports a delay of 0 and the controller does
/// not trim the onset.
pub fn minimum_phase(prototype: &FirPrototype) -> FirPrototype {
    let len = prototype.taps.len();
    // Generous zero-padding keeps the cepstrum aliasing far below the
    // stopband floor.
    let fft_len = (len * 8).next_power_of_two().max(4096);

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(fft_len);
    let inverse = planner.plan_fft_inverse(fft_len);

    let mut buf: Vec<Complex<f64>> = prototype
        .taps
        .iter()
        .map(|&t| Complex::new(t, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(fft_len)
        .collect();
    forward.process(&mut buf);

    // Log magnitude with a floor to keep deep stopband nulls finite.
    let peak_mag = buf.iter().map(|c| c.norm()).fold(0.0f64, f64::max);
    let floor = peak_mag * 1e-10;
    for c in buf.iter_mut() {
        *c = Complex::new(c.norm().max(floor).ln(), 0.0);
    }

    // Real cepstrum.
    inverse.process(&mut buf);
    let scale = 1.0 / fft_len as f64;
    for c in buf.iter_mut() {
        *c *= scale;
    }

    // Fold onto the causal half: keep c[0] and c[N/2], double 1..N/2,
    // zero the rest.
    for (i, c) in buf.iter_mut().enumerate() {
        if i == 0 || i == fft_len / 2 {
            // unchanged
        } else if i < fft_len / 2 {
            *c *= 2.0;
        } else {
            *c = Complex::new(0.0, 0.0);
        }
    }

    forward.process(&mut buf);
    for c in buf.iter_mut() {
        *c = c.exp();
    }
    inverse.process(&mut buf);

    let mut taps: Vec<f64> = buf.iter().take(len).map(|c| c.re * scale).collect();

    // Re-pin DC gain to the linear prototype's (numerical drift from the
    // two transform round trips is tiny but measurable).
    let target: f64 = prototype.taps.iter().sum();
    let sum: f64 = taps.iter().sum();
    if sum.abs() > 1e-12 {
        let g = target / sum;
        for t in taps.iter_mut() {
            *t *= g;
        }
    }

    FirPrototype {
        taps,
        cutoff: prototype.cutoff,
        group_delay: 0.0,
    }
}
