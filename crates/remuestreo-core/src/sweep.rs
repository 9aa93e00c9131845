//! Exponential sine-sweep test signal.
//!
//! Generates the log-swept sine used for converter measurement: constant
//! amplitude, frequency rising exponentially over a whole number of
//! octaves, with the sample count padded so the sweep ends on a phase
//! boundary.

/// Generate an exponential sweep.
///
/// * `sample_rate` - output rate in Hz
/// * `duration_secs` - approximate length; rounded so the sweep spans an
///   integral number of phase cycles
/// * `octaves` - frequency span in octaves
/// * `amplitude_db` - level in dBFS
pub fn exp_sweep(sample_rate: u32, duration_secs: f64, octaves: u32, amplitude_db: f64) -> Vec<f64> {
    use std::f64::consts::{LN_2, PI};

    let pow2p = f64::from(1u32 << octaves);
    let pow2p1 = f64::from(1u32 << (octaves + 1));
    let amplitude = 10f64.powf(amplitude_db / 20.0);

    let m = pow2p1 * f64::from(octaves) * LN_2;
    let n = ((duration_secs * f64::from(sample_rate) / m).round() * m) as usize;
    if n == 0 {
        return Vec::new();
    }

    let y = pow2p.ln();
    let c = (n as f64 * PI / pow2p) / y;
    let two_pi = 2.0 * PI;

    (0..n)
        .map(|i| amplitude * ((c * (y * i as f64 / n as f64).exp()) % two_pi).sin())
        .collect()
}
