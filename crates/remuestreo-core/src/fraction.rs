//! Rational conversion-ratio reduction.
//!
//! A sample-rate conversion from Fin to Fout is performed as upsampling by
//! L and downsampling by M, where L/M = Fout/Fin in lowest terms. The
//! invariant `L * Fin == M * Fout` holds after reduction.

use thiserror::Error;

/// Errors raised while deriving a conversion ratio.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateError {
    #[error("sample rate must be positive (got input {input} Hz, output {output} Hz)")]
    NonPositiveRate { input: u32, output: u32 },
}

/// A reduced rational conversion ratio L/M.
///
/// `numerator` is the upsampling factor L, `denominator` the downsampling
/// factor M. Always stored in lowest terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: u64,
    pub denominator: u64,
}

impl Fraction {
    /// Reduce an input/output rate pair to coprime (L, M).
    pub fn from_rates(input_rate: u32, output_rate: u32) -> Result<Self, RateError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(RateError::NonPositiveRate {
                input: input_rate,
                output: output_rate,
            });
        }
        let g = gcd(u64::from(output_rate), u64::from(input_rate));
        Ok(Self {
            numerator: u64::from(output_rate) / g,
            denominator: u64::from(input_rate) / g,
        })
    }

    /// Multiply the upsampling factor and re-reduce.
    ///
    /// Used when the input is decoded at a notional oversampled rate (DSD)
    /// and the ratio must account for the extra factor.
    pub fn with_oversampling(self, factor: u64) -> Self {
        let n = self.numerator * factor.max(1);
        let g = gcd(n, self.denominator);
        Self {
            numerator: n / g,
            denominator: self.denominator / g,
        }
    }

    /// Conversion ratio as a float (Fout / Fin).
    pub fn ratio(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Whether this fraction leaves the signal untouched rate-wise.
    pub fn is_unity(&self) -> bool {
        self.numerator == 1 && self.denominator == 1
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.numerator, self.denominator)
    }
}

/// Greatest common divisor (Euclid).
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Factor `n` over the small primes {2, 3, 5, 7}.
///
/// Any residue with only larger prime factors is kept whole as a final
/// factor; the multi-stage planner treats such a value as indivisible.
pub fn small_prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    if n <= 1 {
        return factors;
    }
    for p in [2u64, 3, 5, 7] {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}
