//! Numeric scalar abstraction over the pipeline's sample type.
//!
//! The converter runs entirely in one floating-point width chosen at
//! startup (`--doubleprecision` selects f64). Every DSP stage is generic
//! over [`Scalar`] so there is a single implementation of the pipeline
//! rather than duplicated float/double code paths.
//!
//! Filter design always happens in f64 and is narrowed to the pipeline
//! scalar when stages are built; see [`crate::fir`].

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub};

/// Floating-point sample type used throughout the conversion pipeline.
pub trait Scalar:
    Copy
    + Debug
    + Default
    + PartialOrd
    + Send
    + Sync
    + Add<Output = Self>
    + AddAssign
    + Sub<Output = Self>
    + Mul<Output = Self>
    + MulAssign
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    const ZERO: Self;
    const ONE: Self;

    /// Number of bits in the mantissa, used to pick sensible quantizer caps.
    const MANTISSA_BITS: u32;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    fn abs(self) -> Self;
    fn round(self) -> Self;

    /// `max` that ignores NaN ordering concerns (samples are finite by
    /// construction).
    fn max_value(self, other: Self) -> Self {
        if other > self { other } else { self }
    }
}

impl Scalar for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const MANTISSA_BITS: u32 = 24;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn abs(self) -> Self {
        f32::abs(self)
    }

    #[inline]
    fn round(self) -> Self {
        f32::round(self)
    }
}

impl Scalar for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const MANTISSA_BITS: u32 = 53;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn abs(self) -> Self {
        f64::abs(self)
    }

    #[inline]
    fn round(self) -> Self {
        f64::round(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak<T: Scalar>(samples: &[T]) -> T {
        samples
            .iter()
            .fold(T::ZERO, |acc, s| acc.max_value(s.abs()))
    }

    #[test]
    fn generic_peak_matches_concrete() {
        let buf = [0.25f32, -0.75, 0.5];
        assert_eq!(peak(&buf), 0.75);

        let buf = [0.25f64, -0.75, 0.5];
        assert_eq!(peak(&buf), 0.75);
    }

    #[test]
    fn round_trips_through_f64() {
        assert_eq!(f32::from_f64(0.5f32.to_f64()), 0.5f32);
        assert_eq!(f64::from_f64(0.5f64.to_f64()), 0.5f64);
    }
}
